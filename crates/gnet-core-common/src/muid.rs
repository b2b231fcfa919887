//! Message identifiers.

use std::fmt;

use rand::RngCore;

/// 16-byte message identifier, unique per query issuance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Muid(pub [u8; 16]);

impl Muid {
    /// Generate a fresh random MUID.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Muid(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Muid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Muid({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_hex() {
        let muid = Muid::from_bytes([0xab; 16]);
        assert_eq!(muid.to_string(), "ab".repeat(16));
    }

    #[test]
    fn random_muids_differ() {
        assert_ne!(Muid::random(), Muid::random());
    }
}
