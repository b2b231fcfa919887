//! Wire shape of a query message.
//!
//! A query travels as a fixed 23-byte header (MUID, function, TTL, hops,
//! payload length) followed by the query payload: a little-endian "min
//! speed" word that modern servents overload with capability flags, the
//! NUL-terminated search text, and optional extension blocks. The engine
//! treats the payload as opaque except for the flag word; forwarding a
//! query at a different TTL is a byte copy with the TTL byte rewritten.

use crate::Muid;

/// Size of the message header preceding the query payload.
pub const HEADER_SIZE: usize = 23;

/// Function byte of a query message.
pub const FUNCTION_QUERY: u8 = 0x80;

const OFF_MUID: usize = 0;
const OFF_FUNCTION: usize = 16;
const OFF_TTL: usize = 17;
const OFF_HOPS: usize = 18;
const OFF_LENGTH: usize = 19;
const OFF_SPEED: usize = HEADER_SIZE;

/// Capability flags overloaded onto the query's "min speed" field.
///
/// The field is only interpreted as flags when the mark bit is set;
/// legacy servents send a plain speed value with the mark clear.
pub mod speed {
    /// The field carries flags, not a speed.
    pub const MARK: u16 = 0x8000;
    /// The requester is firewalled.
    pub const FIREWALLED: u16 = 0x4000;
    /// The requester wants XML metadata in hits.
    pub const XML: u16 = 0x2000;
    /// The requester supports leaf-guided querying.
    pub const LEAF_GUIDED: u16 = 0x1000;
    /// The requester understands GGEP "H" encoding.
    pub const GGEP_H: u16 = 0x0800;
    /// The requester wants hits delivered out-of-band.
    pub const OOB_REPLY: u16 = 0x0400;
    /// The requester supports firewall-to-firewall transfers.
    pub const FW_TO_FW: u16 = 0x0200;
}

/// Status flags gathered while parsing a query hit.
pub mod hit_status {
    /// The responding servent is firewalled.
    pub const FIREWALLED: u16 = 0x0001;
    /// The responding servent supports firewall-to-firewall transfers.
    pub const FW_TO_FW: u16 = 0x0002;
}

/// A verbatim query message: header plus payload, as received or built.
///
/// Cloning copies the buffer; per-TTL copies are cached by the engine so
/// a query is serialised at most once per TTL used.
#[derive(Clone, PartialEq, Eq)]
pub struct SearchMessage {
    data: Vec<u8>,
}

impl SearchMessage {
    /// Wrap a raw message buffer. Returns `None` when the buffer cannot
    /// hold a query header and flag word.
    pub fn from_bytes(data: Vec<u8>) -> Option<Self> {
        if data.len() < OFF_SPEED + 2 {
            return None;
        }
        Some(Self { data })
    }

    /// Build a query message from parts, for launching local searches
    /// and for tests.
    pub fn query(muid: Muid, ttl: u8, hops: u8, flags: u16, text: &str) -> Self {
        let payload_len = 2 + text.len() + 1;
        let mut data = Vec::with_capacity(HEADER_SIZE + payload_len);
        data.extend_from_slice(muid.as_bytes());
        data.push(FUNCTION_QUERY);
        data.push(ttl);
        data.push(hops);
        data.extend_from_slice(&(payload_len as u32).to_le_bytes());
        data.extend_from_slice(&flags.to_le_bytes());
        data.extend_from_slice(text.as_bytes());
        data.push(0);
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn muid(&self) -> Muid {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.data[OFF_MUID..OFF_MUID + 16]);
        Muid::from_bytes(bytes)
    }

    /// Rewrite the MUID, as done when a query is OOB-proxied.
    pub fn set_muid(&mut self, muid: Muid) {
        self.data[OFF_MUID..OFF_MUID + 16].copy_from_slice(muid.as_bytes());
    }

    pub fn function(&self) -> u8 {
        self.data[OFF_FUNCTION]
    }

    pub fn ttl(&self) -> u8 {
        self.data[OFF_TTL]
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.data[OFF_TTL] = ttl;
    }

    pub fn hops(&self) -> u8 {
        self.data[OFF_HOPS]
    }

    /// Payload length advertised by the header.
    pub fn payload_len(&self) -> u32 {
        u32::from_le_bytes([
            self.data[OFF_LENGTH],
            self.data[OFF_LENGTH + 1],
            self.data[OFF_LENGTH + 2],
            self.data[OFF_LENGTH + 3],
        ])
    }

    /// The "min speed" word, flags included if the mark bit is set.
    pub fn speed_flags(&self) -> u16 {
        u16::from_le_bytes([self.data[OFF_SPEED], self.data[OFF_SPEED + 1]])
    }

    /// Whether the speed field is marked as carrying flags.
    pub fn has_marked_flags(&self) -> bool {
        self.speed_flags() & speed::MARK != 0
    }

    /// Clear the OOB-reply request, forcing hits to route back over the
    /// overlay. Only meaningful on a marked query.
    pub fn strip_oob_flag(&mut self) {
        let flags = self.speed_flags() & !speed::OOB_REPLY;
        self.data[OFF_SPEED..OFF_SPEED + 2].copy_from_slice(&flags.to_le_bytes());
    }

    /// The NUL-terminated search text, when well formed.
    pub fn search_text(&self) -> Option<&str> {
        let payload = &self.data[OFF_SPEED + 2..];
        let end = payload.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&payload[..end]).ok()
    }
}

impl std::fmt::Debug for SearchMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchMessage")
            .field("muid", &self.muid())
            .field("ttl", &self.ttl())
            .field("hops", &self.hops())
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_read_back() {
        let muid = Muid::from_bytes([7; 16]);
        let msg = SearchMessage::query(muid, 4, 1, speed::MARK | speed::OOB_REPLY, "flac");

        assert_eq!(msg.muid(), muid);
        assert_eq!(msg.function(), FUNCTION_QUERY);
        assert_eq!(msg.ttl(), 4);
        assert_eq!(msg.hops(), 1);
        assert_eq!(msg.search_text(), Some("flac"));
        assert_eq!(msg.payload_len() as usize, msg.len() - HEADER_SIZE);
        assert!(msg.has_marked_flags());
    }

    #[test]
    fn set_ttl_only_touches_ttl_byte() {
        let original = SearchMessage::query(Muid::from_bytes([1; 16]), 3, 1, 0, "abc");
        let mut patched = original.clone();
        patched.set_ttl(1);

        assert_eq!(patched.ttl(), 1);
        let diff: Vec<usize> = original
            .as_bytes()
            .iter()
            .zip(patched.as_bytes())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(diff, vec![17]);
    }

    #[test]
    fn strip_oob_flag_clears_only_oob() {
        let flags = speed::MARK | speed::OOB_REPLY | speed::LEAF_GUIDED;
        let mut msg = SearchMessage::query(Muid::random(), 3, 1, flags, "x");
        msg.strip_oob_flag();
        assert_eq!(msg.speed_flags(), speed::MARK | speed::LEAF_GUIDED);
    }

    #[test]
    fn rejects_truncated_buffer() {
        assert!(SearchMessage::from_bytes(vec![0u8; 10]).is_none());
    }
}
