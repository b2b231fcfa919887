//! Node and search identifiers.

use std::fmt;

/// Identity of a neighbour node, unique for the lifetime of the process.
///
/// Node identities are never reused, even when the underlying connection
/// slot is: queries key their bookkeeping on the identity, not on whatever
/// object currently represents the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Sentinel identity for the local node (queries we originate ourselves).
    pub const LOCAL: NodeId = NodeId(0);

    /// Whether this is the local-node sentinel.
    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "#local")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Handle of a locally issued search, allocated by the search store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchHandle(pub u32);

impl fmt::Display for SearchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "search-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_sentinel() {
        assert!(NodeId::LOCAL.is_local());
        assert!(!NodeId(7).is_local());
        assert_eq!(NodeId::LOCAL.to_string(), "#local");
        assert_eq!(NodeId(42).to_string(), "#42");
    }
}
