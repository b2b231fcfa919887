//! Shared plain types for the gnet-core crates.
//!
//! Everything here is logic-free: identifiers, the wire shape of a query
//! message, and the flag constants carried inside it. The dynamic query
//! engine and the host node both depend on this crate.

mod id;
mod message;
mod muid;
mod qhv;

pub use id::{NodeId, SearchHandle};
pub use message::{hit_status, speed, SearchMessage, HEADER_SIZE};
pub use muid::Muid;
pub use qhv::QueryHashVec;
