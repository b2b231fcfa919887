//! Dynamic querying for an ultrapeer.
//!
//! A dynamic query satisfies a search issued by a leaf (or by the local
//! node) by forwarding it to a few neighbour ultrapeers at a time,
//! watching the rate at which hits come back, estimating the horizon
//! already covered, and stopping as soon as enough results arrived. The
//! overlay is never flooded; rare queries probe deeper, popular queries
//! stop early.
//!
//! The engine is single-threaded and cooperatively scheduled: every
//! decision happens inside a timer callback delivered from the callout
//! queue or inside an event handler invoked by the host (incoming hit,
//! leaf guidance, node removal). Collaborators (neighbour table, message
//! layer, QRP, alive pings, OOB proxy, local search store) are injected
//! as capability objects so the engine can be exercised in isolation.

mod config;
mod engine;
mod error;
mod horizon;
mod host;
mod query;
mod select;
mod stats;
mod template;

pub use config::DqConfig;
pub use engine::{DqEngine, SharedCallout};
pub use error::{DqError, Result};
pub use horizon::HorizonTable;
pub use host::{
    AliveRtt, HostHooks, MessageLayer, NeighbourInfo, NeighbourTable, OobProxy, QrpFilter,
    SearchStore, SendHandle, SendOutcome,
};
pub use query::{QueryId, QueryView, TimerEvent};
pub use stats::{DqStats, DqStatsSnapshot};

/// Guidance value meaning "stop this query now".
pub const GUIDANCE_STOP: u16 = 0xffff;
