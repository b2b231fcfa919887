//! Host-node capabilities consumed by the engine.
//!
//! The engine never talks to the network, the QRP tables, or the search
//! UI directly: every collaborator is injected behind one of these traits
//! at construction. Production wires them to the live subsystems; tests
//! supply stubs and drive the engine deterministically.
//!
//! Calls into these traits must not re-enter the engine synchronously.
//! In particular the message layer reports the fate of an enqueued
//! message later, through [`DqEngine::on_send_result`], on the engine
//! thread, never from inside `enqueue_query`.
//!
//! [`DqEngine::on_send_result`]: crate::DqEngine::on_send_result

use std::fmt;
use std::sync::Arc;

use gnet_core_common::{Muid, NodeId, QueryHashVec, SearchHandle, SearchMessage};

/// What the neighbour table knows about one connection.
#[derive(Debug, Clone)]
pub struct NeighbourInfo {
    pub id: NodeId,
    /// The neighbour is an ultrapeer (not a leaf).
    pub is_ultrapeer: bool,
    /// The connection is up and accepts writes.
    pub writable: bool,
    /// The handshake ping was answered.
    pub handshaked: bool,
    /// We are in transmit flow-control towards this neighbour.
    pub tx_flow_controlled: bool,
    /// Remote hops-flow limit; 0 means "send me no queries".
    pub hops_flow: u8,
    /// Degree the neighbour advertises for horizon computation.
    pub degree: u16,
    /// Highest TTL the neighbour accepts.
    pub max_ttl: u8,
    /// The neighbour keeps a last-hop QRP table.
    pub last_hop_qrp: bool,
    /// The neighbour (a leaf) advertises leaf-guidance support.
    pub leaf_guided: bool,
}

/// Live view of the current connections.
pub trait NeighbourTable: Send + Sync {
    /// Whether the local node currently runs as an ultrapeer.
    fn local_is_ultrapeer(&self) -> bool;

    /// Identities of the currently connected neighbours.
    fn connected(&self) -> Vec<NodeId>;

    /// Details for one neighbour, `None` once it is gone.
    fn info(&self, node: NodeId) -> Option<NeighbourInfo>;

    /// Bytes pending in the neighbour's send queue.
    fn queue_pending(&self, node: NodeId) -> Option<u32>;

    /// Record whether a leaf honours guidance requests.
    fn set_leaf_guidance(&self, node: NodeId, enabled: bool);
}

/// Tag travelling with an enqueued query message; handed back verbatim
/// when the message layer releases the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendHandle(pub u64);

impl fmt::Display for SendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send-{}", self.0)
    }
}

/// Fate of an enqueued message, reported when it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message went out on the wire.
    Sent,
    /// The message was dropped before transmission.
    Dropped,
}

/// Outgoing message plumbing.
pub trait MessageLayer: Send + Sync {
    /// Queue a query towards one neighbour. The layer must later report
    /// the message's fate for `handle` exactly once.
    fn enqueue_query(&self, node: NodeId, message: SearchMessage, handle: SendHandle);

    /// Forward a query to the given local leaves, fire-and-forget.
    fn send_to_leaves(&self, targets: &[NodeId], message: &SearchMessage);

    /// Ask the originating leaf how many hits it kept, using the MUID it
    /// knows the search by.
    fn send_guidance_request(&self, node: NodeId, muid: &Muid);
}

/// Query routing protocol admission.
pub trait QrpFilter: Send + Sync {
    /// Whether the neighbour's QRP table admits this query.
    fn can_route(&self, node: NodeId, qhv: &QueryHashVec) -> bool;

    /// Local leaves whose QRP tables match the query, excluding the
    /// originator.
    fn leaf_targets(
        &self,
        qhv: &QueryHashVec,
        hops: u8,
        ttl: u8,
        exclude: Option<NodeId>,
    ) -> Vec<NodeId>;
}

/// Round-trip statistics from the alive-ping subsystem.
pub trait AliveRtt: Send + Sync {
    /// `(average_ms, last_ms)` for the connection, when measured.
    fn roundtrip_ms(&self, node: NodeId) -> Option<(u32, u32)>;
}

/// Out-of-band result proxying.
pub trait OobProxy: Send + Sync {
    /// For a proxied query, the MUID the leaf knows the search by.
    fn proxied_leaf_muid(&self, wire_muid: &Muid) -> Option<Muid>;

    /// Try to OOB-proxy a leaf's query; returns the replacement wire
    /// MUID, or `None` when proxying is unavailable (no UDP, firewalled).
    fn create_proxy(&self, node: NodeId, leaf_muid: &Muid) -> Option<Muid>;
}

/// Local search bookkeeping.
pub trait SearchStore: Send + Sync {
    /// Results the local search has kept after filtering.
    fn kept_results(&self, handle: SearchHandle) -> u32;
}

/// The full collaborator bundle injected at engine construction.
#[derive(Clone)]
pub struct HostHooks {
    pub neighbours: Arc<dyn NeighbourTable>,
    pub messages: Arc<dyn MessageLayer>,
    pub qrp: Arc<dyn QrpFilter>,
    pub alive: Arc<dyn AliveRtt>,
    pub oob: Arc<dyn OobProxy>,
    pub searches: Arc<dyn SearchStore>,
}

impl NeighbourInfo {
    /// A plain ultrapeer neighbour with everything in its default state;
    /// used by tests and stub tables.
    pub fn ultrapeer(id: NodeId, degree: u16, max_ttl: u8) -> Self {
        Self {
            id,
            is_ultrapeer: true,
            writable: true,
            handshaked: true,
            tx_flow_controlled: false,
            hops_flow: u8::MAX,
            degree,
            max_ttl,
            last_hop_qrp: false,
            leaf_guided: false,
        }
    }

    /// A leaf neighbour.
    pub fn leaf(id: NodeId) -> Self {
        Self {
            id,
            is_ultrapeer: false,
            writable: true,
            handshaked: true,
            tx_flow_controlled: false,
            hops_flow: u8::MAX,
            degree: 0,
            max_ttl: 1,
            last_hop_qrp: false,
            leaf_guided: false,
        }
    }
}
