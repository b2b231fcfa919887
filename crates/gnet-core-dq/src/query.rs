//! Per-query state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use gnet_core_callout::EventHandle;
use gnet_core_common::{Muid, NodeId, QueryHashVec, SearchHandle};

use crate::template::TemplateCache;

/// Handle of a dynamic query.
///
/// Allocated from a strictly increasing counter and never reused, so a
/// handle captured by a timer or a send hook stays unambiguous even after
/// the query record is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DQ[{}]", self.0)
    }
}

/// Timer events the engine schedules on the callout queue.
///
/// Each event carries the query's generation; a fired event whose
/// generation no longer matches the live record is stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Hard deadline, or end of the linger phase.
    Expire { query: QueryId, generation: u64 },
    /// Next progression step: iterate, or give up waiting for guidance.
    Results { query: QueryId, generation: u64 },
}

/// Operational flags of a query.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct QueryFlags {
    /// The originating leaf guides the query with kept-result reports.
    pub leaf_guided: bool,
    /// A guidance request is outstanding.
    pub waiting: bool,
    /// At least one guidance report was ever received.
    pub got_guidance: bool,
    /// Terminated; only accounting hits until freed.
    pub lingering: bool,
    /// Explicitly cancelled by the originator.
    pub cancelled: bool,
    /// All hits for this query route through us.
    pub routing_hits: bool,
}

/// Metadata pinned to one in-flight query message.
///
/// Created at dispatch, consumed exactly once when the message layer
/// reports the message's fate. The `(query, generation)` pair guards
/// against the record being gone by then.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendMeta {
    pub query: QueryId,
    pub generation: u64,
    pub node: NodeId,
    pub degree: u16,
    pub ttl: u8,
}

/// One dynamic query in flight.
pub(crate) struct DynamicQuery {
    pub id: QueryId,
    /// Stale-callback guard; matches `id.0` today but checked separately.
    pub generation: u64,
    /// Originating node, [`NodeId::LOCAL`] for our own searches.
    pub node_id: NodeId,
    /// Search handle, only for local queries.
    pub search: Option<SearchHandle>,
    /// The wire MUID and the per-TTL message copies.
    pub template: TemplateCache,
    /// MUID the leaf knows an OOB-proxied search by.
    pub lmuid: Option<Muid>,
    /// Keyword/URN fingerprint for QRP admission.
    pub qhv: QueryHashVec,
    /// Snapshot of the marked min-speed field, 0 when unmarked.
    pub query_flags: u16,
    pub flags: QueryFlags,
    /// Initial query TTL.
    pub ttl: u8,
    /// Theoretical horizon reached so far.
    pub horizon: u32,
    /// Ultrapeers that acknowledged our query as sent.
    pub up_sent: u32,
    /// `up_sent` as of the last guidance report.
    pub last_status: u32,
    /// Messages queued but neither sent nor dropped yet.
    pub pending: u32,
    /// Result target.
    pub max_results: u32,
    /// Results ending even a leaf-guided query.
    pub fin_results: u32,
    /// OOB results announced but not yet claimed.
    pub oob_results: u32,
    /// Results seen so far.
    pub results: u32,
    /// Results seen while lingering.
    pub linger_results: u32,
    /// Results since the last guidance report.
    pub new_results: u32,
    /// Results the originator says it kept after filtering.
    pub kept_results: u32,
    /// Current wait between iterations.
    pub result_timeout: Duration,
    /// Guidance requests that timed out.
    pub stat_timeouts: u32,
    /// Hard-deadline / linger event.
    pub expire_ev: Option<EventHandle>,
    /// Progression event (results wait or guidance wait).
    pub results_ev: Option<EventHandle>,
    /// Nodes this query was dispatched to (drops remove their entry).
    pub queried: HashSet<NodeId>,
    /// QRP verdicts learned during the previous iteration.
    pub route_cache: HashMap<NodeId, bool>,
    /// Queue time at launch, for log timestamps.
    pub started_at: u64,
    /// Queue time at termination.
    pub stopped_at: u64,
    /// Whether the `by_muid` index points at us (false on collision).
    pub indexed_by_muid: bool,
    /// Whether the `by_leaf_muid` index points at us.
    pub indexed_by_leaf_muid: bool,
}

impl DynamicQuery {
    /// The wire MUID this query forwards under.
    pub fn muid(&self) -> Muid {
        self.template.muid()
    }

    /// Seconds since the query started, for logs.
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.started_at) / 1000
    }

    /// Seconds spent lingering, 0 while still active.
    pub fn linger_secs(&self, now: u64) -> u64 {
        if self.flags.lingering {
            now.saturating_sub(self.stopped_at) / 1000
        } else {
            0
        }
    }

    /// Read-only view for observers and tests.
    pub fn view(&self) -> QueryView {
        QueryView {
            id: self.id,
            node: self.node_id,
            muid: self.muid(),
            leaf_muid: self.lmuid,
            ttl: self.ttl,
            horizon: self.horizon,
            up_sent: self.up_sent,
            pending: self.pending,
            queried: self.queried.len(),
            results: self.results,
            new_results: self.new_results,
            kept_results: self.kept_results,
            oob_results: self.oob_results,
            linger_results: self.linger_results,
            max_results: self.max_results,
            fin_results: self.fin_results,
            result_timeout: self.result_timeout,
            stat_timeouts: self.stat_timeouts,
            leaf_guided: self.flags.leaf_guided,
            waiting_for_guidance: self.flags.waiting,
            got_guidance: self.flags.got_guidance,
            lingering: self.flags.lingering,
            cancelled: self.flags.cancelled,
            routing_hits: self.flags.routing_hits,
        }
    }
}

/// Read-only snapshot of one query's state.
#[derive(Debug, Clone)]
pub struct QueryView {
    pub id: QueryId,
    pub node: NodeId,
    pub muid: Muid,
    pub leaf_muid: Option<Muid>,
    pub ttl: u8,
    pub horizon: u32,
    pub up_sent: u32,
    pub pending: u32,
    pub queried: usize,
    pub results: u32,
    pub new_results: u32,
    pub kept_results: u32,
    pub oob_results: u32,
    pub linger_results: u32,
    pub max_results: u32,
    pub fin_results: u32,
    pub result_timeout: Duration,
    pub stat_timeouts: u32,
    pub leaf_guided: bool,
    pub waiting_for_guidance: bool,
    pub got_guidance: bool,
    pub lingering: bool,
    pub cancelled: bool,
    pub routing_hits: bool,
}
