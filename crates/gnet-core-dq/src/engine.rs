//! The dynamic query engine.
//!
//! One [`DqEngine`] per process, created when the node becomes an
//! ultrapeer. It owns every live query, the four lookup indices, the
//! metadata of in-flight messages, and the horizon table. All mutation
//! happens on the engine thread: timer events pop out of the callout
//! queue and are handed to [`DqEngine::on_timer`], everything else comes
//! in through the `on_*` handlers invoked by the host.
//!
//! A query progresses probe, iterate, optionally wait for guidance,
//! terminate, linger, freed. Termination never happens behind the
//! engine's back: it is always the result of a handler or timer deciding
//! so, and a freed query leaves no trace in any index.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use gnet_core_callout::{Callout, CalloutQueue};
use gnet_core_common::{
    hit_status, speed, Muid, NodeId, QueryHashVec, SearchHandle, SearchMessage,
};

use crate::config::DqConfig;
use crate::error::{DqError, Result};
use crate::horizon::HorizonTable;
use crate::host::{HostHooks, NeighbourInfo, SendHandle, SendOutcome};
use crate::query::{DynamicQuery, QueryFlags, QueryId, QueryView, SendMeta, TimerEvent};
use crate::select;
use crate::stats::DqStats;
use crate::template::TemplateCache;
use crate::GUIDANCE_STOP;

/// The callout queue shared between the engine and the host loop that
/// drives it.
pub type SharedCallout = Arc<Mutex<CalloutQueue<TimerEvent>>>;

/// Reschedule delay used when a decision must run "immediately" but may
/// not nest inside the current call stack.
const IMMEDIATE: Duration = Duration::from_millis(1);

/// The dynamic query engine.
pub struct DqEngine {
    config: DqConfig,
    hooks: HostHooks,
    callout: SharedCallout,
    stats: Arc<DqStats>,
    horizon: HorizonTable,
    /// Strictly increasing; doubles as the generation counter.
    next_query: u64,
    next_send: u64,
    /// Every live query; the authoritative "all queries" index.
    queries: HashMap<QueryId, DynamicQuery>,
    /// Queries per originating node (local queries are not tracked here).
    by_node: HashMap<NodeId, Vec<QueryId>>,
    /// Wire MUID to query, for hit and OOB accounting.
    by_muid: HashMap<Muid, QueryId>,
    /// Leaf-facing MUID to query, for guidance on OOB-proxied searches.
    by_leaf_muid: HashMap<Muid, QueryId>,
    /// Metadata of messages queued to the layer and not yet released.
    sends: HashMap<SendHandle, SendMeta>,
    closed: bool,
}

impl DqEngine {
    /// Create an engine wired to the given collaborators.
    pub fn new(config: DqConfig, hooks: HostHooks, callout: SharedCallout) -> Self {
        let horizon = HorizonTable::new(config.fuzzy_factor);
        Self {
            config,
            hooks,
            callout,
            stats: Arc::new(DqStats::default()),
            horizon,
            next_query: 1,
            next_send: 1,
            queries: HashMap::new(),
            by_node: HashMap::new(),
            by_muid: HashMap::new(),
            by_leaf_muid: HashMap::new(),
            sends: HashMap::new(),
            closed: false,
        }
    }

    /// The engine's statistics block.
    pub fn stats(&self) -> Arc<DqStats> {
        Arc::clone(&self.stats)
    }

    /// Number of live queries.
    pub fn active_queries(&self) -> usize {
        self.queries.len()
    }

    /// Whether the query is still alive (possibly lingering).
    pub fn is_active(&self, id: QueryId) -> bool {
        self.queries.contains_key(&id)
    }

    /// Read-only snapshot of one query.
    pub fn query_view(&self, id: QueryId) -> Option<QueryView> {
        self.queries.get(&id).map(|q| q.view())
    }

    /// Queries currently registered for an originating node.
    pub fn queries_for_node(&self, node: NodeId) -> usize {
        self.by_node.get(&node).map_or(0, |list| list.len())
    }

    // ---- launch ------------------------------------------------------

    /// Begin a dynamic query on behalf of a leaf.
    ///
    /// `message` is the query exactly as the leaf sent it (hops already
    /// incremented by the reception path). The engine decides whether to
    /// OOB-proxy it, forwards it to matching local leaves, and starts the
    /// probe.
    pub fn launch_remote(
        &mut self,
        node: NodeId,
        mut message: SearchMessage,
        qhv: QueryHashVec,
    ) -> Result<QueryId> {
        if self.closed {
            return Err(DqError::Closed);
        }

        let tagged = message.has_marked_flags();
        let req_speed = message.speed_flags();

        // The query is leaf-guided when tagged as such, or when the leaf
        // advertised guidance support during handshake (some servents
        // forget to tag).
        let advertised = self
            .hooks
            .neighbours
            .info(node)
            .map_or(false, |info| info.leaf_guided);
        let leaf_guided = (tagged && req_speed & speed::LEAF_GUIDED != 0) || advertised;

        // OOB-proxy unguided queries when we can, so that we control how
        // many results the leaf receives; otherwise strip the OOB flag so
        // hits route back to us.
        let leaf_muid = message.muid();
        let mut lmuid = self.hooks.oob.proxied_leaf_muid(&leaf_muid);
        if lmuid.is_none() && !leaf_guided {
            match self.hooks.oob.create_proxy(node, &leaf_muid) {
                Some(wire_muid) => {
                    debug!(
                        node = %node,
                        muid = %leaf_muid,
                        proxied = %wire_muid,
                        "OOB-proxying leaf query"
                    );
                    message.set_muid(wire_muid);
                    lmuid = Some(leaf_muid);
                    DqStats::inc(&self.stats.oob_proxied_queries);
                }
                None => {
                    if tagged && req_speed & speed::OOB_REPLY != 0 {
                        debug!(node = %node, muid = %leaf_muid, "stripping OOB flag");
                        message.strip_oob_flag();
                    }
                }
            }
        }

        let req_speed = message.speed_flags();
        let routing_hits = lmuid.is_some() || (tagged && req_speed & speed::OOB_REPLY == 0);

        let max_results = self.config.target(false, qhv.has_urn());
        let ttl = message.ttl().clamp(1, self.config.max_ttl);
        let flags = QueryFlags {
            leaf_guided,
            routing_hits,
            ..QueryFlags::default()
        };

        DqStats::inc(&self.stats.leaf_dyn_queries);
        let id = self.common_init(
            node,
            None,
            message,
            qhv,
            lmuid,
            if tagged { req_speed } else { 0 },
            flags,
            ttl,
            max_results,
        );
        self.send_to_leaves(id, Some(node));
        self.send_probe(id);
        Ok(id)
    }

    /// Begin a dynamic query for a local search. The engine owns the
    /// message and hash vector from here on.
    pub fn launch_local(
        &mut self,
        search: SearchHandle,
        mut message: SearchMessage,
        qhv: QueryHashVec,
    ) -> Result<QueryId> {
        if self.closed {
            return Err(DqError::Closed);
        }
        if !self.hooks.neighbours.local_is_ultrapeer() {
            warn!(%search, "ignoring local dynamic query: not an ultrapeer");
            return Err(DqError::NotUltrapeer);
        }

        let ttl = self.config.my_ttl.clamp(1, self.config.max_ttl);
        message.set_ttl(ttl);
        let max_results = self.config.target(true, qhv.has_urn());
        let flags = QueryFlags {
            // We see our own hits, no leaf to guide us.
            routing_hits: true,
            ..QueryFlags::default()
        };

        DqStats::inc(&self.stats.local_dyn_queries);
        let id = self.common_init(
            NodeId::LOCAL,
            Some(search),
            message,
            qhv,
            None,
            0,
            flags,
            ttl,
            max_results,
        );
        self.send_to_leaves(id, None);
        self.send_probe(id);
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn common_init(
        &mut self,
        node_id: NodeId,
        search: Option<SearchHandle>,
        message: SearchMessage,
        qhv: QueryHashVec,
        lmuid: Option<Muid>,
        query_flags: u16,
        flags: QueryFlags,
        ttl: u8,
        max_results: u32,
    ) -> QueryId {
        let id = QueryId(self.next_query);
        let generation = self.next_query;
        self.next_query += 1;

        let muid = message.muid();
        let now = self.callout.now_ms();
        let expire_ev = self.callout.schedule(
            self.config.max_lifetime,
            TimerEvent::Expire { query: id, generation },
        );

        let mut query = DynamicQuery {
            id,
            generation,
            node_id,
            search,
            template: TemplateCache::new(message),
            lmuid,
            qhv,
            query_flags,
            flags,
            ttl,
            horizon: 0,
            up_sent: 0,
            last_status: 0,
            pending: 0,
            max_results,
            fin_results: self.config.final_target(max_results),
            oob_results: 0,
            results: 0,
            linger_results: 0,
            new_results: 0,
            kept_results: 0,
            result_timeout: self.config.base_result_timeout,
            stat_timeouts: 0,
            expire_ev: Some(expire_ev),
            results_ev: None,
            queried: HashSet::new(),
            route_cache: HashMap::new(),
            started_at: now,
            stopped_at: 0,
            indexed_by_muid: false,
            indexed_by_leaf_muid: false,
        };

        if self.by_muid.contains_key(&muid) {
            warn!(%muid, query = %id, "conflicting MUID for dynamic query, not indexing");
        } else {
            self.by_muid.insert(muid, id);
            query.indexed_by_muid = true;
        }

        if let Some(lmuid) = query.lmuid {
            if self.by_leaf_muid.contains_key(&lmuid) {
                warn!(muid = %lmuid, query = %id, "conflicting leaf MUID, not indexing");
            } else {
                self.by_leaf_muid.insert(lmuid, id);
                query.indexed_by_leaf_muid = true;
            }
        }

        if !node_id.is_local() {
            self.by_node.entry(node_id).or_default().push(id);
        }

        debug!(
            query = %id,
            node = %node_id,
            %muid,
            ttl,
            max_results,
            guided = query.flags.leaf_guided,
            routing = query.flags.routing_hits,
            "dynamic query created"
        );

        self.queries.insert(id, query);
        id
    }

    /// Forward the query to the local leaves whose QRP tables match it,
    /// excluding the originator. The TTL is forced to 2 or more so that
    /// last-hop QRP ultrapeers are not selected as targets.
    fn send_to_leaves(&mut self, id: QueryId, source: Option<NodeId>) {
        let Some(q) = self.queries.get(&id) else { return };
        let message = q.template.template();
        let targets =
            self.hooks
                .qrp
                .leaf_targets(&q.qhv, message.hops(), message.ttl().max(2), source);
        if !targets.is_empty() {
            trace!(query = %id, leaves = targets.len(), "forwarding query to leaves");
            self.hooks.messages.send_to_leaves(&targets, message);
        }
    }

    // ---- probe and iteration -----------------------------------------

    /// Initial querying: up to `probe_fanout` ultrapeers whose QRP tables
    /// admit the query, picked by emptiest send queue.
    fn send_probe(&mut self, id: QueryId) {
        let (initial_ttl, result_timeout, generation) = match self.queries.get(&id) {
            Some(q) => {
                debug_assert!(q.results_ev.is_none());
                (q.ttl, q.result_timeout, q.generation)
            }
            None => return,
        };

        let mut found = match self.queries.get(&id) {
            Some(q) => {
                select::probe_candidates(&*self.hooks.neighbours, &*self.hooks.qrp, &q.qhv)
            }
            None => return,
        };

        debug!(query = %id, found = found.len(), "ultrapeers to probe");

        // No suitable ultrapeer holds the content: the query might be
        // rare, fall through to sequential iteration.
        if found.is_empty() {
            self.send_next(id);
            return;
        }

        // Plenty of candidates means common content, lower the TTL.
        let fanout = self.config.probe_fanout;
        let mut ttl = initial_ttl;
        if found.len() > 6 * fanout {
            ttl = ttl.saturating_sub(1);
        }
        if found.len() > 3 * fanout {
            ttl = ttl.saturating_sub(1);
        }
        let ttl = ttl.max(1);

        select::sort_by_queue(&mut found, &*self.hooks.neighbours);

        let probed = found.len().min(fanout);
        for i in 0..probed {
            let info = found[i].clone();
            self.dispatch(id, &info, ttl);
        }

        // The first replies tell us how popular the query is; wait a
        // little longer per probed connection.
        let timeout =
            (self.config.probe_extra_timeout + result_timeout) * probed as u32;
        let handle = self
            .callout
            .schedule(timeout, TimerEvent::Results { query: id, generation });
        if let Some(q) = self.queries.get_mut(&id) {
            q.results_ev = Some(handle);
        }
    }

    /// One iteration step: check the termination conditions, then pick
    /// the next ultrapeer and query it at a TTL matched to what is still
    /// missing.
    fn send_next(&mut self, id: QueryId) {
        // Losing ultrapeer status kills dynamic querying entirely.
        if !self.hooks.neighbours.local_is_ultrapeer() {
            debug!(query = %id, "terminating: no longer an ultrapeer");
            self.terminate(id);
            return;
        }

        let kept = self.kept_results(id);

        let (horizon, up_sent, results, oob_results, fin_results, max_results, pending) =
            match self.queries.get(&id) {
                Some(q) => {
                    debug_assert!(q.results_ev.is_none());
                    (
                        q.horizon,
                        q.up_sent,
                        q.results,
                        q.oob_results,
                        q.fin_results,
                        q.max_results,
                        q.pending,
                    )
                }
                None => return,
            };

        if horizon >= self.config.max_horizon || kept >= max_results {
            debug!(query = %id, up_sent, horizon, kept, max_results, "terminating: enough");
            self.terminate(id);
            return;
        }

        // Even guided leaves must keep some amount of results, or we are
        // collecting for overly restrictive filters.
        if results + oob_results >= fin_results {
            debug!(query = %id, results, oob_results, fin_results, "terminating: seen enough");
            self.terminate(id);
            return;
        }

        if up_sent >= self.config.max_queried_ups() {
            debug!(query = %id, up_sent, "terminating: queried UP budget spent");
            self.terminate(id);
            return;
        }

        // Too many queued-but-unsent copies: selecting further nodes now
        // could flood us with replies once they all go out. Wait.
        if pending >= self.config.max_pending {
            let (timeout, generation) = match self.queries.get(&id) {
                Some(q) => (q.result_timeout, q.generation),
                None => return,
            };
            trace!(query = %id, pending, ?timeout, "waiting for pending queries");
            let handle = self
                .callout
                .schedule(timeout, TimerEvent::Results { query: id, generation });
            if let Some(q) = self.queries.get_mut(&id) {
                q.results_ev = Some(handle);
            }
            return;
        }

        let mut candidates = match self.queries.get(&id) {
            Some(q) => {
                select::next_candidates(&*self.hooks.neighbours, &q.queried, &q.route_cache)
            }
            None => return,
        };

        trace!(query = %id, remaining = candidates.len(), kept, "ultrapeers left to query");

        if candidates.is_empty() {
            self.terminate(id);
            return;
        }

        if let Some(q) = self.queries.get(&id) {
            select::sort_by_queue_qrp(
                &mut candidates,
                &*self.hooks.neighbours,
                &*self.hooks.qrp,
                &q.qhv,
                self.config.queue_epsilon,
            );
        }

        let connections = candidates.len() as u32;
        let mut chosen: Option<(NeighbourInfo, u8)> = None;
        if let Some(q) = self.queries.get(&id) {
            for candidate in &candidates {
                let ttl = self.select_ttl(q, kept, &candidate.info, connections);

                // A TTL-1 query can only be answered by the node itself;
                // pointless when its last-hop QRP table rejects it.
                if ttl == 1
                    && candidate.info.last_hop_qrp
                    && !candidate.can_route(&*self.hooks.qrp, &q.qhv)
                {
                    trace!(query = %id, node = %candidate.info.id, "TTL=1, cannot route, skipping");
                    continue;
                }

                chosen = Some((candidate.info.clone(), ttl));
                break;
            }
        }

        // Keep the QRP verdicts learned while sorting for the next round.
        let learned: HashMap<NodeId, bool> = candidates
            .iter()
            .filter_map(|c| c.known_route().map(|r| (c.info.id, r)))
            .collect();
        if let Some(q) = self.queries.get_mut(&id) {
            q.route_cache = learned;
        }

        let Some((info, ttl)) = chosen else {
            self.terminate(id);
            return;
        };

        self.dispatch(id, &info, ttl);

        let adjust_threshold = self.config.adjust_threshold.max(1);
        let (timeout, generation) = match self.queries.get_mut(&id) {
            Some(q) => {
                // Few results despite a large horizon: rare content,
                // shorten the wait between iterations.
                if q.horizon > adjust_threshold
                    && kept < self.config.low_results * q.horizon / adjust_threshold
                {
                    q.result_timeout = q
                        .result_timeout
                        .saturating_sub(self.config.timeout_adjust)
                        .max(self.config.min_result_timeout);
                }

                let mut timeout = q.result_timeout;
                if q.pending > 1 {
                    timeout += self.config.pending_extra_timeout * (q.pending - 1);
                }
                (timeout, q.generation)
            }
            None => return,
        };

        trace!(query = %id, ?timeout, "results timeout armed");
        let handle = self
            .callout
            .schedule(timeout, TimerEvent::Results { query: id, generation });
        if let Some(q) = self.queries.get_mut(&id) {
            q.results_ev = Some(handle);
        }
    }

    /// Queue one copy of the query towards a neighbour, binding the send
    /// metadata that the free hook will consume.
    fn dispatch(&mut self, id: QueryId, info: &NeighbourInfo, ttl: u8) {
        let ttl = ttl.min(info.max_ttl).max(1);
        let handle = SendHandle(self.next_send);
        self.next_send += 1;

        let (message, generation) = {
            let Some(q) = self.queries.get_mut(&id) else { return };
            debug_assert!(!q.queried.contains(&info.id));
            let message = q.template.for_ttl(ttl).clone();
            q.queried.insert(info.id);
            q.pending += 1;
            trace!(
                query = %id,
                node = %info.id,
                degree = info.degree,
                ttl,
                pending = q.pending,
                "queueing query to ultrapeer"
            );
            (message, q.generation)
        };

        self.sends.insert(
            handle,
            SendMeta {
                query: id,
                generation,
                node: info.id,
                degree: info.degree,
                ttl,
            },
        );
        self.hooks.messages.enqueue_query(info.id, message, handle);
    }

    /// Pick the TTL for the next copy, assuming the hosts still to reach
    /// are split evenly across the remaining connections.
    fn select_ttl(
        &self,
        q: &DynamicQuery,
        kept: u32,
        info: &NeighbourInfo,
        connections: u32,
    ) -> u8 {
        let needed = q.max_results.saturating_sub(kept).max(1) as f64;
        let results_per_host = q.results as f64 / q.horizon.max(1) as f64;
        let to_reach = needed / results_per_host.max(1e-6);
        let per_node = to_reach / connections.max(1) as f64;

        let cap = info.max_ttl.min(q.ttl).max(1);
        let mut ttl = cap;
        while ttl > 0 {
            if self.horizon.horizon(info.degree, ttl) as f64 <= per_node {
                return ttl;
            }
            ttl -= 1;
        }
        cap
    }

    /// Amount of results kept for the query, best information available.
    ///
    /// Local queries poll the search store (there is no one to send us
    /// guidance). Guided queries scale the leaf's report down by the
    /// assumed ultrapeer fan-out, since the leaf counts hits from every
    /// ultrapeer it queries, then add what arrived since.
    fn kept_results(&mut self, id: QueryId) -> u32 {
        let (local_search, got_guidance, kept, new_results, results) =
            match self.queries.get(&id) {
                Some(q) => (
                    if q.node_id.is_local() { q.search } else { None },
                    q.flags.got_guidance,
                    q.kept_results,
                    q.new_results,
                    q.results,
                ),
                None => return 0,
            };

        if let Some(handle) = local_search {
            let kept = self.hooks.searches.kept_results(handle);
            if let Some(q) = self.queries.get_mut(&id) {
                q.kept_results = kept;
            }
            kept
        } else if got_guidance {
            kept / self.config.ultra_fanout.max(1) + new_results
        } else {
            results
        }
    }

    // ---- timers ------------------------------------------------------

    /// Deliver one timer event popped from the callout queue.
    ///
    /// Stale events (the query is gone, or its record was replaced by a
    /// different generation) are silently dropped; this is the safety
    /// net the scheduling discipline relies on.
    pub fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Results { query, generation } => {
                let Some(q) = self.queries.get_mut(&query) else { return };
                if q.generation != generation {
                    return;
                }
                q.results_ev = None;
                self.results_expired(query);
            }
            TimerEvent::Expire { query, generation } => {
                let Some(q) = self.queries.get_mut(&query) else { return };
                if q.generation != generation {
                    return;
                }
                q.expire_ev = None;
                self.expired(query);
            }
        }
    }

    /// Advance the shared callout queue by `delta_ms`, dispatching every
    /// event as it becomes due. Events scheduled while earlier ones run
    /// are honoured within the same window.
    pub fn run_timers(&mut self, delta_ms: u64) {
        let target = self.callout.lock().now() + delta_ms;
        loop {
            let next = self
                .callout
                .lock()
                .next_deadline()
                .filter(|&deadline| deadline <= target);
            let Some(deadline) = next else { break };
            let due = self.callout.lock().advance_to(deadline);
            for event in due {
                self.on_timer(event);
            }
        }
        self.callout.lock().advance_to(target);
    }

    /// The hard deadline fired: stop querying, or free the query if it
    /// was already lingering.
    fn expired(&mut self, id: QueryId) {
        debug!(query = %id, "expired");
        let lingering = match self.queries.get(&id) {
            Some(q) => q.flags.lingering,
            None => return,
        };
        if lingering {
            self.free_query(id, false);
            return;
        }

        if let Some(q) = self.queries.get_mut(&id) {
            if let Some(handle) = q.results_ev.take() {
                self.callout.cancel(handle);
            }
        }
        self.terminate(id);
    }

    /// The results (or guidance) timer fired: decide whether to ask the
    /// leaf for guidance, keep iterating, or stop.
    fn results_expired(&mut self, id: QueryId) {
        let mut was_waiting = false;
        let mut degrade: Option<NodeId> = None;
        {
            let Some(q) = self.queries.get_mut(&id) else { return };
            debug_assert!(!q.flags.lingering);

            // A guidance request went unanswered. Harsh to cancel over
            // it: drop the guidance indication and keep iterating; the
            // leaf can still send unsolicited guidance later.
            if q.flags.waiting {
                was_waiting = true;
                q.stat_timeouts += 1;
                q.flags.waiting = false;
                debug!(query = %id, timeouts = q.stat_timeouts, "guidance request timed out");

                if !q.flags.got_guidance
                    && q.stat_timeouts >= self.config.max_guidance_timeouts
                {
                    q.flags.leaf_guided = false;
                    degrade = Some(q.node_id);
                }
            }
        }

        if let Some(node) = degrade {
            debug!(query = %id, %node, "leaf does not support guidance, degrading");
            self.hooks.neighbours.set_leaf_guidance(node, false);
        }

        let Some(q) = self.queries.get(&id) else { return };

        // Neither routing the hits nor guided by the leaf: we have no way
        // of measuring this query, it cannot continue.
        if !q.flags.leaf_guided && !q.flags.routing_hits {
            debug!(query = %id, up_sent = q.up_sent, "terminating: unguided and unrouted");
            self.terminate(id);
            return;
        }

        // Iterate unless it is time to ask the leaf what it kept.
        let proceed = was_waiting
            || !q.flags.leaf_guided
            || q.up_sent.saturating_sub(q.last_status) < self.config.guidance_threshold
            || (q.flags.routing_hits && q.new_results < self.config.min_new_for_guidance);
        if proceed {
            self.send_next(id);
            return;
        }

        let node = q.node_id;
        let muid = q.lmuid.unwrap_or_else(|| q.muid());
        debug_assert!(!node.is_local());

        if self.hooks.neighbours.info(node).is_none() {
            debug!(query = %id, %node, "originator appears to be dead");
            self.free_query(id, false);
            return;
        }

        debug!(query = %id, %node, "requesting query status from leaf");
        self.hooks.messages.send_guidance_request(node, &muid);

        // Timeout from the alive-ping round-trip statistics, floored.
        let (avg, last) = self.hooks.alive.roundtrip_ms(node).unwrap_or((0, 0));
        let timeout = Duration::from_millis(u64::from(avg + last) / 2)
            .max(self.config.guidance_timeout_floor);

        let Some(q) = self.queries.get_mut(&id) else { return };
        q.flags.waiting = true;
        let generation = q.generation;
        let handle = self
            .callout
            .schedule(timeout, TimerEvent::Results { query: id, generation });
        q.results_ev = Some(handle);
    }

    /// Stop active querying and enter the linger phase, during which hits
    /// are still accounted but nothing is dispatched.
    fn terminate(&mut self, id: QueryId) {
        let Some(q) = self.queries.get_mut(&id) else { return };
        debug_assert!(!q.flags.lingering);
        debug_assert!(q.results_ev.is_none());

        // Cancelled queries are freed on the next queue tick rather than
        // on the current calling stack.
        let delay = if q.flags.cancelled {
            IMMEDIATE
        } else {
            self.config.linger_timeout
        };

        let generation = q.generation;
        match q.expire_ev {
            Some(handle) => self.callout.reschedule(handle, delay),
            None => {
                q.expire_ev = Some(
                    self.callout
                        .schedule(delay, TimerEvent::Expire { query: id, generation }),
                );
            }
        }

        q.flags.waiting = false;
        q.flags.lingering = true;
        q.stopped_at = self.callout.now_ms();

        debug!(
            query = %id,
            node = %q.node_id,
            ttl = q.ttl,
            queried = q.up_sent,
            horizon = q.horizon,
            results = q.results,
            "lingering"
        );
    }

    // ---- send bookkeeping --------------------------------------------

    /// Free hook for a dispatched message: the layer released it, either
    /// after transmission or by dropping it. Must be delivered on the
    /// engine thread.
    pub fn on_send_result(&mut self, handle: SendHandle, outcome: SendOutcome) {
        let Some(meta) = self.sends.remove(&handle) else {
            warn!(%handle, "send result for unknown message");
            return;
        };

        // The query may have been cancelled while the message sat in the
        // queue; the generation guards against record reuse.
        let Some(q) = self.queries.get_mut(&meta.query) else { return };
        if q.generation != meta.generation {
            return;
        }

        debug_assert!(q.pending > 0);
        q.pending = q.pending.saturating_sub(1);

        match outcome {
            SendOutcome::Dropped => {
                // The node never received the query; forget it was
                // queried so it can be picked again later.
                q.queried.remove(&meta.node);
                trace!(
                    query = %meta.query,
                    node = %meta.node,
                    ttl = meta.ttl,
                    "message dropped"
                );

                // Nothing in flight and a results timer armed: we would
                // be waiting for hits that can never come. Fire it now
                // (next tick; re-entering the layer from a hook is not
                // allowed).
                if q.pending == 0 {
                    if let Some(ev) = q.results_ev {
                        self.callout.reschedule(ev, IMMEDIATE);
                    }
                }
            }
            SendOutcome::Sent => {
                q.up_sent += 1;
                q.horizon += self.horizon.horizon(meta.degree, meta.ttl);
                trace!(
                    query = %meta.query,
                    node = %meta.node,
                    ttl = meta.ttl,
                    up_sent = q.up_sent,
                    horizon = q.horizon,
                    "message sent"
                );
            }
        }
    }

    // ---- hit accounting ----------------------------------------------

    /// Account parsed query hits. Returns whether the hits should be
    /// forwarded to the originator.
    pub fn on_hits(&mut self, muid: &Muid, count: u32, status: u16) -> bool {
        self.count_results(muid, count, status, false)
    }

    /// Account an OOB indication (results announced, not yet claimed).
    /// Returns whether claiming them is worthwhile.
    pub fn on_oob_indication(&mut self, muid: &Muid, count: u32) -> bool {
        self.count_results(muid, count, 0, true)
    }

    /// OOB results were finally claimed and accounted as regular hits;
    /// undo the indication bookkeeping.
    pub fn on_oob_claimed(&mut self, muid: &Muid, count: u32) {
        let Some(&id) = self.by_muid.get(muid) else { return };
        let Some(q) = self.queries.get_mut(&id) else { return };
        // A remote node may deliver more than it announced; don't trust it.
        q.oob_results = q.oob_results.saturating_sub(count);
    }

    fn count_results(&mut self, muid: &Muid, count: u32, status: u16, oob: bool) -> bool {
        let Some(&id) = self.by_muid.get(muid) else {
            // Not ours (or never indexed after a collision): let the
            // routing layer do whatever it would normally do.
            return true;
        };
        let Some(q) = self.queries.get_mut(&id) else { return true };

        // Hits from a firewalled servent are useless to a firewalled
        // requester unless both sides do firewall-to-firewall transfers.
        // Applies to actual hits only; an OOB indication carries no
        // responder status.
        if !oob && firewalled_hit_useless(status, q.query_flags) {
            trace!(query = %id, count, "ignoring firewalled results");
            return false;
        }

        if q.flags.lingering {
            q.linger_results += count;
        } else if oob {
            q.oob_results += count;
        } else {
            q.results += count;
            q.new_results += count;
        }

        trace!(
            query = %id,
            count,
            oob,
            results = q.results,
            oob_results = q.oob_results,
            linger_results = q.linger_results,
            "results accounted"
        );

        !q.flags.cancelled
    }

    /// How many more results the query wants, for deciding whether to
    /// claim announced OOB hits. `None` when the query does not exist.
    pub fn results_wanted(&mut self, muid: &Muid) -> Option<u32> {
        let id = *self.by_muid.get(muid)?;
        if self.queries.get(&id)?.flags.cancelled {
            return Some(0);
        }
        let kept = self.kept_results(id);
        let q = self.queries.get(&id)?;
        if kept < q.max_results {
            Some(q.max_results - kept)
        } else if q.flags.got_guidance && q.kept_results < q.fin_results {
            // Delivered all we had to, but claiming stray OOB hits is
            // nearly free; the hit layer may still discard them.
            Some(1)
        } else {
            Some(0)
        }
    }

    // ---- guidance ----------------------------------------------------

    /// A query-status response from the originator: how many results it
    /// kept after filtering, or [`GUIDANCE_STOP`] to cancel.
    pub fn on_guidance(&mut self, muid: &Muid, source: NodeId, kept: u16) {
        // OOB-proxied leaves only know their own MUID.
        let id = match self.by_muid.get(muid).or_else(|| self.by_leaf_muid.get(muid)) {
            Some(&id) => id,
            None => return,
        };

        let mut enable_guidance = false;
        {
            let Some(q) = self.queries.get_mut(&id) else { return };

            // Only the originator may guide its own search.
            if q.node_id != source {
                warn!(query = %id, %source, "guidance from a node that did not issue the query");
                return;
            }

            q.kept_results = u32::from(kept);
            q.flags.got_guidance = true;
            q.last_status = q.up_sent;
            q.new_results = 0;

            if !q.flags.waiting && !q.flags.leaf_guided {
                // Unsolicited guidance: the leaf supports it after all.
                q.flags.leaf_guided = true;
                enable_guidance = true;
            }

            debug!(query = %id, kept, solicited = q.flags.waiting, "guidance received");
        }

        if enable_guidance {
            self.hooks.neighbours.set_leaf_guidance(source, true);
        }

        if kept == GUIDANCE_STOP {
            let Some(q) = self.queries.get_mut(&id) else { return };
            debug!(query = %id, up_sent = q.up_sent, "terminating at originator's request");
            q.flags.cancelled = true;
            if !q.flags.lingering {
                if let Some(handle) = q.results_ev.take() {
                    self.callout.cancel(handle);
                }
                self.terminate(id);
            }
            return;
        }

        // If we were waiting for this status, resume the query's course.
        let Some(q) = self.queries.get_mut(&id) else { return };
        if q.flags.waiting {
            q.flags.waiting = false;
            if let Some(handle) = q.results_ev.take() {
                self.callout.cancel(handle);
            }
            self.send_next(id);
        }
    }

    // ---- removal paths -----------------------------------------------

    /// A neighbour disappeared: free every query it originated. No
    /// lingering, there is no one left to deliver residual hits to.
    pub fn on_node_removed(&mut self, node: NodeId) {
        let Some(ids) = self.by_node.remove(&node) else { return };
        for id in ids {
            debug!(query = %id, %node, "terminated by node removal");
            self.free_query(id, true);
        }
    }

    /// A local search was closed: free its queries.
    pub fn on_search_closed(&mut self, search: SearchHandle) {
        let ids: Vec<QueryId> = self
            .queries
            .values()
            .filter(|q| q.node_id.is_local() && q.search == Some(search))
            .map(|q| q.id)
            .collect();
        for id in ids {
            debug!(query = %id, %search, "terminated by search close");
            self.free_query(id, false);
        }
    }

    /// Tear the engine down, freeing every live query. Launches fail
    /// afterwards; accounting handlers become no-ops by themselves.
    pub fn close(&mut self) {
        let ids: Vec<QueryId> = self.queries.keys().copied().collect();
        for id in ids {
            self.free_query(id, false);
        }

        // After freeing everything the side indices must be empty.
        for (node, list) in self.by_node.drain() {
            warn!(%node, count = list.len(), "queries left in by-node index at close");
        }
        for (muid, _) in self.by_muid.drain() {
            warn!(%muid, "MUID left indexed at close");
        }
        for (muid, _) in self.by_leaf_muid.drain() {
            warn!(%muid, "leaf MUID left indexed at close");
        }
        self.sends.clear();
        self.closed = true;
    }

    /// Release a query record: cancel its events, account the outcome,
    /// and unhook it from every index. `node_cleanup` is set when the
    /// by-node entry is already being dismantled by the caller.
    fn free_query(&mut self, id: QueryId, node_cleanup: bool) {
        let Some(q) = self.queries.remove(&id) else { return };

        let now = self.callout.now_ms();
        debug!(
            query = %id,
            node = %q.node_id,
            age_secs = q.age_secs(now),
            linger_secs = q.linger_secs(now),
            ttl = q.ttl,
            queried = q.up_sent,
            horizon = q.horizon,
            results = q.results,
            linger_results = q.linger_results,
            "dynamic query ending"
        );

        if let Some(handle) = q.results_ev {
            self.callout.cancel(handle);
        }
        if let Some(handle) = q.expire_ev {
            self.callout.cancel(handle);
        }

        // A query stopped by its originator going away (cancel or node
        // removal) is counted as fully completed: nothing more could be
        // done for it.
        let divisor = if q.node_id.is_local() {
            1
        } else {
            self.config.ultra_fanout.max(1)
        };
        if q.results >= q.max_results
            || q.flags.cancelled
            || node_cleanup
            || q.kept_results / divisor >= q.max_results
        {
            DqStats::inc(&self.stats.completed_full);
        } else if q.results > 0 {
            DqStats::inc(&self.stats.completed_partial);
        } else {
            DqStats::inc(&self.stats.completed_zero);
        }

        if q.linger_results > 0 {
            if q.results >= q.max_results {
                DqStats::inc(&self.stats.linger_extra);
            } else if q.linger_results >= q.max_results - q.results {
                DqStats::inc(&self.stats.linger_completed);
            } else {
                DqStats::inc(&self.stats.linger_results);
            }
        }

        if !q.node_id.is_local() && !node_cleanup {
            match self.by_node.get_mut(&q.node_id) {
                Some(list) => {
                    list.retain(|&other| other != id);
                    if list.is_empty() {
                        self.by_node.remove(&q.node_id);
                    }
                }
                None => warn!(query = %id, node = %q.node_id, "missing by-node entry"),
            }
        }

        if q.indexed_by_muid {
            let muid = q.muid();
            if self.by_muid.get(&muid) == Some(&id) {
                self.by_muid.remove(&muid);
            }
        }
        if q.indexed_by_leaf_muid {
            if let Some(lmuid) = q.lmuid {
                if self.by_leaf_muid.get(&lmuid) == Some(&id) {
                    self.by_leaf_muid.remove(&lmuid);
                }
            }
        }
    }
}

/// Whether a hit from a firewalled responder is useless to this query's
/// requester: both sides firewalled and at least one of them unable to do
/// firewall-to-firewall transfers.
fn firewalled_hit_useless(status: u16, query_flags: u16) -> bool {
    let responder_fw = status & hit_status::FIREWALLED != 0;
    if !responder_fw {
        return false;
    }
    let requester_fw = query_flags & speed::FIREWALLED != 0;
    if !requester_fw {
        return false;
    }
    let requester_fw2fw = query_flags & speed::FW_TO_FW != 0;
    let responder_fw2fw = status & hit_status::FW_TO_FW != 0;
    !requester_fw2fw || !responder_fw2fw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firewalled_hits_need_fw2fw_on_both_sides() {
        let fw = hit_status::FIREWALLED;
        let fw2 = hit_status::FW_TO_FW;
        let qfw = speed::FIREWALLED;
        let qfw2 = speed::FW_TO_FW;

        // Open responder: always useful.
        assert!(!firewalled_hit_useless(0, qfw));
        // Open requester: always useful.
        assert!(!firewalled_hit_useless(fw, 0));
        // Both firewalled, no FW-to-FW anywhere.
        assert!(firewalled_hit_useless(fw, qfw));
        // Requester supports FW-to-FW but responder does not.
        assert!(firewalled_hit_useless(fw, qfw | qfw2));
        // Responder supports FW-to-FW but requester does not.
        assert!(firewalled_hit_useless(fw | fw2, qfw));
        // Both support FW-to-FW: the transfer can be set up.
        assert!(!firewalled_hit_useless(fw | fw2, qfw | qfw2));
    }
}
