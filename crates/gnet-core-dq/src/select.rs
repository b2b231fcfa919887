//! Ultrapeer candidate selection.
//!
//! Both the initial probe and every iteration pick the next targets from
//! the currently connected ultrapeers, preferring the emptiest send
//! queues. Queue depth and QRP admission are costly to obtain, so each
//! candidate caches them lazily: the depth on first comparison, the QRP
//! verdict only when two depths tie within an epsilon. QRP verdicts also
//! survive from one iteration to the next through the query's route
//! cache, since a neighbour's table rarely changes mid-query.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use gnet_core_common::{NodeId, QueryHashVec};

use crate::host::{NeighbourInfo, NeighbourTable, QrpFilter};

/// One selectable ultrapeer, with lazily cached routing facts.
pub(crate) struct Candidate {
    pub info: NeighbourInfo,
    can_route: Cell<Option<bool>>,
    queue_depth: Cell<Option<u32>>,
}

impl Candidate {
    fn new(info: NeighbourInfo, inherited_route: Option<bool>) -> Self {
        Self {
            info,
            can_route: Cell::new(inherited_route),
            queue_depth: Cell::new(None),
        }
    }

    /// QRP admission, evaluated once and cached.
    pub fn can_route(&self, qrp: &dyn QrpFilter, qhv: &QueryHashVec) -> bool {
        if let Some(verdict) = self.can_route.get() {
            return verdict;
        }
        let verdict = qrp.can_route(self.info.id, qhv);
        self.can_route.set(Some(verdict));
        verdict
    }

    /// The cached QRP verdict, if any comparison forced one.
    pub fn known_route(&self) -> Option<bool> {
        self.can_route.get()
    }

    fn queue_depth(&self, table: &dyn NeighbourTable) -> u32 {
        if let Some(depth) = self.queue_depth.get() {
            return depth;
        }
        let depth = table.queue_pending(self.info.id).unwrap_or(0);
        self.queue_depth.set(Some(depth));
        depth
    }
}

fn acceptable(info: &NeighbourInfo) -> bool {
    info.is_ultrapeer
        && info.writable
        && info.handshaked
        && !info.tx_flow_controlled
        && info.hops_flow > 0
}

/// Ultrapeers eligible for the initial probe: fully connected, not
/// flow-controlled, and whose QRP table admits the query.
pub(crate) fn probe_candidates(
    table: &dyn NeighbourTable,
    qrp: &dyn QrpFilter,
    qhv: &QueryHashVec,
) -> Vec<NeighbourInfo> {
    let mut found = Vec::new();
    for id in table.connected() {
        let Some(info) = table.info(id) else { continue };
        if !acceptable(&info) {
            continue;
        }
        if !qrp.can_route(id, qhv) {
            continue;
        }
        found.push(info);
    }
    found
}

/// Ultrapeers eligible for the next iteration: same filters as the probe
/// minus QRP admission (checked lazily while sorting), minus nodes
/// already queried. Cached QRP verdicts are inherited from the previous
/// iteration's vector.
pub(crate) fn next_candidates(
    table: &dyn NeighbourTable,
    queried: &HashSet<NodeId>,
    route_cache: &HashMap<NodeId, bool>,
) -> Vec<Candidate> {
    let mut found = Vec::new();
    for id in table.connected() {
        if queried.contains(&id) {
            continue;
        }
        let Some(info) = table.info(id) else { continue };
        if !acceptable(&info) {
            continue;
        }
        let inherited = route_cache.get(&id).copied();
        found.push(Candidate::new(info, inherited));
    }
    found
}

/// Sort probe candidates by ascending send-queue depth.
pub(crate) fn sort_by_queue(candidates: &mut [NeighbourInfo], table: &dyn NeighbourTable) {
    candidates.sort_by_cached_key(|info| table.queue_pending(info.id).unwrap_or(0));
}

/// Sort iteration candidates by ascending send-queue depth; when two
/// depths are within `epsilon` bytes, a candidate whose QRP admits the
/// query wins.
pub(crate) fn sort_by_queue_qrp(
    candidates: &mut [Candidate],
    table: &dyn NeighbourTable,
    qrp: &dyn QrpFilter,
    qhv: &QueryHashVec,
    epsilon: u32,
) {
    candidates.sort_by(|a, b| {
        let depth_a = a.queue_depth(table);
        let depth_b = b.queue_depth(table);

        if depth_a.abs_diff(depth_b) < epsilon {
            let route_a = a.can_route(qrp, qhv);
            let route_b = b.can_route(qrp, qhv);
            if route_a != route_b {
                return if route_a { Ordering::Less } else { Ordering::Greater };
            }
        }

        depth_a.cmp(&depth_b)
    });
}
