//! Engine configuration.

use std::time::Duration;

/// Tunables for the dynamic query engine.
///
/// The defaults are the values the engine was tuned with on the live
/// overlay; tests override individual fields with struct update syntax.
#[derive(Debug, Clone)]
pub struct DqConfig {
    /// Hard deadline on a query's whole life, lingering included.
    pub max_lifetime: Duration,
    /// How long a terminated query lingers to keep accounting late hits.
    pub linger_timeout: Duration,
    /// Extra wait per probed connection before the first iteration.
    pub probe_extra_timeout: Duration,
    /// Extra wait per pending (queued, unacknowledged) message.
    pub pending_extra_timeout: Duration,
    /// Initial wait for results between iterations.
    pub base_result_timeout: Duration,
    /// Floor for the result timeout once it starts shrinking.
    pub min_result_timeout: Duration,
    /// Step by which the result timeout shrinks for rare queries.
    pub timeout_adjust: Duration,
    /// Floor for the wait on a guidance reply from the leaf.
    pub guidance_timeout_floor: Duration,
    /// Maximum messages queued but not yet acknowledged by the layer.
    pub max_pending: u32,
    /// Guidance timeouts tolerated before the leaf is deemed non-guiding.
    pub max_guidance_timeouts: u32,
    /// Ultrapeers queried between two guidance requests.
    pub guidance_threshold: u32,
    /// New results required before guidance is worth asking for.
    pub min_new_for_guidance: u32,
    /// Result target for a query issued by a leaf.
    pub leaf_target: u32,
    /// Result target for a query issued by the local node.
    pub local_target: u32,
    /// Divisor applied to the target when the query carries a URN.
    pub urn_divisor: u32,
    /// Ultrapeers contacted by the initial probe.
    pub probe_fanout: usize,
    /// Stop once the estimated horizon covers this many hosts.
    pub max_horizon: u32,
    /// Horizon above which the result timeout may start shrinking.
    pub adjust_threshold: u32,
    /// Result mark (scaled by horizon) below which a query counts as rare.
    pub low_results: u32,
    /// Worst-case percentage of results a leaf is assumed to keep.
    pub kept_percent: u32,
    /// Highest TTL ever put on the wire.
    pub max_ttl: u8,
    /// Send-queue depths within this many bytes compare as equal.
    pub queue_epsilon: u32,
    /// Per-hop deperdition corrector for the theoretical horizon.
    pub fuzzy_factor: f64,
    /// Ultrapeers a leaf is assumed to query in parallel.
    pub ultra_fanout: u32,
    /// TTL used when launching queries for local searches.
    pub my_ttl: u8,
    /// Configured connection budget; with `normal_connections` it bounds
    /// how many ultrapeers a single query may reach.
    pub max_connections: u32,
    /// Connections reserved for non-query traffic.
    pub normal_connections: u32,
}

impl Default for DqConfig {
    fn default() -> Self {
        Self {
            max_lifetime: Duration::from_secs(600),
            linger_timeout: Duration::from_secs(180),
            probe_extra_timeout: Duration::from_millis(1500),
            pending_extra_timeout: Duration::from_millis(1200),
            base_result_timeout: Duration::from_millis(3700),
            min_result_timeout: Duration::from_millis(1500),
            timeout_adjust: Duration::from_millis(100),
            guidance_timeout_floor: Duration::from_secs(40),
            max_pending: 3,
            max_guidance_timeouts: 2,
            guidance_threshold: 3,
            min_new_for_guidance: 20,
            leaf_target: 50,
            local_target: 150,
            urn_divisor: 25,
            probe_fanout: 3,
            max_horizon: 500_000,
            adjust_threshold: 3000,
            low_results: 10,
            kept_percent: 5,
            max_ttl: 5,
            queue_epsilon: 2048,
            fuzzy_factor: 0.80,
            ultra_fanout: 3,
            my_ttl: 4,
            max_connections: 32,
            normal_connections: 0,
        }
    }
}

impl DqConfig {
    /// Ultrapeers a single query may reach before it is stopped.
    pub fn max_queried_ups(&self) -> u32 {
        self.max_connections.saturating_sub(self.normal_connections)
    }

    /// Result target for a query, URN decimation applied.
    pub(crate) fn target(&self, local: bool, has_urn: bool) -> u32 {
        let base = if local { self.local_target } else { self.leaf_target };
        if has_urn {
            (base / self.urn_divisor).max(1)
        } else {
            base
        }
    }

    /// Results that end even a leaf-guided query, whatever gets filtered.
    pub(crate) fn final_target(&self, max_results: u32) -> u32 {
        max_results * 100 / self.kept_percent.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urn_targets_are_decimated() {
        let config = DqConfig::default();
        assert_eq!(config.target(false, false), 50);
        assert_eq!(config.target(false, true), 2);
        assert_eq!(config.target(true, false), 150);
        assert_eq!(config.target(true, true), 6);
    }

    #[test]
    fn final_target_scales_by_kept_percentage() {
        let config = DqConfig::default();
        assert_eq!(config.final_target(50), 1000);
        assert_eq!(config.final_target(2), 40);
    }
}
