use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for a [crate::Client].
#[derive(Default)]
pub struct Metrics {
    /// Blocks served from the local memory tier.
    pub local_hits: Counter,
    /// Blocks served by a remote node.
    pub remote_hits: Counter,
    /// Connections attempted to remote nodes.
    pub remote_attempts: Counter,
    /// Remote nodes that answered that they do not hold the block.
    pub remote_misses: Counter,
    /// Remote attempts that failed (unreachable, timeout, or malformed response).
    pub remote_failures: Counter,
    /// Reads that no cache tier could serve.
    pub misses: Counter,
    /// Blocks successfully recached.
    pub recache_success: Counter,
    /// Blocks that failed to recache.
    pub recache_failure: Counter,
    /// Locks currently held.
    pub locks_outstanding: Gauge,
}

impl Metrics {
    /// Create and register metrics in the provided registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "local_hits",
            "Blocks served from the local memory tier",
            metrics.local_hits.clone(),
        );
        registry.register(
            "remote_hits",
            "Blocks served by a remote node",
            metrics.remote_hits.clone(),
        );
        registry.register(
            "remote_attempts",
            "Connections attempted to remote nodes",
            metrics.remote_attempts.clone(),
        );
        registry.register(
            "remote_misses",
            "Remote nodes that did not hold the requested block",
            metrics.remote_misses.clone(),
        );
        registry.register(
            "remote_failures",
            "Remote attempts that failed",
            metrics.remote_failures.clone(),
        );
        registry.register(
            "misses",
            "Reads that no cache tier could serve",
            metrics.misses.clone(),
        );
        registry.register(
            "recache_success",
            "Blocks successfully recached",
            metrics.recache_success.clone(),
        );
        registry.register(
            "recache_failure",
            "Blocks that failed to recache",
            metrics.recache_failure.clone(),
        );
        registry.register(
            "locks_outstanding",
            "Locks currently held",
            metrics.locks_outstanding.clone(),
        );
        metrics
    }
}
