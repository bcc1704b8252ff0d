//! Metrics sink abstraction.
//!
//! The worker owns the real metrics pipeline; backends only need a counter
//! mark and a timer. Injecting the sink keeps backends free of any global
//! registry.

use std::time::Instant;

/// Counter and timer sink implemented by the worker's metrics pipeline.
pub trait MetricsSink: Send + Sync {
    /// Increments the counter named `name`.
    fn mark(&self, name: &str);

    /// Records the elapsed time since `started` under `name`.
    fn time_since(&self, name: &str, started: Instant);
}

/// Sink that discards every measurement.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn mark(&self, _name: &str) {}

    fn time_since(&self, _name: &str, _started: Instant) {}
}
