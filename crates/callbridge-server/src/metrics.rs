//! Process-wide call counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic counters shared by every call task.
///
/// Created once at startup and never reset while the process runs.
#[derive(Debug, Default)]
pub struct Metrics {
    calls_initiated: AtomicU64,
    calls_connected: AtomicU64,
    conversions: AtomicU64,
    call_seconds: AtomicU64,
}

/// Serialized form served by `GET /api/metrics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub calls_made: u64,
    pub calls_connected: u64,
    pub conversions: u64,
    pub total_minutes: u64,
    pub active_calls: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// An outbound call was accepted by the gateway.
    pub fn record_call_initiated(&self) {
        self.calls_initiated.fetch_add(1, Ordering::Relaxed);
    }

    /// A media stream delivered a valid `start` event.
    pub fn record_call_connected(&self) {
        self.calls_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conversion(&self) {
        self.conversions.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds the length of a finished call, rounded down to whole seconds.
    pub fn record_call_duration(&self, duration: Duration) {
        self.call_seconds
            .fetch_add(duration.as_secs(), Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_calls: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            calls_made: self.calls_initiated.load(Ordering::Relaxed),
            calls_connected: self.calls_connected.load(Ordering::Relaxed),
            conversions: self.conversions.load(Ordering::Relaxed),
            total_minutes: self.call_seconds.load(Ordering::Relaxed) / 60,
            active_calls,
        }
    }
}
