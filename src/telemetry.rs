//! Failure counters for best-effort writes
//!
//! Registry updates, response log entries and similar telemetry writes never
//! surface errors to callers. Each swallowed failure is logged at the call
//! site and counted here so operators can still see it on `/api/status`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Kind of swallowed failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Session upsert against the store failed
    RegistryWrite,
    /// Command response could not be appended
    ResponseWrite,
    /// Consumed targeted command could not be cleared
    CommandClear,
    /// Broadcast watermark could not be persisted locally
    WatermarkPersist,
    /// Device-seen event dropped because the queue was full
    SeenDropped,
}

#[derive(Debug, Default)]
struct Counters {
    registry_write: AtomicU64,
    response_write: AtomicU64,
    command_clear: AtomicU64,
    watermark_persist: AtomicU64,
    seen_dropped: AtomicU64,
}

impl Counters {
    const fn slot(&self, failure: Failure) -> &AtomicU64 {
        match failure {
            Failure::RegistryWrite => &self.registry_write,
            Failure::ResponseWrite => &self.response_write,
            Failure::CommandClear => &self.command_clear,
            Failure::WatermarkPersist => &self.watermark_persist,
            Failure::SeenDropped => &self.seen_dropped,
        }
    }
}

/// Shared failure counters, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    counters: Arc<Counters>,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub registry_write_failures: u64,
    pub response_write_failures: u64,
    pub command_clear_failures: u64,
    pub watermark_persist_failures: u64,
    pub seen_events_dropped: u64,
}

impl Telemetry {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one swallowed failure
    pub fn record(&self, failure: Failure) {
        self.counters.slot(failure).fetch_add(1, Ordering::Relaxed);
    }

    /// Current count for one failure kind
    #[must_use]
    pub fn count(&self, failure: Failure) -> u64 {
        self.counters.slot(failure).load(Ordering::Relaxed)
    }

    /// Read all counters
    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            registry_write_failures: self.count(Failure::RegistryWrite),
            response_write_failures: self.count(Failure::ResponseWrite),
            command_clear_failures: self.count(Failure::CommandClear),
            watermark_persist_failures: self.count(Failure::WatermarkPersist),
            seen_events_dropped: self.count(Failure::SeenDropped),
        }
    }
}
