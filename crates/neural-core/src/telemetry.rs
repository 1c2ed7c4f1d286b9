//! Fire-and-forget telemetry sink.

use serde::Serialize;
use tracing::info;

/// One record handed to the telemetry sink.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Turn {
        session_id: String,
        app_context: String,
        outcome: String,
        iterations: u32,
        revisions: u32,
        tool_calls: u32,
        duration_ms: u64,
    },
    Compaction {
        session_id: String,
        app_context: String,
        turns_dropped: usize,
        tokens_before: u32,
        tokens_after: u32,
    },
}

/// Implementations must return quickly; the engine never awaits them.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: TelemetryRecord);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn record(&self, _record: TelemetryRecord) {}
}

/// Writes records as structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, record: TelemetryRecord) {
        match serde_json::to_string(&record) {
            Ok(json) => info!(target: "neural::telemetry", "{}", json),
            Err(e) => info!(target: "neural::telemetry", "unserializable record: {}", e),
        }
    }
}
