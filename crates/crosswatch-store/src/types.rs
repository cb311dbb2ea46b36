use chrono::{DateTime, Utc};

use crosswatch_core::types::{EventId, EventSignature};

/// Per-reason counter increments applied together with a score write.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreDeltas {
    pub corroborated: i64,
    pub first_to_report: i64,
    pub uncorroborated_urgent: i64,
}

/// A `pending` event row, as loaded for pool restore.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event_id: EventId,
    pub signature: EventSignature,
    pub first_seen: DateTime<Utc>,
    pub source_count: i64,
}

/// One `event_sources` row, ordered by `reported_at` when listed.
#[derive(Debug, Clone)]
pub struct EventSourceRow {
    pub channel: String,
    pub reported_at: DateTime<Utc>,
    pub raw_text: Option<String>,
    pub link: Option<String>,
}
