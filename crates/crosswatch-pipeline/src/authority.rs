//! Per-channel authority scoring with corroboration feedback and hourly decay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crosswatch_core::types::{ChannelClass, Event};
use crosswatch_store::{ScoreDeltas, Store};

use crate::error::Result;

pub const MAX_SCORE: f64 = 95.0;
pub const MIN_SCORE: f64 = 10.0;

/// Report backed by enough other channels.
const CORROBORATION_BOOST: f64 = 2.0;
/// Was first on a corroborated event.
const FIRST_TO_REPORT_BOOST: f64 = 3.0;
/// Urgent claim nobody backed.
const UNCORROBORATED_URGENT_PENALTY: f64 = -1.5;
/// Per-hour regression toward the class baseline.
const DECAY_RATE: f64 = 0.01;

/// Only persist decay movements larger than this.
const DECAY_EPSILON: f64 = 0.01;

pub struct AuthorityTracker {
    store: Arc<Store>,
    source_default: f64,
    smart_default: f64,
    scores: Mutex<HashMap<String, f64>>,
    baselines: Mutex<HashMap<String, f64>>,
}

impl AuthorityTracker {
    pub fn new(store: Arc<Store>, source_default: f64, smart_default: f64) -> Self {
        Self {
            store,
            source_default,
            smart_default,
            scores: Mutex::new(HashMap::new()),
            baselines: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a row exists for every configured channel and warm the caches.
    pub fn load(
        &self,
        source_channels: &[String],
        smart_channels: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        {
            let mut baselines = self.baselines.lock().unwrap();
            for channel in source_channels {
                self.store
                    .ensure_channel(channel, ChannelClass::Source, self.source_default, now)?;
                baselines.insert(channel.clone(), self.source_default);
            }
            for channel in smart_channels {
                self.store
                    .ensure_channel(channel, ChannelClass::Smart, self.smart_default, now)?;
                baselines.insert(channel.clone(), self.smart_default);
            }
        }
        let loaded = self.store.get_all_authorities()?;
        let count = loaded.len();
        *self.scores.lock().unwrap() = loaded;
        info!(channels = count, "authority scores loaded");
        Ok(())
    }

    pub fn score(&self, channel: &str) -> f64 {
        self.scores
            .lock()
            .unwrap()
            .get(channel)
            .copied()
            .unwrap_or(self.source_default)
    }

    /// Presentation label: high ≥ 80, medium ≥ 60, low otherwise.
    pub fn label(score: f64) -> &'static str {
        if score >= 80.0 {
            "גבוהה"
        } else if score >= 60.0 {
            "בינונית"
        } else {
            "נמוכה"
        }
    }

    /// Apply corroboration feedback: every contributor gets the boost, the
    /// earliest reporter (by `reported_at` source row) an extra bonus.
    pub fn on_event_corroborated(
        &self,
        event: &Event,
        first_channel: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for channel in &event.channels {
            self.adjust(
                channel,
                CORROBORATION_BOOST,
                ScoreDeltas {
                    corroborated: 1,
                    ..Default::default()
                },
                now,
            )?;
        }
        if let Some(first) = first_channel {
            self.adjust(
                first,
                FIRST_TO_REPORT_BOOST,
                ScoreDeltas {
                    first_to_report: 1,
                    ..Default::default()
                },
                now,
            )?;
        }
        debug!(event_id = %event.id.short(), sources = event.channels.len(), "corroboration boost");
        Ok(())
    }

    /// Penalize the sole contributor of an urgent event that expired without
    /// corroboration. No-op for non-urgent or multi-source events.
    pub fn on_event_expired_uncorroborated(
        &self,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !event.signature.is_urgent || event.channels.len() != 1 {
            return Ok(());
        }
        if let Some(channel) = event.channels.iter().next() {
            self.adjust(
                channel,
                UNCORROBORATED_URGENT_PENALTY,
                ScoreDeltas {
                    uncorroborated_urgent: 1,
                    ..Default::default()
                },
                now,
            )?;
            debug!(channel = %channel, "uncorroborated urgent penalty");
        }
        Ok(())
    }

    /// Hourly regression of every score toward its class baseline.
    pub fn apply_decay(&self, now: DateTime<Utc>) -> Result<()> {
        let mut updated = HashMap::new();
        {
            let mut scores = self.scores.lock().unwrap();
            let baselines = self.baselines.lock().unwrap();
            for (channel, score) in scores.iter_mut() {
                let baseline = baselines.get(channel).copied().unwrap_or(self.source_default);
                let next = clamp(*score - (*score - baseline) * DECAY_RATE);
                if (next - *score).abs() > DECAY_EPSILON {
                    *score = next;
                    updated.insert(channel.clone(), next);
                }
            }
        }
        if !updated.is_empty() {
            self.store.bulk_update_scores(&updated, now)?;
            debug!(channels = updated.len(), "decay applied");
        }
        Ok(())
    }

    /// Prompt context block: top contributors by score, with labels.
    pub fn context_block(&self, channels: &[String], top: usize) -> String {
        let mut scored: Vec<(&String, f64)> =
            channels.iter().map(|c| (c, self.score(c))).collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut out = String::from("אמינות המקורות:");
        for (channel, score) in scored.into_iter().take(top) {
            out.push_str(&format!(
                "\n@{} — {:.0} ({})",
                channel,
                score,
                Self::label(score)
            ));
        }
        out
    }

    fn adjust(
        &self,
        channel: &str,
        delta: f64,
        deltas: ScoreDeltas,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let new_score = clamp(self.score(channel) + delta);
        self.scores
            .lock()
            .unwrap()
            .insert(channel.to_string(), new_score);
        self.store.update_authority(channel, new_score, deltas, now)?;
        Ok(())
    }
}

fn clamp(score: f64) -> f64 {
    score.clamp(MIN_SCORE, MAX_SCORE)
}
