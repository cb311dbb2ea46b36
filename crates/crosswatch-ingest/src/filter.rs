//! Message admission: age gate, block phrases, normalization, short-term dedup.
//!
//! Applied identically to realtime and polled messages so the two delivery
//! modes cannot disagree about what enters the pipeline.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::debug;

use crosswatch_core::cache::RecentSet;
use crosswatch_core::text::{content_hash, normalize_text};
use crosswatch_core::types::{ChannelClass, ChannelPost};

use crate::transport::RemoteMessage;

/// Short-term exact-repeat window.
const DUP_CACHE_SIZE: usize = 500;

pub struct MessageFilter {
    started_at: DateTime<Utc>,
    block_phrases: Vec<String>,
    seen: Mutex<RecentSet>,
}

impl MessageFilter {
    pub fn new(started_at: DateTime<Utc>, block_phrases: Vec<String>) -> Self {
        Self {
            started_at,
            block_phrases,
            seen: Mutex::new(RecentSet::new(DUP_CACHE_SIZE)),
        }
    }

    /// Filter and normalize one remote message.
    ///
    /// Returns `None` for anything that must not reach the pipeline: own or
    /// bot-relayed messages, backlog older than the fan-in start, empty posts
    /// without media, block-phrase hits, and exact short-term repeats.
    pub fn admit(
        &self,
        remote: &RemoteMessage,
        channel: &str,
        class: ChannelClass,
    ) -> Option<ChannelPost> {
        if remote.outgoing || remote.from_bot {
            return None;
        }
        if remote.date < self.started_at {
            return None;
        }

        let text = normalize_text(&remote.text);
        if text.is_empty() && !remote.has_media() {
            return None;
        }
        if self.is_blocked(&text) {
            debug!(channel, "message dropped by block-phrase filter");
            return None;
        }

        let dup_key = if text.is_empty() {
            remote.dedup_key()
        } else {
            content_hash(&text)
        };
        if !self.seen.lock().unwrap().insert(&dup_key) {
            debug!(channel, "short-term duplicate dropped");
            return None;
        }

        Some(ChannelPost {
            text,
            channel: channel.to_string(),
            link: remote.permalink(),
            media_id: remote.media_id.clone(),
            class,
            received_at: remote.date,
        })
    }

    fn is_blocked(&self, text: &str) -> bool {
        self.block_phrases.iter().any(|p| text.contains(p.as_str()))
    }
}
