//! Output rendering and dispatch with at-most-once delivery.
//!
//! Three report shapes: multi-source trend, high-authority single-source
//! alert, and the periodic batch digest. Every rendered body is fingerprinted
//! against a bounded recent-sends cache before going out, so retries and
//! overlapping loops can never double-post.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crosswatch_core::cache::RecentSet;
use crosswatch_core::text::content_hash;
use crosswatch_core::types::Event;
use crosswatch_ingest::ChatTransport;

use crate::authority::AuthorityTracker;

/// Recent-sends window.
const SENT_CACHE_SIZE: usize = 800;
/// Rendered-body fingerprint length (hex chars).
const SENT_KEY_LEN: usize = 16;
/// Max permalinks listed in a report footer.
const MAX_FOOTER_LINKS: usize = 5;

const DIVIDER: &str = "━━━━━━━━━━━━━━━━━━━━";

fn reliability_badge(score: f64) -> &'static str {
    if score >= 75.0 {
        "🟢"
    } else if score >= 55.0 {
        "🟡"
    } else {
        "🔴"
    }
}

fn verification_badge(sources: usize) -> &'static str {
    if sources >= 3 {
        "✅ מאומת"
    } else if sources == 2 {
        "🔄 חוזר"
    } else {
        "⚠️ מקור בודד"
    }
}

pub struct Dispatcher {
    transport: Arc<dyn ChatTransport>,
    authority: Arc<AuthorityTracker>,
    output_chat: i64,
    summary_chat: i64,
    sent_cache: Mutex<RecentSet>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        authority: Arc<AuthorityTracker>,
        output_chat: i64,
        summary_chat: i64,
    ) -> Self {
        Self {
            transport,
            authority,
            output_chat,
            summary_chat,
            sent_cache: Mutex::new(RecentSet::new(SENT_CACHE_SIZE)),
        }
    }

    /// Multi-source trend report.
    pub async fn send_trend_report(&self, event: &Event, body: &str) {
        let mut channels: Vec<&String> = event.channels.iter().collect();
        channels.sort();
        let sources_line = channels
            .iter()
            .map(|c| format!("@{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        let scores: Vec<f64> = channels.iter().map(|c| self.authority.score(c)).collect();
        let mean_score = if scores.is_empty() {
            50.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        let mut lines = vec![
            format!(
                "{} {} | אמינות: {}",
                reliability_badge(mean_score),
                verification_badge(event.channels.len()),
                AuthorityTracker::label(mean_score)
            ),
            DIVIDER.to_string(),
            body.to_string(),
            DIVIDER.to_string(),
            format!("📡 {} ערוצים: {}", event.channels.len(), sources_line),
        ];
        for link in event.links.iter().take(MAX_FOOTER_LINKS) {
            lines.push(format!("🔗 {link}"));
        }
        if event.is_cross_class() {
            lines.push("🔗 אושש גם ע\"י מקורות ישראליים".to_string());
        }

        let report = lines.join("\n");
        if self.deliver(self.output_chat, &report).await {
            info!(
                event_id = %event.id.short(),
                sources = event.channels.len(),
                "trend report sent"
            );
        }
    }

    /// Single-source alert for a high-authority channel.
    pub async fn send_single_source_alert(&self, event: &Event, body: &str) {
        let Some(channel) = event.channels.iter().next() else {
            return;
        };
        let score = self.authority.score(channel);

        let mut lines = vec![
            format!(
                "{} {} | אמינות: {}",
                reliability_badge(score),
                verification_badge(1),
                AuthorityTracker::label(score)
            ),
            DIVIDER.to_string(),
            body.to_string(),
            DIVIDER.to_string(),
            format!("📡 @{channel}"),
        ];
        for link in event.links.iter().take(MAX_FOOTER_LINKS) {
            lines.push(format!("🔗 {link}"));
        }

        let report = lines.join("\n");
        if self.deliver(self.output_chat, &report).await {
            info!(channel = %channel, score, "single-source alert sent");
        }
    }

    /// Periodic digest of uncorrelated messages.
    pub async fn send_batch_digest(&self, body: &str) {
        if body.is_empty() {
            return;
        }
        let report = format!("📋 סיכום תקופתי\n{DIVIDER}\n{body}");
        if self.deliver(self.summary_chat, &report).await {
            info!("batch digest sent");
        }
    }

    /// Send unless this exact rendered body went out recently.
    /// Returns whether a send actually happened.
    async fn deliver(&self, chat_id: i64, report: &str) -> bool {
        let key: String = content_hash(report).chars().take(SENT_KEY_LEN).collect();
        if !self.sent_cache.lock().unwrap().insert(&key) {
            debug!("duplicate output suppressed");
            return false;
        }
        match self.transport.send_text(chat_id, report).await {
            Ok(()) => true,
            Err(e) => {
                warn!("output send failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use crosswatch_core::types::{ChannelClass, EventId, EventSignature};
    use crosswatch_ingest::{RemoteMessage, TransportError};
    use crosswatch_store::Store;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct RecordingTransport {
        sent: Mutex<Vec<(i64, String)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(i64, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }
        async fn join_channel(&self, _username: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn resolve_channel(&self, _username: &str) -> Result<i64, TransportError> {
            Ok(0)
        }
        async fn fetch_after(
            &self,
            _chat_id: i64,
            _min_id: i64,
            _limit: usize,
        ) -> Result<Vec<RemoteMessage>, TransportError> {
            Ok(vec![])
        }
        async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
        async fn forward_message(
            &self,
            _chat_id: i64,
            _message: &RemoteMessage,
            _caption: &str,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn subscribe(
            &self,
            _chat_ids: Vec<i64>,
        ) -> Result<mpsc::Receiver<RemoteMessage>, TransportError> {
            Err(TransportError::Unsupported("subscribe"))
        }
        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn event(channels: &[(&str, ChannelClass)], links: &[&str]) -> Event {
        let mut event = Event {
            id: EventId::new(),
            signature: EventSignature::default(),
            texts: vec!["body".into()],
            channels: Default::default(),
            channel_classes: HashMap::new(),
            links: links.iter().map(|l| l.to_string()).collect(),
            first_ts: Utc::now(),
            last_updated: Utc::now(),
            sent: false,
        };
        for (ch, class) in channels {
            event.channels.insert(ch.to_string());
            event.channel_classes.insert(ch.to_string(), *class);
        }
        event
    }

    fn dispatcher(transport: Arc<RecordingTransport>) -> Dispatcher {
        let authority = Arc::new(AuthorityTracker::new(
            Arc::new(Store::open_in_memory().unwrap()),
            50.0,
            60.0,
        ));
        Dispatcher::new(transport, authority, -100, -100)
    }

    #[test]
    fn badges() {
        assert_eq!(reliability_badge(80.0), "🟢");
        assert_eq!(reliability_badge(60.0), "🟡");
        assert_eq!(reliability_badge(30.0), "🔴");
        assert!(verification_badge(3).contains("מאומת"));
        assert!(verification_badge(2).contains("חוזר"));
        assert!(verification_badge(1).contains("בודד"));
    }

    #[tokio::test]
    async fn trend_report_lists_sources_and_caps_links() {
        let transport = RecordingTransport::new();
        let d = dispatcher(transport.clone());
        let links: Vec<String> = (0..8).map(|i| format!("https://t.me/c{i}/1")).collect();
        let link_refs: Vec<&str> = links.iter().map(|s| s.as_str()).collect();
        let ev = event(
            &[("alpha", ChannelClass::Source), ("beta", ChannelClass::Source)],
            &link_refs,
        );

        d.send_trend_report(&ev, "סיכום").await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let body = &sent[0].1;
        assert!(body.contains("@alpha"));
        assert!(body.contains("@beta"));
        assert_eq!(body.matches("🔗 https://").count(), 5);
        assert!(body.contains("🔄 חוזר"));
    }

    #[tokio::test]
    async fn cross_class_note_appears_when_both_lists_contribute() {
        let transport = RecordingTransport::new();
        let d = dispatcher(transport.clone());
        let ev = event(
            &[("raw", ChannelClass::Source), ("analysis", ChannelClass::Smart)],
            &[],
        );
        d.send_trend_report(&ev, "סיכום").await;
        assert!(transport.sent()[0].1.contains("אושש גם"));
    }

    #[tokio::test]
    async fn duplicate_rendered_output_is_sent_once() {
        let transport = RecordingTransport::new();
        let d = dispatcher(transport.clone());
        let ev = event(&[("alpha", ChannelClass::Source)], &[]);

        d.send_single_source_alert(&ev, "גוף").await;
        d.send_single_source_alert(&ev, "גוף").await;
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn batch_digest_goes_to_summary_chat_and_skips_empty() {
        let transport = RecordingTransport::new();
        let authority = Arc::new(AuthorityTracker::new(
            Arc::new(Store::open_in_memory().unwrap()),
            50.0,
            60.0,
        ));
        let d = Dispatcher::new(transport.clone(), authority, -100, -300);

        d.send_batch_digest("").await;
        assert!(transport.sent().is_empty());

        d.send_batch_digest("תקציר").await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, -300);
        assert!(sent[0].1.starts_with("📋"));
    }
}
