//! Chat-transport interface.
//!
//! The pipeline never talks to a concrete client library; it sees this trait.
//! Session 0 must be send-capable, further sessions may be read-only readers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crosswatch_core::text::content_hash;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Rate-limit signal: suspend this session for the given interval.
    #[error("flood wait: retry after {seconds}s")]
    FloodWait { seconds: u64 },

    /// Session credentials rejected. Fatal for the process.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The capability is not available on this transport (e.g. history
    /// iteration on a bot-token session). Callers degrade, not crash.
    #[error("unsupported by this transport: {0}")]
    Unsupported(&'static str),

    #[error("transport error: {0}")]
    Other(String),
}

/// One message as observed on a remote channel, before normalization.
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub id: i64,
    pub chat_id: i64,
    pub chat_username: Option<String>,
    pub text: String,
    pub date: DateTime<Utc>,
    pub media_id: Option<String>,
    pub grouped_id: Option<String>,
    pub outgoing: bool,
    pub from_bot: bool,
}

impl RemoteMessage {
    /// `https://t.me/<username>/<id>` when the chat has a public username.
    pub fn permalink(&self) -> Option<String> {
        self.chat_username
            .as_ref()
            .map(|u| format!("https://t.me/{}/{}", u, self.id))
    }

    pub fn has_media(&self) -> bool {
        self.media_id.is_some()
    }

    /// Key used to deduplicate mirror forwards: albums collapse onto their
    /// group id, media onto its identifier, plain text onto its hash.
    pub fn dedup_key(&self) -> String {
        if let Some(group) = &self.grouped_id {
            format!("album:{group}")
        } else if let Some(media) = &self.media_id {
            format!("media:{media}")
        } else {
            format!("text:{}", content_hash(self.text.trim()))
        }
    }
}

/// A single channel session (one account / one token).
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Session label for log lines (e.g. `"main"`, `"reader-2"`).
    fn name(&self) -> &str;

    /// Join a public channel by username. May return `FloodWait`.
    async fn join_channel(&self, username: &str) -> Result<(), TransportError>;

    /// Resolve a channel username to its numeric chat id.
    async fn resolve_channel(&self, username: &str) -> Result<i64, TransportError>;

    /// Fetch messages with id strictly greater than `min_id`, ascending,
    /// at most `limit`.
    async fn fetch_after(
        &self,
        chat_id: i64,
        min_id: i64,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, TransportError>;

    /// Send plain text to a chat. Only valid on a send-capable session.
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TransportError>;

    /// Mirror a message (media included where possible) with a caption.
    async fn forward_message(
        &self,
        chat_id: i64,
        message: &RemoteMessage,
        caption: &str,
    ) -> Result<(), TransportError>;

    /// Subscribe to realtime messages from the given chats.
    async fn subscribe(
        &self,
        chat_ids: Vec<i64>,
    ) -> Result<mpsc::Receiver<RemoteMessage>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> RemoteMessage {
        RemoteMessage {
            id: 42,
            chat_id: -100,
            chat_username: Some("newsroom".into()),
            text: "hello".into(),
            date: Utc::now(),
            media_id: None,
            grouped_id: None,
            outgoing: false,
            from_bot: false,
        }
    }

    #[test]
    fn permalink_requires_username() {
        assert_eq!(
            msg().permalink().as_deref(),
            Some("https://t.me/newsroom/42")
        );
        let mut anon = msg();
        anon.chat_username = None;
        assert!(anon.permalink().is_none());
    }

    #[test]
    fn dedup_key_prefers_album_then_media() {
        let mut m = msg();
        m.media_id = Some("photo-1".into());
        assert_eq!(m.dedup_key(), "media:photo-1");
        m.grouped_id = Some("g7".into());
        assert_eq!(m.dedup_key(), "album:g7");
        let plain = msg();
        assert!(plain.dedup_key().starts_with("text:"));
    }
}
