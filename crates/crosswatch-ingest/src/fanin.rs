//! Multi-session ingest fan-in.
//!
//! Session 0 is the send-capable identity; sessions 1..N-1 are read-only
//! readers. The watched channel list is partitioned round-robin so each
//! channel is observed by exactly one session. Per session, a realtime
//! subscription and a polling scanner feed the same bounded queue; the
//! scanner exists to close gaps when the realtime stream silently drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crosswatch_core::cache::RecentSet;
use crosswatch_core::config::IngestConfig;
use crosswatch_core::types::{ChannelClass, ChannelPost};

use crate::filter::MessageFilter;
use crate::transport::{ChatTransport, RemoteMessage, TransportError};

/// Restart delay after an unexpected scanner failure.
const SCANNER_BACKOFF_SECS: u64 = 5;
/// Mirror-forward dedup window (albums, media, reposts).
const FORWARD_DEDUP_SIZE: usize = 2000;

/// One input channel plus the list it came from.
#[derive(Debug, Clone)]
pub struct WatchedChannel {
    pub username: String,
    pub class: ChannelClass,
}

/// Round-robin split of `channels` across `sessions` readers.
pub fn partition_round_robin(
    channels: &[WatchedChannel],
    sessions: usize,
) -> Vec<Vec<WatchedChannel>> {
    let n = sessions.max(1);
    (0..n)
        .map(|i| channels.iter().skip(i).step_by(n).cloned().collect())
        .collect()
}

pub struct FanIn {
    sessions: Vec<Arc<dyn ChatTransport>>,
    channels: Vec<WatchedChannel>,
    config: IngestConfig,
    inner: Arc<Inner>,
}

/// State shared between the scanner and realtime tasks of every session.
struct Inner {
    filter: MessageFilter,
    forward_dedup: Mutex<RecentSet>,
    /// Session 0 — the only send-capable identity.
    sender: Arc<dyn ChatTransport>,
    smart_chat: i64,
    tx: mpsc::Sender<ChannelPost>,
}

impl FanIn {
    pub fn new(
        sessions: Vec<Arc<dyn ChatTransport>>,
        channels: Vec<WatchedChannel>,
        config: IngestConfig,
        smart_chat: i64,
        filter: MessageFilter,
        tx: mpsc::Sender<ChannelPost>,
    ) -> Self {
        let sender = Arc::clone(&sessions[0]);
        Self {
            sessions,
            channels,
            config,
            inner: Arc::new(Inner {
                filter,
                forward_dedup: Mutex::new(RecentSet::new(FORWARD_DEDUP_SIZE)),
                sender,
                smart_chat,
                tx,
            }),
        }
    }

    /// Spawn one task per session. Each joins its channels, subscribes a
    /// realtime consumer, then runs the polling scanner until shutdown.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let assignments = partition_round_robin(&self.channels, self.sessions.len());
        info!(
            sessions = self.sessions.len(),
            channels = self.channels.len(),
            "fan-in starting"
        );

        let config = self.config.clone();
        let inner = Arc::clone(&self.inner);
        self.sessions
            .into_iter()
            .zip(assignments)
            .map(|(session, assigned)| {
                let config = config.clone();
                let inner = Arc::clone(&inner);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_session(session, assigned, config, inner, shutdown).await;
                })
            })
            .collect()
    }
}

async fn run_session(
    session: Arc<dyn ChatTransport>,
    assigned: Vec<WatchedChannel>,
    config: IngestConfig,
    inner: Arc<Inner>,
    mut shutdown: watch::Receiver<bool>,
) {
    if assigned.is_empty() {
        debug!(session = session.name(), "no channels assigned");
        return;
    }

    join_channels(&session, &assigned).await;
    let watched = resolve_channels(&session, &assigned).await;
    if watched.is_empty() {
        warn!(session = session.name(), "no channels resolved, session idle");
        return;
    }

    let chat_ids: Vec<i64> = watched.keys().copied().collect();
    match session.subscribe(chat_ids).await {
        Ok(rx) => {
            let session2 = Arc::clone(&session);
            let watched2 = watched.clone();
            let inner2 = Arc::clone(&inner);
            let shutdown2 = shutdown.clone();
            tokio::spawn(async move {
                run_realtime(session2, watched2, inner2, rx, shutdown2).await;
            });
        }
        Err(TransportError::Unsupported(what)) => {
            info!(session = session.name(), what, "realtime subscription unavailable");
        }
        Err(e) => {
            warn!(session = session.name(), "realtime subscription failed: {e}");
        }
    }

    run_scanner(session, watched, config, inner, &mut shutdown).await;
}

async fn join_channels(session: &Arc<dyn ChatTransport>, assigned: &[WatchedChannel]) {
    for channel in assigned {
        match session.join_channel(&channel.username).await {
            Ok(()) => debug!(session = session.name(), channel = %channel.username, "joined"),
            Err(TransportError::FloodWait { seconds }) => {
                warn!(
                    session = session.name(),
                    channel = %channel.username,
                    seconds,
                    "flood wait while joining"
                );
                tokio::time::sleep(Duration::from_secs(seconds)).await;
            }
            Err(TransportError::Unsupported(_)) => {
                debug!(
                    session = session.name(),
                    channel = %channel.username,
                    "transport cannot self-join, assuming membership"
                );
            }
            Err(e) => {
                warn!(session = session.name(), channel = %channel.username, "join failed: {e}");
            }
        }
    }
}

async fn resolve_channels(
    session: &Arc<dyn ChatTransport>,
    assigned: &[WatchedChannel],
) -> HashMap<i64, WatchedChannel> {
    let mut watched = HashMap::new();
    for channel in assigned {
        match session.resolve_channel(&channel.username).await {
            Ok(chat_id) => {
                watched.insert(chat_id, channel.clone());
            }
            Err(e) => {
                warn!(
                    session = session.name(),
                    channel = %channel.username,
                    "resolve failed, channel skipped: {e}"
                );
            }
        }
    }
    watched
}

async fn run_realtime(
    session: Arc<dyn ChatTransport>,
    watched: HashMap<i64, WatchedChannel>,
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<RemoteMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(session = session.name(), "realtime consumer started");
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(remote) => {
                    if let Some(channel) = watched.get(&remote.chat_id) {
                        inner.handle_remote(&remote, channel).await;
                    }
                }
                None => {
                    warn!(session = session.name(), "realtime stream closed");
                    break;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Per-channel backlog scanner: remembers the highest message id seen and
/// fetches anything newer, ascending, capped per batch.
///
/// Flood-wait suspends only this session; other sessions continue. Any other
/// failure logs and the round resumes after a fixed back-off — the scanner
/// never crashes the process.
async fn run_scanner(
    session: Arc<dyn ChatTransport>,
    watched: HashMap<i64, WatchedChannel>,
    config: IngestConfig,
    inner: Arc<Inner>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let spacing =
        Duration::from_millis(60_000 / u64::from(config.max_requests_per_minute.max(1)));
    let round_gap = Duration::from_secs(config.round_gap_secs);
    let mut last_seen: HashMap<i64, i64> = HashMap::new();

    info!(session = session.name(), channels = watched.len(), "scanner started");
    loop {
        for (chat_id, channel) in &watched {
            if *shutdown.borrow() {
                return;
            }
            let min_id = last_seen.get(chat_id).copied().unwrap_or(0);
            match session
                .fetch_after(*chat_id, min_id, config.scan_batch_limit)
                .await
            {
                Ok(batch) => {
                    for remote in batch {
                        let entry = last_seen.entry(*chat_id).or_insert(0);
                        if remote.id > *entry {
                            *entry = remote.id;
                        }
                        inner.handle_remote(&remote, channel).await;
                    }
                }
                Err(TransportError::FloodWait { seconds }) => {
                    warn!(
                        session = session.name(),
                        channel = %channel.username,
                        seconds,
                        "flood wait, suspending session"
                    );
                    if wait_or_shutdown(Duration::from_secs(seconds), shutdown).await {
                        return;
                    }
                }
                Err(TransportError::Unsupported(what)) => {
                    info!(
                        session = session.name(),
                        what, "transport has no history access, polling disabled"
                    );
                    return;
                }
                Err(e) => {
                    error!(
                        session = session.name(),
                        channel = %channel.username,
                        "scan error, backing off: {e}"
                    );
                    if wait_or_shutdown(Duration::from_secs(SCANNER_BACKOFF_SECS), shutdown).await {
                        return;
                    }
                }
            }
            if wait_or_shutdown(spacing, shutdown).await {
                return;
            }
        }
        if wait_or_shutdown(round_gap, shutdown).await {
            return;
        }
    }
}

impl Inner {
    /// Common handling for both delivery modes.
    async fn handle_remote(&self, remote: &RemoteMessage, channel: &WatchedChannel) {
        let Some(post) = self.filter.admit(remote, &channel.username, channel.class) else {
            return;
        };

        if channel.class == ChannelClass::Smart {
            self.mirror_smart(remote).await;
        }

        // Bounded queue: this await is the backpressure point.
        if self.tx.send(post).await.is_err() {
            warn!("pipeline queue closed, dropping message");
        }
    }

    /// Forward a smart-channel message (media included) to the smart output
    /// chat, with the permalink appended. Albums forward once, keyed on their
    /// group id.
    async fn mirror_smart(&self, remote: &RemoteMessage) {
        if !self.forward_dedup.lock().unwrap().insert(&remote.dedup_key()) {
            return;
        }
        let caption = match remote.permalink() {
            Some(link) => format!("{}\n\n{}", remote.text, link),
            None => remote.text.clone(),
        };
        if let Err(e) = self
            .sender
            .forward_message(self.smart_chat, remote, caption.trim())
            .await
        {
            warn!(session = self.sender.name(), "smart mirror failed: {e}");
        }
    }
}

/// Sleep, returning early (true) when shutdown fires.
async fn wait_or_shutdown(dur: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;

    fn ch(name: &str, class: ChannelClass) -> WatchedChannel {
        WatchedChannel {
            username: name.to_string(),
            class,
        }
    }

    #[test]
    fn round_robin_covers_every_channel_exactly_once() {
        let channels: Vec<WatchedChannel> = (0..7)
            .map(|i| ch(&format!("c{i}"), ChannelClass::Source))
            .collect();
        let parts = partition_round_robin(&channels, 3);
        assert_eq!(parts.len(), 3);
        let total: usize = parts.iter().map(|p| p.len()).sum();
        assert_eq!(total, 7);
        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 2);

        let mut seen: Vec<&str> = parts
            .iter()
            .flatten()
            .map(|c| c.username.as_str())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn round_robin_with_more_sessions_than_channels() {
        let channels = vec![ch("only", ChannelClass::Smart)];
        let parts = partition_round_robin(&channels, 4);
        assert_eq!(parts[0].len(), 1);
        assert!(parts[1..].iter().all(|p| p.is_empty()));
    }

    /// In-memory transport: scripted per-channel messages, records sends.
    struct MockTransport {
        name: String,
        chats: HashMap<String, i64>,
        messages: Mutex<HashMap<i64, Vec<RemoteMessage>>>,
        forwarded: Mutex<Vec<(i64, String)>>,
    }

    impl MockTransport {
        fn new(name: &str, chats: &[(&str, i64)]) -> Self {
            Self {
                name: name.to_string(),
                chats: chats
                    .iter()
                    .map(|(u, id)| (u.to_string(), *id))
                    .collect(),
                messages: Mutex::new(HashMap::new()),
                forwarded: Mutex::new(Vec::new()),
            }
        }

        fn push_message(&self, chat_id: i64, id: i64, username: &str, text: &str) {
            self.messages
                .lock()
                .unwrap()
                .entry(chat_id)
                .or_default()
                .push(RemoteMessage {
                    id,
                    chat_id,
                    chat_username: Some(username.to_string()),
                    text: text.to_string(),
                    date: Utc::now(),
                    media_id: None,
                    grouped_id: None,
                    outgoing: false,
                    from_bot: false,
                });
        }
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        fn name(&self) -> &str {
            &self.name
        }

        async fn join_channel(&self, _username: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn resolve_channel(&self, username: &str) -> Result<i64, TransportError> {
            self.chats
                .get(username)
                .copied()
                .ok_or_else(|| TransportError::Other(format!("unknown channel {username}")))
        }

        async fn fetch_after(
            &self,
            chat_id: i64,
            min_id: i64,
            limit: usize,
        ) -> Result<Vec<RemoteMessage>, TransportError> {
            let messages = self.messages.lock().unwrap();
            let mut batch: Vec<RemoteMessage> = messages
                .get(&chat_id)
                .map(|m| m.iter().filter(|m| m.id > min_id).cloned().collect())
                .unwrap_or_default();
            batch.sort_by_key(|m| m.id);
            batch.truncate(limit);
            Ok(batch)
        }

        async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
            self.forwarded
                .lock()
                .unwrap()
                .push((chat_id, text.to_string()));
            Ok(())
        }

        async fn forward_message(
            &self,
            chat_id: i64,
            _message: &RemoteMessage,
            caption: &str,
        ) -> Result<(), TransportError> {
            self.forwarded
                .lock()
                .unwrap()
                .push((chat_id, caption.to_string()));
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

    #[tokio::test]
    async fn scanner_delivers_and_mirrors_smart_posts() {
        let transport = Arc::new(MockTransport::new(
            "main",
            &[("rawnews", -1), ("analysis", -2)],
        ));
        transport.push_message(-1, 10, "rawnews", "انفجار في المنطقة");
        transport.push_message(-2, 11, "analysis", "ניתוח מצב");

        let (tx, mut rx) = mpsc::channel(16);
        let filter = MessageFilter::new(Utc::now() - chrono::Duration::minutes(1), vec![]);
        let mut config = IngestConfig::default();
        config.max_requests_per_minute = 60_000;
        config.round_gap_secs = 3600;

        let fanin = FanIn::new(
            vec![transport.clone() as Arc<dyn ChatTransport>],
            vec![
                ch("rawnews", ChannelClass::Source),
                ch("analysis", ChannelClass::Smart),
            ],
            config,
            -900,
            filter,
            tx,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = fanin.spawn(shutdown_rx);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let mut channels = vec![first.channel.clone(), second.channel.clone()];
        channels.sort();
        assert_eq!(channels, vec!["analysis", "rawnews"]);

        // The smart post was mirrored to the smart chat with its permalink.
        let forwarded = transport.forwarded.lock().unwrap().clone();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0, -900);
        assert!(forwarded[0].1.contains("https://t.me/analysis/11"));

        shutdown_tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn scanner_does_not_refetch_seen_ids() {
        let transport = Arc::new(MockTransport::new("main", &[("rawnews", -1)]));
        transport.push_message(-1, 5, "rawnews", "first report");

        let (tx, mut rx) = mpsc::channel(16);
        let filter = MessageFilter::new(Utc::now() - chrono::Duration::minutes(1), vec![]);
        let mut config = IngestConfig::default();
        config.max_requests_per_minute = 60_000;
        config.round_gap_secs = 3600;

        let fanin = FanIn::new(
            vec![transport.clone() as Arc<dyn ChatTransport>],
            vec![ch("rawnews", ChannelClass::Source)],
            config,
            -900,
            filter,
            tx,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = fanin.spawn(shutdown_rx);

        assert_eq!(rx.recv().await.unwrap().text, "first report");
        // A second identical fetch would be dropped by min_id tracking before
        // the dedup cache ever sees it; nothing else arrives.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );

        shutdown_tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }
}
