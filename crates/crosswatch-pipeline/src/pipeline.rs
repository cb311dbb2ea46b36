//! Pipeline orchestration: dedup → extract → pool ingest, plus the
//! aggregator and maintenance loops.
//!
//! `process` is the single entry point for every ingested message. Once it
//! returns, the message is persisted as a new event's first source, merged
//! into an existing event, enqueued in the batch collector, or explicitly
//! dropped — never lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crosswatch_core::cache::RecentSet;
use crosswatch_core::clock::Clock;
use crosswatch_core::config::PipelineConfig;
use crosswatch_core::text::{clip, content_hash, looks_urgent};
use crosswatch_core::types::{ChannelPost, Event};
use crosswatch_llm::LlmClient;
use crosswatch_store::Store;

use crate::authority::AuthorityTracker;
use crate::batch::BatchCollector;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::pool::EventPool;

/// In-memory short-term dedup window.
const DUP_CACHE_SIZE: usize = 500;
/// A sole source at or above this score earns a single-source alert.
const SINGLE_ALERT_SCORE: f64 = 80.0;
/// Channels listed in the authority context block.
const AUTHORITY_CONTEXT_TOP: usize = 3;
/// Single-source alert body clip.
const SINGLE_BODY_MAX: usize = 500;

/// Hourly-logged counters.
#[derive(Default)]
pub struct Stats {
    messages: AtomicU64,
    events: AtomicU64,
    summaries: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub messages: u64,
    pub events: u64,
    pub summaries: u64,
    pub errors: u64,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            summaries: self.summaries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

pub struct Pipeline {
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    authority: Arc<AuthorityTracker>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    pool: Mutex<EventPool>,
    batch: BatchCollector,
    dup_cache: Mutex<RecentSet>,
    /// Serializes digest sends and enforces the minimum summary spacing.
    summary_gate: Arc<tokio::sync::Mutex<Option<DateTime<Utc>>>>,
    stats: Arc<Stats>,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        llm: Arc<LlmClient>,
        authority: Arc<AuthorityTracker>,
        dispatcher: Arc<Dispatcher>,
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pool = EventPool::new(Arc::clone(&store), config.match_threshold);
        let batch = BatchCollector::new(config.batch_size, config.max_batch_age_secs);
        Self {
            store,
            llm,
            authority,
            dispatcher,
            clock,
            config,
            pool: Mutex::new(pool),
            batch,
            dup_cache: Mutex::new(RecentSet::new(DUP_CACHE_SIZE)),
            summary_gate: Arc::new(tokio::sync::Mutex::new(None)),
            stats: Arc::new(Stats::default()),
        }
    }

    /// Reload pending events from the store into the pool.
    pub fn restore(&self) -> Result<usize> {
        self.pool.lock().unwrap().restore()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Direct pool access. The pool is otherwise touched only from `process`
    /// and the aggregator; callers must not hold the guard across awaits.
    pub fn pool(&self) -> std::sync::MutexGuard<'_, EventPool> {
        self.pool.lock().unwrap()
    }

    /// Main entry point — every ingested message flows through here.
    pub async fn process(&self, post: ChannelPost) {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);
        debug!(
            channel = %post.channel,
            class = %post.class,
            len = post.text.len(),
            "pipeline: message"
        );

        // Media-only posts carry nothing for correlation; the smart mirror
        // has already handled them upstream.
        if post.text.is_empty() {
            return;
        }

        // 1) In-memory short-term dedup.
        let raw_key = content_hash(&post.text);
        if !self.dup_cache.lock().unwrap().insert(&raw_key) {
            debug!(channel = %post.channel, "in-memory dedup skip");
            return;
        }

        // 2) Durable dedup table.
        match self.store.check_dedup(&raw_key, self.clock.now()) {
            Ok(true) => {
                debug!(channel = %post.channel, "store dedup skip");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                // Message is dropped; at-least-once tolerates this.
                self.note_error("dedup check failed", &e.into());
                return;
            }
        }

        // 3) Authority gate.
        let score = self.authority.score(&post.channel);
        let urgent = looks_urgent(&post.text);

        // 4) Urgent or trusted messages earn an extraction.
        if urgent || score >= self.config.high_authority_threshold {
            match self.llm.extract_signature(&post.text).await {
                Some(signature) => {
                    self.stats.events.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        channel = %post.channel,
                        event_type = %signature.event_type,
                        location = signature.location.as_deref().unwrap_or("?"),
                        "signature extracted"
                    );
                    let result = {
                        let mut pool = self.pool.lock().unwrap();
                        pool.ingest_with_signature(signature, &post, self.clock.now())
                    };
                    if let Err(e) = result {
                        self.note_error("signature ingest failed", &e);
                    }
                }
                None if urgent => self.enqueue_batch(post),
                None => {
                    debug!(channel = %post.channel, "dropped: no signature");
                }
            }
            return;
        }

        // 5) Cheap path: fingerprint lookup, else the batch collector.
        let hit = self.pool.lock().unwrap().fingerprint_match(&post.text);
        match hit {
            Some(event_id) => {
                let result = {
                    let mut pool = self.pool.lock().unwrap();
                    pool.ingest_by_fingerprint(&post, &event_id, self.clock.now())
                };
                match result {
                    Ok(()) => {
                        debug!(channel = %post.channel, event_id = %event_id.short(), "fingerprint merge")
                    }
                    Err(e) => self.note_error("fingerprint ingest failed", &e),
                }
            }
            None => self.enqueue_batch(post),
        }
    }

    /// Long-running consumer of the fan-in queue.
    pub async fn run_consumer(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ChannelPost>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("pipeline consumer started");
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(post) => self.process(post).await,
                    None => {
                        info!("ingest queue closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("pipeline consumer shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Aggregator loop: every `flush_every_secs`, evaluate mature events and
    /// flush a stale batch if one is waiting.
    pub async fn run_aggregator(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("aggregator loop started");
        loop {
            tokio::select! {
                _ = self.clock.sleep(Duration::from_secs(self.config.flush_every_secs)) => {
                    if let Some(stale) = self.batch.take_if_stale(self.clock.now()) {
                        self.spawn_digest(stale);
                    }
                    self.flush_mature().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("aggregator loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Maintenance loop: hourly decay, store cleanup, stats line.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("maintenance loop started");
        loop {
            tokio::select! {
                _ = self.clock.sleep(Duration::from_secs(3600)) => {
                    let now = self.clock.now();
                    if let Err(e) = self.authority.apply_decay(now) {
                        warn!("decay failed: {e}");
                    }
                    let cutoff = now - chrono::Duration::seconds(self.config.retention_secs as i64);
                    if let Err(e) = self.store.cleanup_old(cutoff) {
                        warn!("cleanup failed: {e}");
                    }
                    let s = self.stats.snapshot();
                    info!(
                        messages = s.messages,
                        events = s.events,
                        summaries = s.summaries,
                        errors = s.errors,
                        llm_calls = self.llm.calls_used(),
                        "hourly maintenance"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("maintenance loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One aggregator pass over the active pool.
    pub async fn flush_mature(&self) {
        let now = self.clock.now();
        let window = chrono::Duration::seconds(self.config.event_merge_window_secs as i64);
        let snapshot = self.pool.lock().unwrap().snapshot();

        for event in snapshot {
            if now - event.first_ts < window {
                continue;
            }
            if event.sent {
                self.pool.lock().unwrap().expire(&event.id);
                continue;
            }

            let outcome = if event.channels.len() >= self.config.min_sources {
                self.dispatch_trend(&event).await
            } else if event.channels.len() == 1 {
                self.finish_single_source(&event).await
            } else {
                // Partially corroborated below the bar: expire quietly.
                self.store.mark_event_expired(&event.id).map_err(Into::into)
            };
            if let Err(e) = outcome {
                self.note_error("aggregator dispatch failed", &e);
            }
            self.pool.lock().unwrap().expire(&event.id);
        }
    }

    async fn dispatch_trend(&self, event: &Event) -> Result<()> {
        let now = self.clock.now();
        // Earliest source row defines first-to-report.
        let sources = self.store.get_event_sources(&event.id)?;
        let first_channel = sources.first().map(|s| s.channel.clone());

        let channels: Vec<String> = event.channels.iter().cloned().collect();
        let context = self.authority.context_block(&channels, AUTHORITY_CONTEXT_TOP);
        let body = match self
            .llm
            .summarize_trend(event.representative_text(), &context)
            .await
        {
            Some(body) => body,
            None => format!(
                "דיווחים חוזרים ({} ערוצים) על אירוע חריג.",
                event.channels.len()
            ),
        };

        info!(event_id = %event.id.short(), sources = event.channels.len(), "dispatching trend report");
        self.dispatcher.send_trend_report(event, &body).await;
        self.authority
            .on_event_corroborated(event, first_channel.as_deref(), now)?;
        self.store.mark_event_sent(&event.id, now)?;
        self.pool.lock().unwrap().mark_sent(&event.id);
        Ok(())
    }

    async fn finish_single_source(&self, event: &Event) -> Result<()> {
        let now = self.clock.now();
        let Some(channel) = event.channels.iter().next() else {
            return Ok(());
        };
        let score = self.authority.score(channel);

        if score >= SINGLE_ALERT_SCORE {
            let text = event
                .texts
                .first()
                .map(|t| clip(t, SINGLE_BODY_MAX))
                .unwrap_or("");
            let body = self
                .llm
                .summarize_trend(text, "")
                .await
                .unwrap_or_else(|| text.to_string());
            info!(channel = %channel, score, "dispatching single-source alert");
            self.dispatcher.send_single_source_alert(event, &body).await;
            self.store.mark_event_sent(&event.id, now)?;
            self.pool.lock().unwrap().mark_sent(&event.id);
        } else {
            self.authority.on_event_expired_uncorroborated(event, now)?;
            self.store.mark_event_expired(&event.id)?;
        }
        Ok(())
    }

    fn enqueue_batch(&self, post: ChannelPost) {
        debug!(channel = %post.channel, pending = self.batch.len() + 1, "batched");
        if let Some(batch) = self.batch.push(post, self.clock.now()) {
            self.spawn_digest(batch);
        }
    }

    /// Summarise and dispatch a drained batch in its own task.
    fn spawn_digest(&self, posts: Vec<ChannelPost>) {
        let job = DigestJob {
            llm: Arc::clone(&self.llm),
            authority: Arc::clone(&self.authority),
            dispatcher: Arc::clone(&self.dispatcher),
            clock: Arc::clone(&self.clock),
            summary_gate: Arc::clone(&self.summary_gate),
            stats: Arc::clone(&self.stats),
            min_interval: chrono::Duration::seconds(self.config.summary_min_interval_secs as i64),
        };
        tokio::spawn(async move { job.run(posts).await });
    }

    fn note_error(&self, context: &str, e: &crate::error::PipelineError) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        warn!("{context}: {e}");
    }
}

/// A single digest send: summarise, then deliver under the summary throttle.
struct DigestJob {
    llm: Arc<LlmClient>,
    authority: Arc<AuthorityTracker>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    summary_gate: Arc<tokio::sync::Mutex<Option<DateTime<Utc>>>>,
    stats: Arc<Stats>,
    min_interval: chrono::Duration,
}

impl DigestJob {
    async fn run(self, posts: Vec<ChannelPost>) {
        let mut channels: Vec<String> = posts.iter().map(|p| p.channel.clone()).collect();
        channels.sort();
        channels.dedup();
        let context = self.authority.context_block(&channels, AUTHORITY_CONTEXT_TOP);

        let texts: Vec<String> = posts.into_iter().map(|p| p.text).collect();
        let Some(summary) = self.llm.summarize_batch(&texts, &context).await else {
            debug!("batch digest skipped: no summary");
            return;
        };

        // The gate both serializes sends and enforces the minimum spacing.
        let mut gate = self.summary_gate.lock().await;
        if let Some(last) = *gate {
            let since = self.clock.now() - last;
            if since < self.min_interval {
                let wait = (self.min_interval - since)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                self.clock.sleep(wait).await;
            }
        }
        self.dispatcher.send_batch_digest(&summary).await;
        *gate = Some(self.clock.now());
        self.stats.summaries.fetch_add(1, Ordering::Relaxed);
    }
}
