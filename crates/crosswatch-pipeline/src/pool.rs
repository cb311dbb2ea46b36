//! Event correlation: semantic signature matching and the active event pool.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crosswatch_core::text::event_fingerprint;
use crosswatch_core::types::{ChannelPost, Event, EventId, EventSignature, EventType};
use crosswatch_store::Store;

use crate::error::Result;

/// Similarity score between two signatures, 0.0–1.0.
///
/// Location is the strongest signal (+0.5 exact, +0.2 region-only), event
/// type adds +0.3 unless it is the catch-all `other`, and entity overlap
/// contributes up to +0.2 (Jaccard).
pub fn signatures_match(a: &EventSignature, b: &EventSignature) -> f64 {
    let mut score = 0.0;

    match (&a.location, &b.location) {
        (Some(la), Some(lb)) if norm(la) == norm(lb) => score += 0.5,
        _ => {
            if let (Some(ra), Some(rb)) = (&a.region, &b.region) {
                if norm(ra) == norm(rb) {
                    score += 0.2;
                }
            }
        }
    }

    if a.event_type == b.event_type && a.event_type != EventType::Other {
        score += 0.3;
    }

    let ea: std::collections::HashSet<String> = a.entities.iter().map(|e| norm(e)).collect();
    let eb: std::collections::HashSet<String> = b.entities.iter().map(|e| norm(e)).collect();
    if !ea.is_empty() && !eb.is_empty() {
        let intersection = ea.intersection(&eb).count() as f64;
        let union = ea.union(&eb).count() as f64;
        score += 0.2 * (intersection / union);
    }

    score.min(1.0)
}

fn norm(s: &str) -> String {
    s.trim().to_lowercase()
}

/// In-memory index of active (pending) events.
///
/// Owned by the pipeline; every mutation is persisted through the store so a
/// restart can rebuild the pool from `pending` rows.
pub struct EventPool {
    store: Arc<Store>,
    match_threshold: f64,
    active: HashMap<EventId, Event>,
    fingerprint_index: HashMap<String, EventId>,
}

impl EventPool {
    pub fn new(store: Arc<Store>, match_threshold: f64) -> Self {
        Self {
            store,
            match_threshold,
            active: HashMap::new(),
            fingerprint_index: HashMap::new(),
        }
    }

    /// Reload pending events (and their source rows) from the store.
    /// Returns how many events were restored.
    pub fn restore(&mut self) -> Result<usize> {
        let classes = self.store.get_channel_classes()?;
        for pending in self.store.get_pending_events()? {
            let sources = self.store.get_event_sources(&pending.event_id)?;
            let mut event = Event {
                id: pending.event_id.clone(),
                signature: pending.signature,
                texts: Vec::new(),
                channels: Default::default(),
                channel_classes: HashMap::new(),
                links: Vec::new(),
                first_ts: pending.first_seen,
                last_updated: pending.first_seen,
                sent: false,
            };
            for source in sources {
                if let Some(text) = source.raw_text.filter(|t| !t.is_empty()) {
                    event.texts.push(text);
                }
                if let Some(link) = source.link {
                    event.links.push(link);
                }
                if let Some(class) = classes.get(&source.channel) {
                    event.channel_classes.insert(source.channel.clone(), *class);
                }
                if source.reported_at > event.last_updated {
                    event.last_updated = source.reported_at;
                }
                event.channels.insert(source.channel);
            }
            if let Some(first_text) = event.texts.first() {
                self.fingerprint_index
                    .insert(event_fingerprint(first_text), event.id.clone());
            }
            self.active.insert(event.id.clone(), event);
        }
        if !self.active.is_empty() {
            info!(count = self.active.len(), "restored pending events");
        }
        Ok(self.active.len())
    }

    /// Cheap pre-check: does this text's fingerprint match an active event?
    pub fn fingerprint_match(&self, text: &str) -> Option<EventId> {
        self.fingerprint_index.get(&event_fingerprint(text)).cloned()
    }

    /// Add a message to an existing event matched by fingerprint.
    ///
    /// A channel contributes at most once per event; repeats are no-ops.
    pub fn ingest_by_fingerprint(
        &mut self,
        post: &ChannelPost,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(event) = self.active.get_mut(event_id) else {
            debug!(event_id = %event_id.short(), "fingerprint hit on expired event");
            return Ok(());
        };
        merge_post(event, post, &self.store, now)?;
        Ok(())
    }

    /// Add a message with an extracted signature: merge into the best-scoring
    /// active event above the threshold, or open a new one.
    pub fn ingest_with_signature(
        &mut self,
        signature: EventSignature,
        post: &ChannelPost,
        now: DateTime<Utc>,
    ) -> Result<EventId> {
        let mut best: Option<(EventId, f64)> = None;
        for (id, event) in &self.active {
            let score = signatures_match(&signature, &event.signature);
            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((id.clone(), score));
            }
        }

        if let Some((id, score)) = best {
            if score >= self.match_threshold {
                if let Some(event) = self.active.get_mut(&id) {
                    if merge_post(event, post, &self.store, now)? {
                        info!(
                            event_id = %id.short(),
                            sources = event.channels.len(),
                            score = format!("{score:.2}"),
                            "corroboration"
                        );
                    }
                    return Ok(id);
                }
            }
        }

        // New event.
        let id = EventId::new();
        let mut event = Event {
            id: id.clone(),
            signature,
            texts: vec![post.text.clone()],
            channels: Default::default(),
            channel_classes: HashMap::new(),
            links: post.link.iter().cloned().collect(),
            first_ts: now,
            last_updated: now,
            sent: false,
        };
        event.channels.insert(post.channel.clone());
        event.channel_classes.insert(post.channel.clone(), post.class);

        self.store.record_event(
            &id,
            &event.signature,
            &post.channel,
            &post.text,
            post.link.as_deref(),
            now,
        )?;
        self.fingerprint_index
            .insert(event_fingerprint(&post.text), id.clone());
        self.active.insert(id.clone(), event);
        debug!(event_id = %id.short(), channel = %post.channel, "new event opened");
        Ok(id)
    }

    /// Drop an event from the pool and from the fingerprint index.
    pub fn expire(&mut self, event_id: &EventId) {
        self.active.remove(event_id);
        self.fingerprint_index.retain(|_, id| id != event_id);
    }

    pub fn mark_sent(&mut self, event_id: &EventId) {
        if let Some(event) = self.active.get_mut(event_id) {
            event.sent = true;
        }
    }

    pub fn get(&self, event_id: &EventId) -> Option<&Event> {
        self.active.get(event_id)
    }

    /// Clone of the current active set, for the aggregator's scan.
    pub fn snapshot(&self) -> Vec<Event> {
        self.active.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Merge a post into an event unless its channel already contributed.
/// Returns `true` when the channel was new.
fn merge_post(
    event: &mut Event,
    post: &ChannelPost,
    store: &Store,
    now: DateTime<Utc>,
) -> Result<bool> {
    if event.channels.contains(&post.channel) {
        return Ok(false);
    }
    store.add_event_source(
        &event.id,
        &post.channel,
        &post.text,
        post.link.as_deref(),
        now,
    )?;
    event.texts.push(post.text.clone());
    event.channels.insert(post.channel.clone());
    event.channel_classes.insert(post.channel.clone(), post.class);
    if let Some(link) = &post.link {
        event.links.push(link.clone());
    }
    event.last_updated = now;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosswatch_core::types::ChannelClass;

    fn sig(location: Option<&str>, region: Option<&str>, event_type: EventType) -> EventSignature {
        EventSignature {
            location: location.map(String::from),
            region: region.map(String::from),
            event_type,
            ..Default::default()
        }
    }

    fn post(channel: &str, text: &str) -> ChannelPost {
        ChannelPost {
            text: text.to_string(),
            channel: channel.to_string(),
            link: Some(format!("https://t.me/{channel}/1")),
            media_id: None,
            class: ChannelClass::Source,
            received_at: Utc::now(),
        }
    }

    fn pool() -> EventPool {
        EventPool::new(Arc::new(Store::open_in_memory().unwrap()), 0.6)
    }

    #[test]
    fn same_location_and_type_scores_high() {
        let a = sig(Some("Jenin"), Some("west bank"), EventType::Clash);
        let b = sig(Some("jenin"), Some("West Bank"), EventType::Clash);
        assert!(signatures_match(&a, &b) >= 0.8);
    }

    #[test]
    fn different_events_score_low() {
        let a = sig(Some("Gaza"), None, EventType::Strike);
        let b = sig(Some("Beirut"), None, EventType::Statement);
        assert!(signatures_match(&a, &b) < 0.3);
    }

    #[test]
    fn region_fallback_scores_partial() {
        let a = sig(Some("Rafah"), Some("gaza"), EventType::Strike);
        let b = sig(Some("Khan Younis"), Some("Gaza"), EventType::Strike);
        let score = signatures_match(&a, &b);
        assert!((score - 0.5).abs() < 1e-9, "got {score}");
    }

    #[test]
    fn entity_overlap_contributes() {
        let mut a = sig(None, None, EventType::Clash);
        a.entities = vec!["Hamas".into(), "IDF".into()];
        let mut b = sig(None, None, EventType::Clash);
        b.entities = vec!["hamas".into(), "Hezbollah".into()];
        let score = signatures_match(&a, &b);
        assert!(score > 0.3 && score < 0.5, "got {score}");
    }

    #[test]
    fn self_match_is_reflexively_strong() {
        let a = sig(Some("Gaza"), None, EventType::Strike);
        assert!(signatures_match(&a, &a) >= 0.5);
        let b = sig(None, Some("south lebanon"), EventType::Rocket);
        assert!(signatures_match(&b, &b) >= 0.5);
    }

    #[test]
    fn other_type_does_not_count_as_match() {
        let a = sig(None, None, EventType::Other);
        assert_eq!(signatures_match(&a, &a), 0.0);
    }

    #[test]
    fn new_event_then_merge_by_signature() {
        let mut pool = pool();
        let now = Utc::now();
        let id = pool
            .ingest_with_signature(
                sig(Some("Gaza"), None, EventType::Strike),
                &post("alpha", "غارة على غزة"),
                now,
            )
            .unwrap();
        assert_eq!(pool.len(), 1);

        let merged = pool
            .ingest_with_signature(
                sig(Some("gaza"), None, EventType::Strike),
                &post("beta", "تقارير عن غارة"),
                now,
            )
            .unwrap();
        assert_eq!(merged, id);
        assert_eq!(pool.len(), 1);
        let event = pool.get(&id).unwrap();
        assert_eq!(event.channels.len(), 2);
        assert_eq!(event.links.len(), 2);
    }

    #[test]
    fn below_threshold_opens_second_event() {
        let mut pool = pool();
        let now = Utc::now();
        pool.ingest_with_signature(
            sig(Some("Gaza"), None, EventType::Strike),
            &post("alpha", "غارة"),
            now,
        )
        .unwrap();
        pool.ingest_with_signature(
            sig(Some("Beirut"), None, EventType::Statement),
            &post("beta", "تصريح"),
            now,
        )
        .unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn same_channel_merges_only_once() {
        let mut pool = pool();
        let now = Utc::now();
        let id = pool
            .ingest_with_signature(
                sig(Some("Gaza"), None, EventType::Strike),
                &post("alpha", "غارة على غزة"),
                now,
            )
            .unwrap();
        pool.ingest_by_fingerprint(&post("alpha", "غارة على غزة 2"), &id, now)
            .unwrap();
        assert_eq!(pool.get(&id).unwrap().channels.len(), 1);
        assert_eq!(pool.get(&id).unwrap().texts.len(), 1);
    }

    #[test]
    fn fingerprint_match_collides_for_digit_variants() {
        let mut pool = pool();
        let now = Utc::now();
        let id = pool
            .ingest_with_signature(
                sig(Some("Gaza"), None, EventType::Casualty),
                &post("alpha", "مقتل 5 في القصف"),
                now,
            )
            .unwrap();
        let hit = pool.fingerprint_match("مقتل 12 في القصف").unwrap();
        assert_eq!(hit, id);

        pool.ingest_by_fingerprint(&post("beta", "مقتل 12 في القصف"), &hit, now)
            .unwrap();
        let event = pool.get(&id).unwrap();
        assert_eq!(event.channels.len(), 2);
        assert!(event.channels.contains("beta"));
    }

    #[test]
    fn expire_clears_fingerprint_index() {
        let mut pool = pool();
        let now = Utc::now();
        let text = "انفجار كبير في المنطقة";
        let id = pool
            .ingest_with_signature(
                sig(Some("Beirut"), None, EventType::Other),
                &post("alpha", text),
                now,
            )
            .unwrap();
        assert!(pool.fingerprint_match(text).is_some());
        pool.expire(&id);
        assert!(pool.fingerprint_match(text).is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn restore_rebuilds_pending_events() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = Utc::now();
        store
            .ensure_channel("alpha", ChannelClass::Source, 50.0, now)
            .unwrap();
        store
            .ensure_channel("beta", ChannelClass::Smart, 60.0, now)
            .unwrap();

        let mut pool = EventPool::new(Arc::clone(&store), 0.6);
        let id = pool
            .ingest_with_signature(
                sig(Some("Gaza"), None, EventType::Strike),
                &post("alpha", "غارة على غزة"),
                now,
            )
            .unwrap();
        pool.ingest_by_fingerprint(&post("beta", "غارة على غزة!"), &id, now)
            .unwrap();

        let mut restored = EventPool::new(store, 0.6);
        assert_eq!(restored.restore().unwrap(), 1);
        let event = restored.get(&id).unwrap();
        assert_eq!(event.channels.len(), 2);
        assert_eq!(event.channel_classes["beta"], ChannelClass::Smart);
        assert_eq!(event.first_ts.timestamp(), now.timestamp());
        assert!(restored.fingerprint_match("غارة على غزة").is_some());
    }
}
