//! Size-and-age-bounded collector for non-urgent, unmatched messages.
//!
//! Messages that neither merged into an event nor warranted extraction are
//! held here until the batch fills or its oldest entry gets stale, then the
//! whole batch is summarised in one digest.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crosswatch_core::types::ChannelPost;

pub struct BatchCollector {
    batch_size: usize,
    max_age: Duration,
    inner: Mutex<State>,
}

struct State {
    posts: Vec<ChannelPost>,
    oldest: Option<DateTime<Utc>>,
}

impl BatchCollector {
    pub fn new(batch_size: usize, max_age_secs: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_age: Duration::seconds(max_age_secs as i64),
            inner: Mutex::new(State {
                posts: Vec::new(),
                oldest: None,
            }),
        }
    }

    /// Add a post; returns the full batch when the size bound is reached.
    pub fn push(&self, post: ChannelPost, now: DateTime<Utc>) -> Option<Vec<ChannelPost>> {
        let mut state = self.inner.lock().unwrap();
        state.oldest.get_or_insert(now);
        state.posts.push(post);
        if state.posts.len() >= self.batch_size {
            state.oldest = None;
            return Some(std::mem::take(&mut state.posts));
        }
        None
    }

    /// Drain the batch if its oldest entry exceeds the age bound.
    pub fn take_if_stale(&self, now: DateTime<Utc>) -> Option<Vec<ChannelPost>> {
        let mut state = self.inner.lock().unwrap();
        let oldest = state.oldest?;
        if now - oldest < self.max_age || state.posts.is_empty() {
            return None;
        }
        state.oldest = None;
        Some(std::mem::take(&mut state.posts))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosswatch_core::types::ChannelClass;

    fn post(channel: &str) -> ChannelPost {
        ChannelPost {
            text: "text".into(),
            channel: channel.into(),
            link: None,
            media_id: None,
            class: ChannelClass::Source,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn flushes_at_size_bound() {
        let collector = BatchCollector::new(3, 600);
        let now = Utc::now();
        assert!(collector.push(post("a"), now).is_none());
        assert!(collector.push(post("b"), now).is_none());
        let batch = collector.push(post("c"), now).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(collector.is_empty());
    }

    #[test]
    fn flushes_when_oldest_exceeds_age() {
        let collector = BatchCollector::new(10, 60);
        let t0 = Utc::now();
        collector.push(post("a"), t0);
        assert!(collector.take_if_stale(t0 + Duration::seconds(30)).is_none());
        let batch = collector
            .take_if_stale(t0 + Duration::seconds(61))
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(collector.is_empty());
    }

    #[test]
    fn age_window_restarts_after_flush() {
        let collector = BatchCollector::new(10, 60);
        let t0 = Utc::now();
        collector.push(post("a"), t0);
        collector.take_if_stale(t0 + Duration::seconds(90)).unwrap();

        // A new push starts a fresh window anchored at its own arrival time.
        collector.push(post("b"), t0 + Duration::seconds(100));
        assert!(collector
            .take_if_stale(t0 + Duration::seconds(120))
            .is_none());
        assert!(collector
            .take_if_stale(t0 + Duration::seconds(161))
            .is_some());
    }
}
