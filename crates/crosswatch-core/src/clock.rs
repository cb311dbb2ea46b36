//! Logical time source shared by every loop.
//!
//! Production code uses [`SystemClock`]; tests drive [`ManualClock`] so the
//! merge-window and decay logic can be exercised without real sleeps.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Cancellation-aware sleep: callers wrap this in `tokio::select!` against
    /// the shutdown channel, so implementations only need to suspend.
    async fn sleep(&self, dur: Duration);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

/// Test clock: `sleep` advances the clock by the requested duration and
/// returns immediately.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, dur: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(dur).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, dur: Duration) {
        self.advance(dur);
        tokio::task::yield_now().await;
    }
}
