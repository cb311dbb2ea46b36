use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crosswatch_core::text::clip;
use crosswatch_core::types::{ChannelClass, EventId, EventSignature};

use crate::db::init_db;
use crate::error::Result;
use crate::types::{EventSourceRow, PendingEvent, ScoreDeltas};

/// Raw source text is clipped before persisting.
const RAW_TEXT_MAX: usize = 2000;

/// Durable store for channel authority, events, source rows, and the dedup
/// cache.
///
/// All writes go through a single WAL-mode connection behind a mutex, which
/// is the single-writer discipline the rest of the system assumes.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and initialise the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_db(&conn)?;
        info!(path = %path.display(), "database ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // --- channel authority --------------------------------------------------

    /// Create the channel row if it does not exist yet.
    pub fn ensure_channel(
        &self,
        username: &str,
        class: ChannelClass,
        default_score: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO channels (username, channel_class, authority_score, last_updated)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![username, class.to_string(), default_score, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_authority(&self, channel: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        let score = conn
            .query_row(
                "SELECT authority_score FROM channels WHERE username = ?1",
                [channel],
                |row| row.get(0),
            )
            .ok();
        Ok(score)
    }

    pub fn get_all_authorities(&self) -> Result<HashMap<String, f64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT username, authority_score FROM channels")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn get_channel_classes(&self) -> Result<HashMap<String, ChannelClass>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT username, channel_class FROM channels")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|(name, class)| class.parse().ok().map(|c| (name, c)))
            .collect())
    }

    /// Write a new score atomically with its per-reason counter increments.
    /// Every call also counts one report for the channel.
    pub fn update_authority(
        &self,
        channel: &str,
        new_score: f64,
        deltas: ScoreDeltas,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE channels SET authority_score = ?1,
                 total_reports = total_reports + 1,
                 corroborated = corroborated + ?2,
                 first_to_report = first_to_report + ?3,
                 uncorroborated_urgent = uncorroborated_urgent + ?4,
                 last_updated = ?5
             WHERE username = ?6",
            rusqlite::params![
                new_score,
                deltas.corroborated,
                deltas.first_to_report,
                deltas.uncorroborated_urgent,
                now.to_rfc3339(),
                channel,
            ],
        )?;
        Ok(())
    }

    /// Score-only bulk write, used by the hourly decay pass.
    pub fn bulk_update_scores(
        &self,
        scores: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now_str = now.to_rfc3339();
        for (channel, score) in scores {
            conn.execute(
                "UPDATE channels SET authority_score = ?1, last_updated = ?2 WHERE username = ?3",
                rusqlite::params![score, now_str, channel],
            )?;
        }
        Ok(())
    }

    // --- events -------------------------------------------------------------

    /// Persist a new event together with its initial source row.
    pub fn record_event(
        &self,
        event_id: &EventId,
        signature: &EventSignature,
        channel: &str,
        text: &str,
        link: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now_str = now.to_rfc3339();
        let sig_json = serde_json::to_string(signature)?;
        conn.execute(
            "INSERT INTO events (event_id, signature_json, first_seen, last_updated)
             VALUES (?1, ?2, ?3, ?3)",
            rusqlite::params![event_id.as_str(), sig_json, now_str],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO event_sources (event_id, channel, reported_at, raw_text, message_link)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                event_id.as_str(),
                channel,
                now_str,
                clip(text, RAW_TEXT_MAX),
                link,
            ],
        )?;
        Ok(())
    }

    /// Add a corroborating source row.
    ///
    /// Returns `true` when a row was actually inserted. `source_count` is only
    /// bumped in that case, keeping it equal to the number of source rows.
    pub fn add_event_source(
        &self,
        event_id: &EventId,
        channel: &str,
        text: &str,
        link: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now_str = now.to_rfc3339();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO event_sources (event_id, channel, reported_at, raw_text, message_link)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                event_id.as_str(),
                channel,
                now_str,
                clip(text, RAW_TEXT_MAX),
                link,
            ],
        )?;
        if inserted == 0 {
            debug!(event_id = %event_id.short(), channel, "source row already present");
            return Ok(false);
        }
        conn.execute(
            "UPDATE events SET source_count = source_count + 1, last_updated = ?1
             WHERE event_id = ?2",
            rusqlite::params![now_str, event_id.as_str()],
        )?;
        Ok(true)
    }

    pub fn mark_event_sent(&self, event_id: &EventId, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE events SET status = 'sent', sent_at = ?1 WHERE event_id = ?2",
            rusqlite::params![now.to_rfc3339(), event_id.as_str()],
        )?;
        Ok(())
    }

    pub fn mark_event_expired(&self, event_id: &EventId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE events SET status = 'expired' WHERE event_id = ?1",
            [event_id.as_str()],
        )?;
        Ok(())
    }

    /// Every event still `pending`, for pool restore on startup.
    pub fn get_pending_events(&self) -> Result<Vec<PendingEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_id, signature_json, first_seen, source_count
             FROM events WHERE status = 'pending'",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let events = rows
            .filter_map(|r| r.ok())
            .filter_map(|(id, sig_json, first_seen, source_count)| {
                let signature: EventSignature = match serde_json::from_str(&sig_json) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(event_id = %id, "bad signature JSON in pending event: {e}");
                        return None;
                    }
                };
                let first_seen = parse_ts(&first_seen)?;
                Some(PendingEvent {
                    event_id: EventId::from(id),
                    signature,
                    first_seen,
                    source_count,
                })
            })
            .collect();
        Ok(events)
    }

    pub fn get_event_sources(&self, event_id: &EventId) -> Result<Vec<EventSourceRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT channel, reported_at, raw_text, message_link
             FROM event_sources WHERE event_id = ?1 ORDER BY reported_at",
        )?;
        let rows = stmt.query_map([event_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|(channel, reported_at, raw_text, link)| {
                Some(EventSourceRow {
                    channel,
                    reported_at: parse_ts(&reported_at)?,
                    raw_text,
                    link,
                })
            })
            .collect())
    }

    // --- dedup cache --------------------------------------------------------

    /// Lookup-then-insert: returns `true` if the key was already present,
    /// otherwise records it and returns `false`.
    pub fn check_dedup(&self, hash_key: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists = conn
            .query_row(
                "SELECT 1 FROM dedup_cache WHERE hash_key = ?1",
                [hash_key],
                |_| Ok(()),
            )
            .is_ok();
        if exists {
            return Ok(true);
        }
        conn.execute(
            "INSERT OR IGNORE INTO dedup_cache (hash_key, created_at) VALUES (?1, ?2)",
            rusqlite::params![hash_key, now.to_rfc3339()],
        )?;
        Ok(false)
    }

    // --- maintenance --------------------------------------------------------

    /// Delete dedup entries and terminal events older than `cutoff`, then
    /// checkpoint the WAL so it cannot grow without bound.
    pub fn cleanup_old(&self, cutoff: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let cutoff_str = cutoff.to_rfc3339();
        conn.execute(
            "DELETE FROM dedup_cache WHERE created_at < ?1",
            [&cutoff_str],
        )?;
        conn.execute(
            "DELETE FROM event_sources WHERE event_id IN
             (SELECT event_id FROM events WHERE last_updated < ?1 AND status != 'pending')",
            [&cutoff_str],
        )?;
        conn.execute(
            "DELETE FROM events WHERE last_updated < ?1 AND status != 'pending'",
            [&cutoff_str],
        )?;
        if let Err(e) = wal_checkpoint(&conn) {
            debug!("wal checkpoint skipped: {e}");
        }
        debug!(cutoff = %cutoff_str, "cleaned up old records");
        Ok(())
    }

    /// Final checkpoint before the process exits.
    pub fn close(&self) {
        let conn = self.conn.lock().unwrap();
        if let Err(e) = wal_checkpoint(&conn) {
            debug!("final wal checkpoint skipped: {e}");
        }
        info!("database closed");
    }
}

/// `wal_checkpoint` returns a result row, so it must go through `query_row`.
fn wal_checkpoint(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crosswatch_core::types::EventType;

    fn sig(event_type: EventType, location: &str) -> EventSignature {
        EventSignature {
            location: Some(location.to_string()),
            event_type,
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_source_row_is_ignored_and_count_stays_consistent() {
        let store = Store::open_in_memory().unwrap();
        let id = EventId::new();
        let now = Utc::now();
        store
            .record_event(&id, &sig(EventType::Strike, "Gaza"), "alpha", "t1", None, now)
            .unwrap();

        assert!(store
            .add_event_source(&id, "beta", "t2", Some("https://t.me/beta/1"), now)
            .unwrap());
        // Same channel again: no new row, no count bump.
        assert!(!store.add_event_source(&id, "beta", "t3", None, now).unwrap());

        let sources = store.get_event_sources(&id).unwrap();
        assert_eq!(sources.len(), 2);
        let pending = store.get_pending_events().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source_count, 2);
    }

    #[test]
    fn sources_ordered_by_reported_at() {
        let store = Store::open_in_memory().unwrap();
        let id = EventId::new();
        let t0 = Utc::now();
        store
            .record_event(&id, &sig(EventType::Rocket, "Haifa"), "first", "t", None, t0)
            .unwrap();
        store
            .add_event_source(&id, "second", "t", None, t0 + Duration::seconds(30))
            .unwrap();
        let sources = store.get_event_sources(&id).unwrap();
        assert_eq!(sources[0].channel, "first");
        assert_eq!(sources[1].channel, "second");
    }

    #[test]
    fn pending_events_exclude_terminal_states() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let sent = EventId::new();
        let expired = EventId::new();
        let pending = EventId::new();
        for id in [&sent, &expired, &pending] {
            store
                .record_event(id, &sig(EventType::Clash, "Jenin"), "ch", "t", None, now)
                .unwrap();
        }
        store.mark_event_sent(&sent, now).unwrap();
        store.mark_event_expired(&expired).unwrap();

        let restored = store.get_pending_events().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].event_id, pending);
        assert_eq!(restored[0].signature.location.as_deref(), Some("Jenin"));
    }

    #[test]
    fn dedup_check_inserts_on_miss() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        assert!(!store.check_dedup("abc", now).unwrap());
        assert!(store.check_dedup("abc", now).unwrap());
    }

    #[test]
    fn cleanup_removes_old_terminal_events_and_dedup_keys() {
        let store = Store::open_in_memory().unwrap();
        let old = Utc::now() - Duration::days(2);
        let now = Utc::now();

        let stale = EventId::new();
        store
            .record_event(&stale, &sig(EventType::Other, "x"), "ch", "t", None, old)
            .unwrap();
        store.mark_event_expired(&stale).unwrap();
        // mark_event_expired does not touch last_updated, so the row still
        // carries the old timestamp and is eligible for cleanup.
        store.check_dedup("old-key", old).unwrap();

        let fresh = EventId::new();
        store
            .record_event(&fresh, &sig(EventType::Other, "y"), "ch", "t", None, now)
            .unwrap();

        store.cleanup_old(now - Duration::days(1)).unwrap();

        assert!(store.get_event_sources(&stale).unwrap().is_empty());
        assert!(!store.check_dedup("old-key", now).unwrap());
        assert_eq!(store.get_pending_events().unwrap().len(), 1);
    }

    #[test]
    fn authority_update_bumps_counters() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .ensure_channel("alpha", ChannelClass::Source, 50.0, now)
            .unwrap();
        store
            .update_authority(
                "alpha",
                52.0,
                ScoreDeltas {
                    corroborated: 1,
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        assert_eq!(store.get_authority("alpha").unwrap(), Some(52.0));

        // ensure_channel is idempotent and never resets the score.
        store
            .ensure_channel("alpha", ChannelClass::Source, 50.0, now)
            .unwrap();
        assert_eq!(store.get_authority("alpha").unwrap(), Some(52.0));
    }

    #[test]
    fn channel_classes_are_readable() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .ensure_channel("a", ChannelClass::Source, 50.0, now)
            .unwrap();
        store
            .ensure_channel("b", ChannelClass::Smart, 60.0, now)
            .unwrap();
        let classes = store.get_channel_classes().unwrap();
        assert_eq!(classes["a"], ChannelClass::Source);
        assert_eq!(classes["b"], ChannelClass::Smart);
    }
}
