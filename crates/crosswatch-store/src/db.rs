use rusqlite::{Connection, Result};

/// Initialise all tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_channels_table(conn)?;
    create_events_tables(conn)?;
    create_dedup_table(conn)?;
    Ok(())
}

fn create_channels_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS channels (
            username              TEXT PRIMARY KEY,
            channel_class         TEXT NOT NULL DEFAULT 'source',
            authority_score       REAL NOT NULL DEFAULT 50.0,
            total_reports         INTEGER NOT NULL DEFAULT 0,
            corroborated          INTEGER NOT NULL DEFAULT 0,
            first_to_report       INTEGER NOT NULL DEFAULT 0,
            uncorroborated_urgent INTEGER NOT NULL DEFAULT 0,
            last_updated          TEXT NOT NULL
        );",
    )
}

fn create_events_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            event_id       TEXT PRIMARY KEY,
            signature_json TEXT NOT NULL,
            first_seen     TEXT NOT NULL,
            last_updated   TEXT NOT NULL,
            source_count   INTEGER NOT NULL DEFAULT 1,
            status         TEXT NOT NULL DEFAULT 'pending',
            sent_at        TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);

        CREATE TABLE IF NOT EXISTS event_sources (
            event_id     TEXT NOT NULL REFERENCES events(event_id),
            channel      TEXT NOT NULL,
            reported_at  TEXT NOT NULL,
            raw_text     TEXT,
            message_link TEXT,
            PRIMARY KEY (event_id, channel)
        );",
    )
}

fn create_dedup_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS dedup_cache (
            hash_key   TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        );",
    )
}
