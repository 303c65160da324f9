//! SQLite schema and migrations.
//!
//! All statements are idempotent (`CREATE TABLE IF NOT EXISTS`, `INSERT OR
//! IGNORE`) so `migrate` can run on every open.  Column additions are applied
//! with `ALTER TABLE ADD COLUMN` and the already-exists error swallowed.

use rusqlite::Connection;

use crate::error::StoreResult;

pub fn migrate(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(SCHEMA)?;

    // Idempotent column additions for future migrations go below.  Pattern:
    // try ADD COLUMN, swallow the error when the column already exists.

    Ok(())
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS listings (
        id INTEGER PRIMARY KEY,
        external_id TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        company TEXT NOT NULL,
        body TEXT NOT NULL,
        first_seen TEXT NOT NULL,
        search_keyword TEXT NOT NULL DEFAULT '',
        role_type TEXT NOT NULL DEFAULT 'unknown',
        seniority TEXT NOT NULL DEFAULT 'unknown',
        tech_tags TEXT NOT NULL DEFAULT '[]',
        content_hash TEXT NOT NULL,
        scores TEXT,
        primary_archetype TEXT,
        intelligence_only INTEGER NOT NULL DEFAULT 0,
        classify_attempts INTEGER NOT NULL DEFAULT 0,
        next_classify_at TEXT,
        embedding BLOB,
        embedding_dim INTEGER,
        embedding_model TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_listings_first_seen ON listings(first_seen);
    CREATE INDEX IF NOT EXISTS idx_listings_archetype ON listings(primary_archetype);
    CREATE INDEX IF NOT EXISTS idx_listings_content_hash ON listings(content_hash);

    CREATE TABLE IF NOT EXISTS batches (
        id TEXT PRIMARY KEY,
        archetype TEXT NOT NULL,
        profile_state TEXT NOT NULL,
        opened_at TEXT NOT NULL,
        closed_at TEXT,
        app_count INTEGER NOT NULL DEFAULT 0
    );

    -- Single-row lock: the open-batch invariant is enforced here with a
    -- conditional write, not an in-process mutex, because two hosts may share
    -- this store.
    CREATE TABLE IF NOT EXISTS batch_lock (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        open_batch_id TEXT
    );
    INSERT OR IGNORE INTO batch_lock (id, open_batch_id) VALUES (1, NULL);

    CREATE TABLE IF NOT EXISTS applications (
        id TEXT PRIMARY KEY,
        listing_id INTEGER NOT NULL REFERENCES listings(id),
        variant TEXT NOT NULL,
        version_id TEXT NOT NULL,
        profile_state TEXT NOT NULL,
        batch_id TEXT NOT NULL REFERENCES batches(id),
        submitted_at TEXT NOT NULL,
        outcome TEXT NOT NULL DEFAULT 'submitted',
        outcome_at TEXT,
        outcome_message_id TEXT,
        submit_error TEXT,
        selection_rationale TEXT NOT NULL DEFAULT '',
        UNIQUE (listing_id, batch_id)
    );
    CREATE INDEX IF NOT EXISTS idx_applications_outcome ON applications(outcome);
    CREATE INDEX IF NOT EXISTS idx_applications_listing ON applications(listing_id);

    CREATE TABLE IF NOT EXISTS messages (
        external_id TEXT PRIMARY KEY,
        received_at TEXT NOT NULL,
        sender TEXT NOT NULL,
        sender_domain TEXT NOT NULL,
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        source_class TEXT NOT NULL DEFAULT 'unknown',
        outcome TEXT,
        outcome_confidence REAL NOT NULL DEFAULT 0,
        application_id TEXT,
        match_method TEXT NOT NULL DEFAULT 'unmatched',
        needs_review INTEGER NOT NULL DEFAULT 0,
        review_candidates TEXT NOT NULL DEFAULT '[]'
    );
    CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at);
    CREATE INDEX IF NOT EXISTS idx_messages_review ON messages(needs_review);

    CREATE TABLE IF NOT EXISTS known_senders (
        address TEXT PRIMARY KEY,
        domain TEXT NOT NULL,
        company TEXT NOT NULL,
        sender_class TEXT NOT NULL DEFAULT 'unknown',
        first_seen TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_known_senders_domain ON known_senders(domain);

    CREATE TABLE IF NOT EXISTS call_logs (
        id INTEGER PRIMARY KEY,
        phone TEXT,
        company TEXT NOT NULL,
        title TEXT NOT NULL,
        outcome TEXT NOT NULL,
        notes TEXT NOT NULL DEFAULT '',
        called_at TEXT NOT NULL,
        application_id TEXT
    );

    CREATE TABLE IF NOT EXISTS resume_variants (
        archetype TEXT PRIMARY KEY,
        path TEXT NOT NULL,
        version_id TEXT NOT NULL,
        alignment REAL,
        last_rewrite TEXT,
        embedding BLOB,
        embedding_dim INTEGER,
        embedding_model TEXT
    );

    CREATE TABLE IF NOT EXISTS centroids (
        id INTEGER PRIMARY KEY,
        archetype TEXT NOT NULL,
        window_start TEXT NOT NULL,
        window_end TEXT NOT NULL,
        jd_count INTEGER NOT NULL,
        shift REAL,
        gained_terms TEXT NOT NULL DEFAULT '[]',
        lost_terms TEXT NOT NULL DEFAULT '[]',
        centroid BLOB NOT NULL,
        embedding_dim INTEGER NOT NULL,
        embedding_model TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (archetype, window_start)
    );

    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY,
        archetype TEXT NOT NULL,
        kind TEXT NOT NULL,
        value REAL NOT NULL,
        threshold REAL NOT NULL,
        details TEXT NOT NULL DEFAULT '{}',
        acknowledged INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_alerts_unack ON alerts(archetype, kind, acknowledged);

    CREATE TABLE IF NOT EXISTS watermarks (
        source TEXT PRIMARY KEY,
        last_external_id TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
";
