//! Versioned schema, tracked with `PRAGMA user_version`.

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::info;

/// Ordered migrations. Never edit an entry once released; append a new one.
pub const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE chat_sessions (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            first_message TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE chat_messages (
            id TEXT PRIMARY KEY,
            session_id TEXT REFERENCES chat_sessions(id) ON DELETE CASCADE,
            user_query TEXT NOT NULL,
            ai_response TEXT NOT NULL,
            animation_status TEXT NOT NULL DEFAULT 'disabled'
                CHECK (animation_status IN
                    ('disabled', 'skipped', 'pending', 'processing',
                     'completed', 'error', 'failed')),
            animation_urls TEXT NOT NULL DEFAULT '[]',
            animation_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX idx_messages_session_query ON chat_messages(session_id, user_query);
        CREATE INDEX idx_messages_session_created ON chat_messages(session_id, created_at);
        "#,
    ),
    (
        2,
        r#"
        ALTER TABLE chat_sessions ADD COLUMN user_id TEXT;
        CREATE INDEX idx_sessions_user ON chat_sessions(user_id);
        "#,
    ),
    (
        3,
        r#"
        CREATE TABLE animation_cache (
            query_hash TEXT PRIMARY KEY,
            query_embedding TEXT NOT NULL DEFAULT '[]',
            animation_urls TEXT NOT NULL DEFAULT '[]',
            manim_code TEXT NOT NULL DEFAULT '',
            original_query TEXT NOT NULL CHECK (length(original_query) > 0),
            key_terms TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE animation_code (
            message_id TEXT NOT NULL REFERENCES chat_messages(id) ON DELETE CASCADE,
            step INTEGER NOT NULL,
            code TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (message_id, step)
        );
        "#,
    ),
];

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}

pub fn current_version(conn: &Connection) -> Result<u32> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version as u32)
}

/// Apply every migration newer than the database. Returns the versions applied.
pub fn apply_migrations(conn: &mut Connection) -> Result<Vec<u32>> {
    let current = current_version(conn)?;
    let mut applied = Vec::new();

    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .with_context(|| format!("Migration {} failed", version))?;
        tx.pragma_update(None, "user_version", *version as i64)?;
        tx.commit()?;

        info!("Applied schema migration {}", version);
        applied.push(*version);
    }

    Ok(applied)
}
