//! SQLite persistence for sessions, messages and the animation cache.

mod cache;
mod messages;
pub mod schema;
mod sessions;

pub use cache::{AnimationCacheEntry, CacheCandidate};
pub use messages::{AiResponse, AnimationSettings, AnimationUrl, ChatMessage, Exchange, NewMessage};
pub use sessions::{ChatSession, FIRST_MESSAGE_MAX_CHARS, derive_title, truncate_chars};

use anyhow::{Result, anyhow};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use crate::status::AnimationStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Cannot move animation from {from} to {to}")]
    InvalidTransition {
        from: AnimationStatus,
        to: AnimationStatus,
    },
}

/// Shared handle; clones refer to the same connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Default)]
pub struct StoreStats {
    pub schema_version: u32,
    pub sessions: usize,
    pub messages: usize,
    pub by_status: Vec<(String, usize)>,
    pub cache_entries: usize,
    pub code_rows: usize,
}

impl Store {
    /// Open (creating if needed) and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!("Opening store at {}", path.display());
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        schema::apply_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Lock poisoned: {}", e))
    }

    /// Apply pending migrations. Returns the versions applied (empty when current).
    pub fn migrate(&self) -> Result<Vec<u32>> {
        let mut conn = self.lock()?;
        schema::apply_migrations(&mut conn)
    }

    pub fn schema_version(&self) -> Result<u32> {
        let conn = self.lock()?;
        schema::current_version(&conn)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        let mut stmt = conn.prepare(
            "SELECT animation_status, COUNT(*) FROM chat_messages
             GROUP BY animation_status ORDER BY animation_status",
        )?;
        let by_status = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(StoreStats {
            schema_version: schema::current_version(&conn)?,
            sessions: count("SELECT COUNT(*) FROM chat_sessions")?,
            messages: count("SELECT COUNT(*) FROM chat_messages")?,
            by_status,
            cache_entries: count("SELECT COUNT(*) FROM animation_cache")?,
            code_rows: count("SELECT COUNT(*) FROM animation_code")?,
        })
    }
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
