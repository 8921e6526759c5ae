use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Store, StoreError, now};

pub const FIRST_MESSAGE_MAX_CHARS: usize = 100;
const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub first_message: String,
    pub user_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Char-boundary safe prefix.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// The query itself when short, else its first 47 chars and an ellipsis.
pub fn derive_title(query: &str) -> String {
    let query = query.trim();
    if query.chars().count() <= TITLE_MAX_CHARS {
        query.to_string()
    } else {
        format!("{}...", truncate_chars(query, TITLE_MAX_CHARS - 3))
    }
}

fn new_session(id: &str, first_message: &str, user_id: Option<&str>) -> ChatSession {
    let ts = now();
    ChatSession {
        id: id.to_string(),
        title: derive_title(first_message),
        first_message: truncate_chars(first_message, FIRST_MESSAGE_MAX_CHARS),
        user_id: user_id.map(str::to_string),
        created_at: ts.clone(),
        updated_at: ts,
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ChatSession> {
    Ok(ChatSession {
        id: row.get(0)?,
        title: row.get(1)?,
        first_message: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const SESSION_COLUMNS: &str = "id, title, first_message, user_id, created_at, updated_at";

impl Store {
    pub fn create_session(
        &self,
        first_message: &str,
        user_id: Option<&str>,
    ) -> Result<ChatSession> {
        self.insert_session(&Uuid::new_v4().to_string(), first_message, user_id)
    }

    fn insert_session(
        &self,
        id: &str,
        first_message: &str,
        user_id: Option<&str>,
    ) -> Result<ChatSession> {
        let session = new_session(id, first_message, user_id);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO chat_sessions (id, title, first_message, user_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.title,
                session.first_message,
                session.user_id,
                session.created_at,
                session.updated_at
            ],
        )?;

        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        let conn = self.lock()?;
        let session = conn
            .query_row(
                &format!("SELECT {} FROM chat_sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    /// Return the session, creating it under the given id when unknown.
    /// Insert-or-ignore and read happen under one lock guard.
    pub fn ensure_session(
        &self,
        id: &str,
        first_message: &str,
        user_id: Option<&str>,
    ) -> Result<ChatSession> {
        let candidate = new_session(id, first_message, user_id);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO chat_sessions (id, title, first_message, user_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO NOTHING",
            params![
                candidate.id,
                candidate.title,
                candidate.first_message,
                candidate.user_id,
                candidate.created_at,
                candidate.updated_at
            ],
        )?;

        let session = conn.query_row(
            &format!("SELECT {} FROM chat_sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id],
            session_from_row,
        )?;
        Ok(session)
    }

    /// Newest first, optionally restricted to one user.
    pub fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<ChatSession>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chat_sessions
             WHERE ?1 IS NULL OR user_id = ?1
             ORDER BY updated_at DESC, rowid DESC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map(params![user_id], session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// Deletes the session and, by cascade, its messages.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM chat_sessions WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::SessionNotFound(id.to_string()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::AnimationStatus;
    use crate::store::{AiResponse, NewMessage};

    #[test]
    fn concurrent_ensure_yields_one_session() {
        use std::sync::{Arc, Barrier};

        let store = Store::open_in_memory().unwrap();
        for round in 0..20 {
            let id = format!("s{}", round);
            let barrier = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let store = store.clone();
                    let barrier = barrier.clone();
                    let id = id.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        store.ensure_session(&id, &format!("q{}", i), None)
                    })
                })
                .collect();

            let sessions: Vec<ChatSession> = handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect();
            assert!(sessions.iter().all(|s| s == &sessions[0]));
        }
        assert_eq!(store.list_sessions(None).unwrap().len(), 20);
    }

    #[test]
    fn title_rules() {
        assert_eq!(derive_title("What is gravity?"), "What is gravity?");
        let long = "a".repeat(60);
        let title = derive_title(&long);
        assert_eq!(title.len(), 50);
        assert!(title.ends_with("..."));
        assert_eq!(derive_title(&"é".repeat(51)).chars().count(), 50);
    }

    #[test]
    fn create_and_ensure() {
        let store = Store::open_in_memory().unwrap();
        let long_query = "x".repeat(150);

        let session = store.ensure_session("s-1", &long_query, Some("user-7")).unwrap();
        assert_eq!(session.id, "s-1");
        assert_eq!(session.first_message.len(), FIRST_MESSAGE_MAX_CHARS);
        assert_eq!(session.user_id.as_deref(), Some("user-7"));

        let again = store.ensure_session("s-1", "different", None).unwrap();
        assert_eq!(again, session);
    }

    #[test]
    fn list_filters_by_user() {
        let store = Store::open_in_memory().unwrap();
        store.create_session("one", Some("alice")).unwrap();
        store.create_session("two", Some("bob")).unwrap();
        let newest = store.create_session("three", Some("alice")).unwrap();

        let alice = store.list_sessions(Some("alice")).unwrap();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].id, newest.id);
        assert_eq!(store.list_sessions(None).unwrap().len(), 3);
    }

    #[test]
    fn delete_cascades_to_messages() {
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session("q", None).unwrap();
        let msg = store
            .insert_message(NewMessage {
                session_id: Some(session.id.clone()),
                user_query: "q".to_string(),
                ai_response: AiResponse::new("a", vec![]),
                animation_status: AnimationStatus::Disabled,
            })
            .unwrap();

        store.delete_session(&session.id).unwrap();
        assert!(store.get_message(&msg.id).unwrap().is_none());

        let err = store.delete_session(&session.id).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::SessionNotFound(_))
        ));
    }
}
