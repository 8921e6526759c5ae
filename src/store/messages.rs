use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Store, StoreError, now};
use crate::chunker::ContentChunk;
use crate::status::AnimationStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationSettings {
    #[serde(rename = "type", default = "default_animation_type")]
    pub kind: String,
    #[serde(default = "default_animation_style")]
    pub style: String,
}

fn default_animation_type() -> String {
    "default".to_string()
}

fn default_animation_style() -> String {
    "standard".to_string()
}

impl Default for AnimationSettings {
    fn default() -> Self {
        Self {
            kind: default_animation_type(),
            style: default_animation_style(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub explanation: String,
    #[serde(default)]
    pub chunks: Vec<ContentChunk>,
    #[serde(default)]
    pub animation: AnimationSettings,
}

impl AiResponse {
    pub fn new(explanation: impl Into<String>, chunks: Vec<ContentChunk>) -> Self {
        Self {
            explanation: explanation.into(),
            chunks,
            animation: AnimationSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationUrl {
    pub step: u32,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: Option<String>,
    pub user_query: String,
    pub ai_response: AiResponse,
    pub animation_status: AnimationStatus,
    pub animation_urls: Vec<AnimationUrl>,
    pub animation_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ChatMessage {
    /// First step's URL, the one a polling client shows.
    pub fn primary_url(&self) -> Option<&str> {
        self.animation_urls.first().map(|u| u.url.as_str())
    }
}

pub struct NewMessage {
    pub session_id: Option<String>,
    pub user_query: String,
    pub ai_response: AiResponse,
    pub animation_status: AnimationStatus,
}

/// One prior question/answer pair used as conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user_query: String,
    pub explanation: String,
}

const MESSAGE_COLUMNS: &str = "id, session_id, user_query, ai_response, animation_status, \
     animation_urls, animation_error, created_at, updated_at";

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    let status: String = row.get(4)?;
    let animation_status = status
        .parse::<AnimationStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?;

    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        user_query: row.get(2)?,
        ai_response: json_column(row, 3)?,
        animation_status,
        animation_urls: json_column(row, 5)?,
        animation_error: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn current_status(conn: &Connection, id: &str) -> Result<AnimationStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT animation_status FROM chat_messages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    match status {
        Some(s) => s.parse(),
        None => Err(StoreError::MessageNotFound(id.to_string()).into()),
    }
}

impl Store {
    pub fn insert_message(&self, new: NewMessage) -> Result<ChatMessage> {
        let ts = now();
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: new.session_id,
            user_query: new.user_query,
            ai_response: new.ai_response,
            animation_status: new.animation_status,
            animation_urls: Vec::new(),
            animation_error: None,
            created_at: ts.clone(),
            updated_at: ts,
        };

        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO chat_messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                MESSAGE_COLUMNS
            ),
            params![
                message.id,
                message.session_id,
                message.user_query,
                serde_json::to_string(&message.ai_response)?,
                message.animation_status.as_str(),
                serde_json::to_string(&message.animation_urls)?,
                message.animation_error,
                message.created_at,
                message.updated_at
            ],
        )?;

        if let Some(ref session_id) = message.session_id {
            conn.execute(
                "UPDATE chat_sessions SET updated_at = ?2 WHERE id = ?1",
                params![session_id, message.created_at],
            )?;
        }

        Ok(message)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<ChatMessage>> {
        let conn = self.lock()?;
        let message = conn
            .query_row(
                &format!("SELECT {} FROM chat_messages WHERE id = ?1", MESSAGE_COLUMNS),
                params![id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    pub fn require_message(&self, id: &str) -> Result<ChatMessage> {
        self.get_message(id)?
            .ok_or_else(|| StoreError::MessageNotFound(id.to_string()).into())
    }

    /// Newest message in the session asking exactly this query.
    pub fn find_message_by_query(
        &self,
        session_id: &str,
        user_query: &str,
    ) -> Result<Option<ChatMessage>> {
        let conn = self.lock()?;
        let message = conn
            .query_row(
                &format!(
                    "SELECT {} FROM chat_messages
                     WHERE session_id = ?1 AND user_query = ?2
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    MESSAGE_COLUMNS
                ),
                params![session_id, user_query],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Oldest first.
    pub fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chat_messages WHERE session_id = ?1
             ORDER BY created_at ASC, rowid ASC",
            MESSAGE_COLUMNS
        ))?;
        let messages = stmt
            .query_map(params![session_id], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// The last `limit` exchanges of a session, oldest first.
    pub fn recent_exchanges(&self, session_id: &str, limit: usize) -> Result<Vec<Exchange>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_query, ai_response FROM chat_messages WHERE session_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let mut exchanges = stmt
            .query_map(params![session_id, limit as i64], |row| {
                let response: AiResponse = json_column(row, 1)?;
                Ok(Exchange {
                    user_query: row.get(0)?,
                    explanation: response.explanation,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        exchanges.reverse();
        Ok(exchanges)
    }

    /// Validated status change. `urls` replaces the stored list when given;
    /// `error` always overwrites the stored error text.
    fn transition(
        &self,
        id: &str,
        to: AnimationStatus,
        urls: Option<&[AnimationUrl]>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let from = current_status(&conn, id)?;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from, to }.into());
        }

        match urls {
            Some(urls) => conn.execute(
                "UPDATE chat_messages
                 SET animation_status = ?2, animation_error = ?3, animation_urls = ?4,
                     updated_at = ?5
                 WHERE id = ?1",
                params![id, to.as_str(), error, serde_json::to_string(urls)?, now()],
            )?,
            None => conn.execute(
                "UPDATE chat_messages
                 SET animation_status = ?2, animation_error = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, to.as_str(), error, now()],
            )?,
        };

        Ok(())
    }

    /// Put an idle message back into the queue.
    pub fn requeue(&self, id: &str) -> Result<()> {
        self.transition(id, AnimationStatus::Pending, None, None)
    }

    /// Take ownership of generation for a message. Idle messages are re-queued
    /// implicitly; `processing` and `completed` are refused.
    pub fn claim(&self, id: &str) -> Result<AnimationStatus> {
        let conn = self.lock()?;
        let from = current_status(&conn, id)?;
        let claimable = from == AnimationStatus::Pending || from.can_requeue();
        if !claimable {
            return Err(StoreError::InvalidTransition {
                from,
                to: AnimationStatus::Processing,
            }
            .into());
        }

        conn.execute(
            "UPDATE chat_messages
             SET animation_status = 'processing', animation_error = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, now()],
        )?;

        Ok(from)
    }

    pub fn complete(&self, id: &str, urls: &[AnimationUrl]) -> Result<()> {
        self.transition(id, AnimationStatus::Completed, Some(urls), None)
    }

    /// `status` is `Error` for a run that finished without output and `Failed`
    /// for one that aborted.
    pub fn fail(
        &self,
        id: &str,
        status: AnimationStatus,
        error: &str,
        urls: &[AnimationUrl],
    ) -> Result<()> {
        self.transition(id, status, Some(urls), Some(error))
    }

    pub fn skip(&self, id: &str, reason: &str) -> Result<()> {
        self.transition(id, AnimationStatus::Skipped, None, Some(reason))
    }

    pub fn save_step_code(&self, message_id: &str, step: u32, code: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO animation_code (message_id, step, code, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(message_id, step) DO UPDATE SET code = excluded.code,
                created_at = excluded.created_at",
            params![message_id, step, code, now()],
        )?;
        Ok(())
    }

    pub fn step_code(&self, message_id: &str) -> Result<Vec<(u32, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT step, code FROM animation_code WHERE message_id = ?1 ORDER BY step",
        )?;
        let rows = stmt
            .query_map(params![message_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
