use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;

use super::messages::AnimationUrl;
use super::{Store, now};
use crate::llm::{deserialize_embedding, serialize_embedding};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnimationCacheEntry {
    pub query_hash: String,
    #[serde(skip)]
    pub query_embedding: Vec<f32>,
    pub animation_urls: Vec<AnimationUrl>,
    pub manim_code: String,
    pub original_query: String,
    pub key_terms: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// The columns needed for a nearest-neighbour scan.
#[derive(Debug, Clone)]
pub struct CacheCandidate {
    pub query_hash: String,
    pub embedding: Vec<f32>,
    pub animation_urls: Vec<AnimationUrl>,
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<AnimationCacheEntry> {
    let embedding: String = row.get(1)?;
    let urls: String = row.get(2)?;
    let key_terms: String = row.get(5)?;

    Ok(AnimationCacheEntry {
        query_hash: row.get(0)?,
        query_embedding: deserialize_embedding(&embedding),
        animation_urls: serde_json::from_str(&urls).unwrap_or_default(),
        manim_code: row.get(3)?,
        original_query: row.get(4)?,
        key_terms: serde_json::from_str(&key_terms).unwrap_or_default(),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl Store {
    pub fn get_cache_entry(&self, query_hash: &str) -> Result<Option<AnimationCacheEntry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                "SELECT query_hash, query_embedding, animation_urls, manim_code,
                        original_query, key_terms, created_at, updated_at
                 FROM animation_cache WHERE query_hash = ?1",
                params![query_hash],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Entries that carry an embedding and at least one URL.
    pub fn cache_candidates(&self) -> Result<Vec<CacheCandidate>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT query_hash, query_embedding, animation_urls FROM animation_cache
             WHERE query_embedding != '[]' AND animation_urls != '[]'",
        )?;
        let candidates = stmt
            .query_map([], |row| {
                let embedding: String = row.get(1)?;
                let urls: String = row.get(2)?;
                Ok(CacheCandidate {
                    query_hash: row.get(0)?,
                    embedding: deserialize_embedding(&embedding),
                    animation_urls: serde_json::from_str(&urls).unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(candidates)
    }

    /// Insert or replace on hash; `created_at` survives replacement.
    pub fn upsert_cache_entry(
        &self,
        query_hash: &str,
        embedding: &[f32],
        urls: &[AnimationUrl],
        manim_code: &str,
        original_query: &str,
        key_terms: &[String],
    ) -> Result<()> {
        let ts = now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO animation_cache
                (query_hash, query_embedding, animation_urls, manim_code,
                 original_query, key_terms, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(query_hash) DO UPDATE SET
                query_embedding = excluded.query_embedding,
                animation_urls = excluded.animation_urls,
                manim_code = excluded.manim_code,
                original_query = excluded.original_query,
                key_terms = excluded.key_terms,
                updated_at = excluded.updated_at",
            params![
                query_hash,
                serialize_embedding(embedding),
                serde_json::to_string(urls)?,
                manim_code,
                original_query,
                serde_json::to_string(key_terms)?,
                ts
            ],
        )?;
        Ok(())
    }
}
