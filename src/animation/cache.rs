//! Reuse of previously rendered animations for identical or similar explanations.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chunker::extract_key_terms;
use crate::config::CacheConfig;
use crate::llm::{EmbeddingProvider, cosine_similarity, hash_text};
use crate::store::{AiResponse, AnimationUrl, Store};

const EMPTY_QUERY_TEXT: &str = "Generated animation without explanation";

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub query_hash: String,
    pub urls: Vec<AnimationUrl>,
    /// None for an exact hash match
    pub similarity: Option<f32>,
}

pub struct SimilarityCache {
    store: Store,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    threshold: f32,
    enabled: bool,
}

/// Explanation plus the serialized animation settings, so the same text
/// rendered in another style is a different entry.
pub fn cache_key_text(response: &AiResponse) -> String {
    let settings = serde_json::to_string(&response.animation).unwrap_or_default();
    format!("{} {}", response.explanation, settings)
}

impl SimilarityCache {
    pub fn new(
        store: Store,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            threshold: config.match_threshold,
            enabled: config.enabled,
        }
    }

    /// Exact hash match first, then the nearest embedding above the threshold.
    /// Any failure is logged and treated as a miss.
    pub async fn find_similar(&self, response: &AiResponse) -> Option<CacheHit> {
        if !self.enabled {
            return None;
        }

        let key = cache_key_text(response);
        let hash = hash_text(&key);

        match self.store.get_cache_entry(&hash) {
            Ok(Some(entry)) if !entry.animation_urls.is_empty() => {
                info!("Exact animation cache hit {}", &hash[..12]);
                return Some(CacheHit {
                    query_hash: hash,
                    urls: entry.animation_urls,
                    similarity: None,
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Animation cache lookup failed: {:#}", e);
                return None;
            }
        }

        let embedder = self.embedder.as_ref()?;
        let embedding = match embedder.embed(&key).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!("Embedding for cache lookup failed: {:#}", e);
                return None;
            }
        };

        let candidates = match self.store.cache_candidates() {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Animation cache scan failed: {:#}", e);
                return None;
            }
        };

        let best = candidates
            .into_iter()
            .map(|c| (cosine_similarity(&embedding, &c.embedding), c))
            .filter(|(score, _)| *score >= self.threshold)
            .max_by(|a, b| a.0.total_cmp(&b.0))?;

        info!(
            "Similar animation cache hit {} (similarity {:.3})",
            &best.1.query_hash[..best.1.query_hash.len().min(12)],
            best.0
        );
        Some(CacheHit {
            query_hash: best.1.query_hash,
            urls: best.1.animation_urls,
            similarity: Some(best.0),
        })
    }

    /// Upsert the rendered result under the same key used for lookup.
    pub async fn store(&self, response: &AiResponse, first_code: &str, urls: &[AnimationUrl]) {
        if !self.enabled {
            return;
        }

        let key = cache_key_text(response);
        let hash = hash_text(&key);
        let original_query = if response.explanation.trim().is_empty() {
            EMPTY_QUERY_TEXT
        } else {
            response.explanation.as_str()
        };

        let embedding = match self.embedder {
            Some(ref embedder) => match embedder.embed(&key).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!("Embedding for cache store failed, storing hash only: {:#}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let key_terms = extract_key_terms(&response.explanation);
        match self.store.upsert_cache_entry(
            &hash,
            &embedding,
            urls,
            first_code,
            original_query,
            &key_terms,
        ) {
            Ok(()) => debug!("Stored animation cache entry {}", &hash[..12]),
            Err(e) => warn!("Failed to store animation cache entry: {:#}", e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns fixed vectors keyed by a substring of the input.
    pub struct KeywordEmbedder {
        pub vectors: HashMap<&'static str, Vec<f32>>,
        pub calls: AtomicUsize,
    }

    impl KeywordEmbedder {
        pub fn new(vectors: Vec<(&'static str, Vec<f32>)>) -> Arc<Self> {
            Arc::new(Self {
                vectors: vectors.into_iter().collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        fn model(&self) -> &str {
            "keyword"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.vectors
                .iter()
                .find(|(k, _)| text.contains(*k))
                .map(|(_, v)| crate::llm::normalize_embedding(v.clone()))
                .ok_or_else(|| anyhow::anyhow!("no vector for input"))
        }
    }

    fn urls(name: &str) -> Vec<AnimationUrl> {
        vec![AnimationUrl {
            step: 1,
            url: format!("https://cdn/{}.mp4", name),
        }]
    }

    fn cache(store: &Store, embedder: Arc<KeywordEmbedder>) -> SimilarityCache {
        SimilarityCache::new(store.clone(), Some(embedder), &CacheConfig::default())
    }

    #[test]
    fn key_includes_settings() {
        let response = AiResponse::new("Gravity.", vec![]);
        assert_eq!(
            cache_key_text(&response),
            r#"Gravity. {"type":"default","style":"standard"}"#
        );
    }

    #[tokio::test]
    async fn exact_match_skips_embedding() {
        let store = Store::open_in_memory().unwrap();
        let embedder = KeywordEmbedder::new(vec![("Gravity", vec![1.0, 0.0])]);
        let cache = cache(&store, embedder.clone());
        let response = AiResponse::new("Gravity pulls things down.", vec![]);

        cache.store(&response, "code", &urls("gravity")).await;
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        let hit = cache.find_similar(&response).await.unwrap();
        assert_eq!(hit.urls, urls("gravity"));
        assert!(hit.similarity.is_none());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        let entry = store.get_cache_entry(&hit.query_hash).unwrap().unwrap();
        assert_eq!(entry.original_query, "Gravity pulls things down.");
        assert!(entry.key_terms.contains(&"Gravity".to_string()));
    }

    #[tokio::test]
    async fn nearest_neighbour_above_threshold() {
        let store = Store::open_in_memory().unwrap();
        let embedder = KeywordEmbedder::new(vec![
            ("apple", vec![1.0, 0.1]),
            ("pear", vec![1.0, 0.2]),
            ("boat", vec![0.0, 1.0]),
        ]);
        let cache = cache(&store, embedder);

        cache
            .store(&AiResponse::new("An apple falls.", vec![]), "code", &urls("apple"))
            .await;

        let similar = cache
            .find_similar(&AiResponse::new("A pear falls.", vec![]))
            .await
            .unwrap();
        assert_eq!(similar.urls, urls("apple"));
        assert!(similar.similarity.unwrap() > 0.78);

        assert!(
            cache
                .find_similar(&AiResponse::new("A boat floats.", vec![]))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn embedding_failure_is_a_miss() {
        let store = Store::open_in_memory().unwrap();
        let cache = cache(&store, KeywordEmbedder::new(vec![]));

        let response = AiResponse::new("Unknown topic.", vec![]);
        assert!(cache.find_similar(&response).await.is_none());

        cache.store(&response, "code", &urls("x")).await;
        assert!(cache.find_similar(&response).await.is_some());
    }

    #[tokio::test]
    async fn disabled_cache_does_nothing() {
        let store = Store::open_in_memory().unwrap();
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = SimilarityCache::new(store.clone(), None, &config);
        let response = AiResponse::new("Gravity.", vec![]);

        cache.store(&response, "code", &urls("g")).await;
        assert!(cache.find_similar(&response).await.is_none());
        assert_eq!(store.stats().unwrap().cache_entries, 0);
    }

    #[tokio::test]
    async fn blank_explanation_gets_default_query_text() {
        let store = Store::open_in_memory().unwrap();
        let cache = SimilarityCache::new(store.clone(), None, &CacheConfig::default());
        let response = AiResponse::new("  ", vec![]);

        cache.store(&response, "code", &urls("blank")).await;
        let hit = cache.find_similar(&response).await.unwrap();
        let entry = store.get_cache_entry(&hit.query_hash).unwrap().unwrap();
        assert_eq!(entry.original_query, EMPTY_QUERY_TEXT);
    }
}
