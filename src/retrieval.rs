//! Context retrieval: keyword extraction and scoped, scored entry lookup.
//!
//! Retrieval degrades silently. A provider error, unusable JSON, or an empty
//! scope all produce an empty result rather than an error, so a sticker
//! generation never fails because context was unavailable.

use crate::ai_client::{ChatProvider, ChatRequest};
use crate::config::AppConfig;
use crate::fingerprint::{estimate_token_count, sha256_hex};
use crate::prompts::{keyword_user_prompt, parse_keywords, KEYWORD_SYSTEM};
use crate::store::MemoryStore;
use crate::types::ContextEntry;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "that", "this", "with", "from",
    "have", "has", "had", "not", "but", "can", "will", "into", "each", "which",
    "their", "them", "then", "than", "its", "also", "such", "these", "those",
    "when", "where", "what", "how", "why", "all", "any", "may", "more", "most",
    "other", "some", "only", "over", "between", "both", "been", "being", "does",
];

#[derive(Clone)]
struct CachedKeywords {
    keywords: Vec<String>,
    stored_at: Instant,
}

/// Keyword extractor with a TTL'd in-process LRU in front of the model.
pub struct KeywordExtractor {
    provider: Arc<dyn ChatProvider>,
    cache: Mutex<LruCache<String, CachedKeywords>>,
    ttl: Duration,
}

impl KeywordExtractor {
    pub fn new(provider: Arc<dyn ChatProvider>, config: &AppConfig) -> Self {
        let cap = NonZeroUsize::new(config.keyword_cache_cap.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            provider,
            cache: Mutex::new(LruCache::new(cap)),
            ttl: config.keyword_cache_ttl,
        }
    }

    /// 3-8 lowercased academic keywords for the given text and/or question.
    pub async fn extract(&self, page_text: Option<&str>, question: Option<&str>) -> Vec<String> {
        let combined = format!(
            "{}|{}",
            page_text.unwrap_or_default(),
            question.unwrap_or_default()
        );
        if combined == "|" {
            return Vec::new();
        }
        let cache_key = sha256_hex(combined.as_bytes());

        if let Some(cached) = self.cache_get(&cache_key) {
            return cached;
        }

        let keywords = match self.ask_model(page_text, question).await {
            Some(keywords) => keywords,
            None => {
                debug!("keyword model unusable, using frequency heuristic");
                heuristic_keywords(&combined)
            }
        };

        self.cache_put(cache_key, keywords.clone());
        keywords
    }

    fn cache_get(&self, key: &str) -> Option<Vec<String>> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(hit) if hit.stored_at.elapsed() < self.ttl => Some(hit.keywords.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: String, keywords: Vec<String>) {
        self.cache.lock().put(
            key,
            CachedKeywords {
                keywords,
                stored_at: Instant::now(),
            },
        );
    }

    async fn ask_model(&self, page_text: Option<&str>, question: Option<&str>) -> Option<Vec<String>> {
        let request = ChatRequest {
            system: KEYWORD_SYSTEM.to_string(),
            user: keyword_user_prompt(page_text, question),
            images: vec![],
            temperature: 0.0,
            max_tokens: 200,
            json_mode: true,
        };
        match self.provider.chat(&request).await {
            Ok(response) => parse_keywords(&response.content),
            Err(e) => {
                warn!("keyword extraction call failed: {:#}", e);
                None
            }
        }
    }
}

/// Stop-word-filtered frequency fallback when the model misbehaves.
fn heuristic_keywords(text: &str) -> Vec<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        let word = raw.to_lowercase();
        let len = word.chars().count();
        if !(3..=100).contains(&len) || STOP_WORDS.contains(&word.as_str()) {
            continue;
        }
        match counts.iter_mut().find(|(w, _)| *w == word) {
            Some((_, n)) => *n += 1,
            None => counts.push((word, 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts.into_iter().take(8).map(|(w, _)| w).collect()
}

/// Inputs for one retrieval.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub user_id: String,
    pub course_id: String,
    /// Content hash of the PDF being read, for the source bonus.
    pub current_pdf_hash: Option<String>,
    pub page_text: Option<String>,
    pub question: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub entries: Vec<ContextEntry>,
    pub total_tokens: usize,
    pub retrieval_time_ms: u64,
}

pub struct ContextRetriever {
    store: Arc<MemoryStore>,
    keywords: KeywordExtractor,
    quality_threshold: f64,
    token_budget: usize,
    max_entries: usize,
}

impl ContextRetriever {
    pub fn new(store: Arc<MemoryStore>, provider: Arc<dyn ChatProvider>, config: &AppConfig) -> Self {
        Self {
            store,
            keywords: KeywordExtractor::new(provider, config),
            quality_threshold: config.quality_threshold,
            token_budget: config.context_token_budget,
            max_entries: config.context_max_entries,
        }
    }

    pub async fn retrieve_for_page(&self, request: &RetrievalRequest) -> RetrievalResult {
        let start = Instant::now();

        let query_keywords = self
            .keywords
            .extract(request.page_text.as_deref(), request.question.as_deref())
            .await;
        if query_keywords.is_empty() {
            return RetrievalResult::default();
        }

        let scope = self.store.scope_hashes(&request.user_id, &request.course_id);
        if scope.is_empty() {
            return RetrievalResult::default();
        }

        let candidates: Vec<ContextEntry> = self
            .store
            .entries_for_hashes(&scope)
            .into_iter()
            .filter(|e| e.quality_score >= self.quality_threshold)
            .collect();

        let keyword_set: HashSet<&str> = query_keywords.iter().map(|k| k.as_str()).collect();
        let mut matched: Vec<ContextEntry> = candidates
            .iter()
            .filter(|e| e.keywords.iter().any(|k| keyword_set.contains(k.as_str())))
            .cloned()
            .collect();

        // Keyword arrays missed entirely; fall back to title text search
        if matched.is_empty() {
            matched = candidates
                .into_iter()
                .filter(|e| {
                    let title = e.title.to_lowercase();
                    query_keywords.iter().any(|k| title.contains(k.as_str()))
                })
                .collect();
        }
        if matched.is_empty() {
            return RetrievalResult::default();
        }

        let mut scored: Vec<(f64, ContextEntry)> = matched
            .into_iter()
            .map(|e| (self.score(&e, request), e))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(self.max_entries);

        // Greedy fill: stop at the first entry that would overflow the
        // token budget, never skip past it.
        let mut selected = Vec::new();
        let mut total_tokens = 0usize;
        for (_, entry) in scored {
            let cost = estimate_token_count(&format!("{}: {}", entry.title, entry.body));
            if total_tokens + cost > self.token_budget {
                break;
            }
            total_tokens += cost;
            selected.push(entry);
        }

        debug!(
            "retrieved {} context entries ({} tokens) for user {}",
            selected.len(),
            total_tokens,
            request.user_id
        );

        RetrievalResult {
            entries: selected,
            total_tokens,
            retrieval_time_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn score(&self, entry: &ContextEntry, request: &RetrievalRequest) -> f64 {
        let source_bonus = match &request.current_pdf_hash {
            Some(hash) if *hash == entry.pdf_hash => 100.0,
            // Everything in scope shares the course
            _ => 50.0,
        };
        entry.quality_score * 10.0 + entry.kind.type_bonus() + source_bonus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::MockChatProvider;
    use crate::types::{now_ms, EntryKind, UserScope};

    fn entry(pdf_hash: &str, kind: EntryKind, title: &str, quality: f64, keywords: Vec<&str>) -> ContextEntry {
        ContextEntry {
            id: uuid::Uuid::new_v4().to_string(),
            pdf_hash: pdf_hash.to_string(),
            kind,
            title: title.to_string(),
            body: "a short body".to_string(),
            source_page: 1,
            keywords: keywords.into_iter().map(|k| k.to_string()).collect(),
            quality_score: quality,
            language: "en".to_string(),
            extraction_version: 1,
            created_at_ms: now_ms(),
        }
    }

    fn scoped_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.ensure_scope(UserScope {
            user_id: "user-1".to_string(),
            course_id: "course-1".to_string(),
            file_id: "file-1".to_string(),
            pdf_hash: "hash-a".to_string(),
        });
        store
    }

    fn request() -> RetrievalRequest {
        RetrievalRequest {
            user_id: "user-1".to_string(),
            course_id: "course-1".to_string(),
            current_pdf_hash: Some("hash-a".to_string()),
            page_text: Some("the derivative measures rate of change".to_string()),
            question: None,
        }
    }

    #[tokio::test]
    async fn retrieval_ranks_definitions_over_concepts() {
        let store = scoped_store();
        store.upsert_entry(entry("hash-a", EntryKind::Concept, "rates", 0.9, vec!["derivative"]));
        store.upsert_entry(entry("hash-a", EntryKind::Definition, "Derivative", 0.9, vec!["derivative"]));

        let provider = Arc::new(MockChatProvider::new(vec![r#"{"keywords": ["derivative"]}"#]));
        let retriever = ContextRetriever::new(store, provider, &AppConfig::default());

        let result = retriever.retrieve_for_page(&request()).await;
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.entries[0].title, "Derivative");
        assert!(result.total_tokens > 0);
    }

    #[tokio::test]
    async fn retrieval_respects_token_budget() {
        let store = scoped_store();
        for i in 0..40 {
            let mut e = entry("hash-a", EntryKind::Definition, &format!("term {}", i), 0.9, vec!["derivative"]);
            e.body = "word ".repeat(200);
            store.upsert_entry(e);
        }
        let provider = Arc::new(MockChatProvider::new(vec![r#"{"keywords": ["derivative"]}"#]));
        let retriever = ContextRetriever::new(store, provider, &AppConfig::default());

        let result = retriever.retrieve_for_page(&request()).await;
        assert!(result.total_tokens <= 2000);
        assert!(result.entries.len() <= 30);
        assert!(!result.entries.is_empty());
    }

    #[tokio::test]
    async fn keyword_fallback_on_bad_model_output() {
        let store = scoped_store();
        store.upsert_entry(entry("hash-a", EntryKind::Definition, "Derivative", 0.9, vec!["derivative"]));

        let provider = Arc::new(MockChatProvider::new(vec!["sorry, I cannot do that"]));
        let retriever = ContextRetriever::new(store, provider, &AppConfig::default());

        // Heuristic keywords from the page text still hit the entry
        let result = retriever.retrieve_for_page(&request()).await;
        assert_eq!(result.entries.len(), 1);
    }

    #[tokio::test]
    async fn empty_scope_returns_empty() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockChatProvider::new(vec![r#"{"keywords": ["derivative"]}"#]));
        let retriever = ContextRetriever::new(store, provider, &AppConfig::default());

        let result = retriever.retrieve_for_page(&request()).await;
        assert!(result.entries.is_empty());
        assert_eq!(result.total_tokens, 0);
    }

    #[tokio::test]
    async fn keyword_cache_serves_repeat_queries() {
        let provider = Arc::new(MockChatProvider::new(vec![r#"{"keywords": ["derivative"]}"#]));
        let extractor = KeywordExtractor::new(provider, &AppConfig::default());

        let first = extractor.extract(Some("page text"), None).await;
        // Script is exhausted; a cache miss would fall back to the
        // heuristic and return different keywords
        let second = extractor.extract(Some("page text"), None).await;
        assert_eq!(first, vec!["derivative".to_string()]);
        assert_eq!(first, second);
    }

    #[test]
    fn heuristic_filters_stop_words() {
        let keywords = heuristic_keywords("the derivative and the integral are the tools");
        assert!(keywords.contains(&"derivative".to_string()));
        assert!(keywords.contains(&"integral".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"and".to_string()));
    }
}
