//! Context extraction worker.
//!
//! Once per unique PDF content hash: estimate the document size, walk it in
//! word-budgeted batches of contiguous pages, mine each batch with the
//! model, quality-filter and dedup the candidates, and commit entries plus
//! the checkpoint in one transaction per batch. Retries resume from the
//! checkpoint instead of reprocessing finished batches.

use crate::ai_client::{ChatProvider, ChatRequest};
use crate::config::AppConfig;
use crate::error::ExtractFailure;
use crate::fingerprint::{detect_language, estimate_word_count, normalize_title};
use crate::job_queue::ContextJobQueue;
use crate::pdf::{FileFetcher, PageTextSource};
use crate::prompts::{
    extraction_user_prompt, parse_candidate_entries, CandidateEntry, EXTRACTION_SYSTEM_EN,
    EXTRACTION_SYSTEM_TRANSLATE,
};
use crate::store::MemoryStore;
use crate::types::*;
use std::sync::Arc;
use tracing::{debug, info, warn};

const EXTRACTION_TEMPERATURE: f32 = 0.2;
const EXTRACTION_MAX_TOKENS: u32 = 4000;
/// Quality multiplier for batches routed through the translation prompt.
const TRANSLATION_PENALTY: f64 = 0.9;

pub struct ExtractionWorker {
    store: Arc<MemoryStore>,
    queue: Arc<ContextJobQueue>,
    provider: Arc<dyn ChatProvider>,
    fetcher: Arc<dyn FileFetcher>,
    text_source: Arc<dyn PageTextSource>,
    config: AppConfig,
    worker_id: String,
}

impl ExtractionWorker {
    pub fn new(
        store: Arc<MemoryStore>,
        queue: Arc<ContextJobQueue>,
        provider: Arc<dyn ChatProvider>,
        fetcher: Arc<dyn FileFetcher>,
        text_source: Arc<dyn PageTextSource>,
        config: AppConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            provider,
            fetcher,
            text_source,
            config,
            worker_id: worker_id.into(),
        }
    }

    /// Poll-claim-process until the task is aborted.
    pub async fn run_loop(&self) {
        info!("extraction worker {} started", self.worker_id);
        loop {
            if !self.tick().await {
                tokio::time::sleep(self.config.worker_poll).await;
            }
        }
    }

    /// Claim and process at most one job. Returns whether a job ran.
    pub async fn tick(&self) -> bool {
        let Some(job) = self.queue.claim(&self.worker_id) else {
            return false;
        };
        self.process(job).await;
        true
    }

    async fn process(&self, job: ContextJob) {
        let job_id = job.id.clone();
        match self.process_inner(job).await {
            Ok(()) => {
                self.queue.complete(&job_id);
                info!("context job {} completed", job_id);
            }
            Err(ExtractFailure::Transient(message)) => {
                self.queue.fail(&job_id, &message);
            }
            Err(ExtractFailure::Terminal(message)) => {
                self.queue.fail_terminal(&job_id, &message);
            }
        }
    }

    async fn process_inner(&self, job: ContextJob) -> Result<(), ExtractFailure> {
        let file = self
            .store
            .file(&job.file_id)
            .ok_or_else(|| ExtractFailure::Terminal(format!("file {} missing", job.file_id)))?;
        let bytes = self
            .fetcher
            .fetch(&file.storage_key)
            .await
            .map_err(|e| ExtractFailure::Transient(format!("fetch: {:#}", e)))?;
        let total_pages = self
            .text_source
            .page_count(&bytes)
            .await
            .map_err(|e| ExtractFailure::Transient(format!("page count: {:#}", e)))?;
        if total_pages == 0 {
            return Err(ExtractFailure::Terminal("document has no pages".to_string()));
        }

        let job = if job.estimated_total_words == 0 {
            self.estimate(&job, &bytes, total_pages).await?
        } else {
            job
        };

        let mut page = job.processed_pages + 1;
        let mut processed_words = job.processed_words;
        let mut batch_index = job.current_batch;

        while page <= total_pages {
            let (batch_text, batch_words, last_page) =
                self.build_batch(&bytes, page, total_pages).await?;
            let first_page = page;
            page = last_page + 1;

            let language = detect_language(&batch_text);
            let (system, penalty) = if language == "en" {
                (EXTRACTION_SYSTEM_EN, 1.0)
            } else {
                (EXTRACTION_SYSTEM_TRANSLATE, TRANSLATION_PENALTY)
            };

            let request = ChatRequest {
                system: system.to_string(),
                user: extraction_user_prompt(&batch_text, first_page, last_page),
                images: vec![],
                temperature: EXTRACTION_TEMPERATURE,
                max_tokens: EXTRACTION_MAX_TOKENS,
                json_mode: false,
            };
            let response = tokio::time::timeout(
                self.config.generation_timeout,
                self.provider.chat(&request),
            )
            .await
            .map_err(|_| ExtractFailure::Transient("extraction call timed out".to_string()))?
            .map_err(|e| ExtractFailure::Transient(format!("extraction call: {:#}", e)))?;

            let mut candidates = parse_candidate_entries(&response.content);
            for candidate in &mut candidates {
                candidate.quality_score *= penalty;
            }
            candidates.retain(|c| c.quality_score >= self.config.quality_threshold);
            let deduped = dedup_batch(candidates);

            let entries: Vec<ContextEntry> = deduped
                .into_iter()
                .map(|c| ContextEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    pdf_hash: job.pdf_hash.clone(),
                    kind: c.kind,
                    title: c.title,
                    body: c.body,
                    source_page: c.source_page.unwrap_or(first_page),
                    keywords: c.keywords,
                    quality_score: c.quality_score,
                    language: language.to_string(),
                    extraction_version: job.extraction_version,
                    created_at_ms: now_ms(),
                })
                .collect();

            batch_index += 1;
            processed_words += batch_words;
            let stored = self.store.commit_batch(
                &job.id,
                entries,
                last_page,
                processed_words,
                batch_index,
            );
            self.queue.heartbeat(&job.id, &self.worker_id);
            debug!(
                "job {}: batch {} pages {}..{} stored {} entries",
                job.id, batch_index, first_page, last_page, stored
            );
        }

        // Extraction grants the owning user scope over the hash
        self.store.ensure_scope(UserScope {
            user_id: job.user_id.clone(),
            course_id: file.course_id.clone(),
            file_id: file.id.clone(),
            pdf_hash: job.pdf_hash.clone(),
        });
        Ok(())
    }

    /// Sample the first pages to estimate total words and the batch plan.
    async fn estimate(
        &self,
        job: &ContextJob,
        bytes: &[u8],
        total_pages: u32,
    ) -> Result<ContextJob, ExtractFailure> {
        let sample = self.config.sample_pages.min(total_pages).max(1);
        let mut sampled_words = 0u64;
        for page in 1..=sample {
            let text = self
                .text_source
                .page_text(bytes, page)
                .await
                .map_err(|e| ExtractFailure::Transient(format!("sample page {}: {:#}", page, e)))?;
            sampled_words += estimate_word_count(&text) as u64;
        }
        let words_per_page = (sampled_words as f64 / sample as f64).max(1.0);
        let estimated_total_words = (words_per_page * total_pages as f64) as u64;
        let total_batches = ((estimated_total_words as f64
            / self.config.batch_target_words as f64)
            .ceil() as u32)
            .max(1);

        debug!(
            "job {}: estimated {} words over {} pages, {} batches",
            job.id, estimated_total_words, total_pages, total_batches
        );
        self.store
            .with_job(&job.id, |j| {
                j.total_pages = total_pages;
                j.estimated_total_words = estimated_total_words;
                j.total_batches = total_batches;
                j.clone()
            })
            .ok_or_else(|| ExtractFailure::Terminal("job vanished during estimate".to_string()))
    }

    /// Contiguous pages from `start` until the word target is reached or the
    /// next page would push past the hard cap.
    async fn build_batch(
        &self,
        bytes: &[u8],
        start: u32,
        total_pages: u32,
    ) -> Result<(String, u64, u32), ExtractFailure> {
        let mut batch_text = String::new();
        let mut batch_words = 0u64;
        let mut page = start;
        while page <= total_pages {
            let text = self
                .text_source
                .page_text(bytes, page)
                .await
                .map_err(|e| ExtractFailure::Transient(format!("page {}: {:#}", page, e)))?;
            let words = estimate_word_count(&text) as u64;
            if batch_words > 0 && batch_words + words > self.config.batch_max_words {
                break;
            }
            if !batch_text.is_empty() {
                batch_text.push_str("\n\n");
            }
            batch_text.push_str(&text);
            batch_words += words;
            page += 1;
            if batch_words >= self.config.batch_target_words {
                break;
            }
        }
        if page == start {
            // A single page over the cap still forms its own batch
            warn!("page {} alone exceeds the batch cap", start);
            let text = self
                .text_source
                .page_text(bytes, page)
                .await
                .map_err(|e| ExtractFailure::Transient(format!("page {}: {:#}", page, e)))?;
            let words = estimate_word_count(&text) as u64;
            return Ok((text, words, page));
        }
        Ok((batch_text, batch_words, page - 1))
    }
}

/// Group candidates by normalized title, keeping the highest score. Ties go
/// to the earlier-seen candidate.
fn dedup_batch(candidates: Vec<CandidateEntry>) -> Vec<CandidateEntry> {
    let mut kept: Vec<(String, CandidateEntry)> = Vec::new();
    for candidate in candidates {
        let key = normalize_title(&candidate.title);
        match kept.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => {
                if candidate.quality_score > existing.quality_score {
                    *existing = candidate;
                }
            }
            None => kept.push((key, candidate)),
        }
    }
    kept.into_iter().map(|(_, c)| c).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::MockChatProvider;
    use crate::pdf::{FixturePdf, InMemoryFiles};
    use crate::types::EntryKind;

    fn file() -> FileRecord {
        FileRecord {
            id: "file-1".to_string(),
            course_id: "course-1".to_string(),
            owner_user_id: "user-1".to_string(),
            storage_key: "objects/file-1.pdf".to_string(),
            page_count: 4,
            is_scanned: false,
            content_hash: Some("hash-a".to_string()),
        }
    }

    /// Small word budgets so a four-page fixture spans two batches.
    fn config() -> AppConfig {
        AppConfig {
            batch_target_words: 20,
            batch_min_words: 10,
            batch_max_words: 30,
            sample_pages: 2,
            ..AppConfig::default()
        }
    }

    fn worker(provider: MockChatProvider, pages: Vec<&str>) -> (Arc<MemoryStore>, Arc<ContextJobQueue>, ExtractionWorker) {
        let config = config();
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(ContextJobQueue::new(store.clone(), &config));
        let files = InMemoryFiles::new();
        files.put("objects/file-1.pdf", vec![0u8; 8]);
        store.upsert_file(file());
        let worker = ExtractionWorker::new(
            store.clone(),
            queue.clone(),
            Arc::new(provider),
            Arc::new(files),
            Arc::new(FixturePdf::new(pages)),
            config,
            "worker-a",
        );
        (store, queue, worker)
    }

    const PAGE: &str = "limits derivatives integrals continuity sequences series \
convergence divergence functions mappings theorems proofs lemmas corollaries";

    fn payload(title: &str, quality: f64) -> String {
        format!(
            r#"[{{"type": "definition", "title": "{}", "body": "A body.", "sourcePage": 1, "keywords": ["calculus"], "qualityScore": {}}}]"#,
            title, quality
        )
    }

    #[tokio::test]
    async fn extraction_runs_batches_and_completes() {
        let (store, _, worker) = worker(
            MockChatProvider::new(vec![
                &payload("Derivative", 0.85),
                &payload("Integral", 0.9),
            ]),
            vec![PAGE, PAGE, PAGE, PAGE],
        );
        let job = worker.queue.enqueue("hash-a", "file-1", "user-1", 4).unwrap();

        assert!(worker.tick().await);

        let done = store.job(&job.id).unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.processed_pages, 4);
        assert!(done.estimated_total_words > 0);
        assert_eq!(store.entry_count_for_hash("hash-a"), 2);
        // Scope row materialized for the owning user
        assert_eq!(store.scope_hashes("user-1", "course-1"), vec!["hash-a".to_string()]);
    }

    #[tokio::test]
    async fn cross_batch_dedup_keeps_best_score() {
        let (store, _, worker) = worker(
            MockChatProvider::new(vec![
                &payload("Derivative", 0.85),
                &payload("derivative", 0.92),
            ]),
            vec![PAGE, PAGE, PAGE, PAGE],
        );
        worker.queue.enqueue("hash-a", "file-1", "user-1", 4).unwrap();
        worker.tick().await;

        let entries = store.entries_for_hashes(&["hash-a".to_string()]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].quality_score, 0.92);
    }

    #[tokio::test]
    async fn low_quality_candidates_are_dropped() {
        let (store, _, worker) = worker(
            MockChatProvider::new(vec![&payload("Weak", 0.5), &payload("Strong", 0.8)]),
            vec![PAGE, PAGE, PAGE, PAGE],
        );
        worker.queue.enqueue("hash-a", "file-1", "user-1", 4).unwrap();
        worker.tick().await;

        let entries = store.entries_for_hashes(&["hash-a".to_string()]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Strong");
    }

    #[tokio::test]
    async fn translation_batches_carry_the_penalty() {
        let zh_page = "数列 极限 收敛 定理 证明 函数 映射 连续 可导 积分 微分 级数 发散 构造";
        let (store, _, worker) = worker(
            MockChatProvider::new(vec![&payload("Limit", 0.8)]),
            vec![zh_page],
        );
        worker.queue.enqueue("hash-a", "file-1", "user-1", 1).unwrap();
        worker.tick().await;

        let entries = store.entries_for_hashes(&["hash-a".to_string()]);
        assert_eq!(entries.len(), 1);
        // 0.8 * 0.9, still above the floor
        assert!((entries[0].quality_score - 0.72).abs() < 1e-9);
        assert_eq!(entries[0].language, "non-en");
    }

    #[tokio::test]
    async fn transient_failure_preserves_checkpoint_and_resumes() {
        let (store, queue, worker) = worker(
            MockChatProvider::scripted(vec![
                Ok(payload("Derivative", 0.85)),
                Err("provider 503".to_string()),
                Ok(payload("Integral", 0.9)),
            ]),
            vec![PAGE, PAGE, PAGE, PAGE],
        );
        let job = queue.enqueue("hash-a", "file-1", "user-1", 4).unwrap();

        worker.tick().await;
        let paused = store.job(&job.id).unwrap();
        assert_eq!(paused.state, JobState::Pending);
        assert_eq!(paused.retry_count, 1);
        // First batch survived the failure
        assert_eq!(paused.current_batch, 1);
        assert!(paused.processed_pages >= 2);
        assert_eq!(store.entry_count_for_hash("hash-a"), 1);

        // Backoff elapsed; the retry picks up where the checkpoint left off
        store.with_job(&job.id, |j| j.run_after_ms = now_ms() - 1);
        worker.tick().await;
        let done = store.job(&job.id).unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(store.entry_count_for_hash("hash-a"), 2);
    }

    #[test]
    fn in_batch_dedup_prefers_earlier_on_ties() {
        let mk = |title: &str, score: f64, body: &str| CandidateEntry {
            kind: EntryKind::Definition,
            title: title.to_string(),
            body: body.to_string(),
            source_page: Some(1),
            keywords: vec![],
            quality_score: score,
        };
        let deduped = dedup_batch(vec![
            mk("Limit", 0.8, "first"),
            mk("limit", 0.8, "second"),
            mk("LIMIT", 0.9, "third"),
        ]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].body, "third");

        let tie = dedup_batch(vec![mk("Limit", 0.8, "first"), mk("limit", 0.8, "second")]);
        assert_eq!(tie[0].body, "first");
    }
}
