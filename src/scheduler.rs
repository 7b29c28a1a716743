//! Per-session background prefetch.
//!
//! One task per active window session. Each iteration re-reads the session,
//! claims up to the concurrency budget of prioritized pages, drives each
//! page to a terminal state through the shared cache, and records the result
//! so users see partial progress immediately. Cancellation is cooperative:
//! the loop checks session state before every pickup and never interrupts a
//! page already running.

use crate::config::AppConfig;
use crate::generator::{GenerateJob, StickerGenerator};
use crate::pdf::FileFetcher;
use crate::quota::{Bucket, QuotaService};
use crate::session_store::{pages_to_generate, SessionStore};
use crate::sticker_cache::{project_stickers, ProbeResult, StickerCache};
use crate::store::MemoryStore;
use crate::types::*;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Emitted after every page that reaches a terminal state.
#[derive(Debug, Clone)]
pub struct SessionProgress {
    pub session_id: String,
    pub page: u32,
    pub failed: bool,
    pub completed_in_window: u32,
    pub window_pages: u32,
    pub state: SessionState,
}

pub type ProgressCallback = Arc<dyn Fn(SessionProgress) + Send + Sync>;

/// Everything a session task needs that is not in the session row itself.
#[derive(Clone)]
pub struct SessionRun {
    pub session_id: String,
    pub user_id: String,
    pub course_id: String,
    pub locale: Locale,
    pub file: FileRecord,
}

pub struct WindowScheduler {
    store: Arc<MemoryStore>,
    sessions: Arc<SessionStore>,
    cache: Arc<StickerCache>,
    quota: Arc<QuotaService>,
    generator: Arc<StickerGenerator>,
    fetcher: Arc<dyn FileFetcher>,
    config: AppConfig,
    progress: Option<ProgressCallback>,
}

impl WindowScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MemoryStore>,
        sessions: Arc<SessionStore>,
        cache: Arc<StickerCache>,
        quota: Arc<QuotaService>,
        generator: Arc<StickerGenerator>,
        fetcher: Arc<dyn FileFetcher>,
        config: AppConfig,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            store,
            sessions,
            cache,
            quota,
            generator,
            fetcher,
            config,
            progress,
        }
    }

    /// Launch the background task for one session.
    pub fn spawn(self: &Arc<Self>, run: SessionRun) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_session(run).await;
        })
    }

    pub async fn run_session(&self, run: SessionRun) {
        info!("scheduler task started for session {}", run.session_id);
        let mut file_bytes: Option<Arc<Vec<u8>>> = None;

        loop {
            let Some(session) = self.sessions.get(&run.session_id) else {
                break;
            };
            if session.state != SessionState::Active {
                debug!(
                    "session {} is {:?}, scheduler exiting",
                    run.session_id, session.state
                );
                break;
            }

            let order = pages_to_generate(
                session.window_start,
                session.window_end,
                &session.covered_pages(),
                session.current_page,
            );
            if order.is_empty() {
                if session.pages_in_progress.is_empty() {
                    self.finish_if_covered(&run.session_id);
                }
                break;
            }

            let budget = match session.pdf_kind {
                PdfKind::Ppt => self.config.ppt_concurrency,
                PdfKind::Text => self.config.text_concurrency,
            }
            .max(1);
            let want: Vec<u32> = order.into_iter().take(budget).collect();
            let claimed = self.sessions.claim_pages(&run.session_id, &want);
            if claimed.is_empty() {
                continue;
            }

            // One download serves the whole session
            if file_bytes.is_none() {
                match self.fetcher.fetch(&run.file.storage_key).await {
                    Ok(bytes) => file_bytes = Some(Arc::new(bytes)),
                    Err(e) => {
                        warn!(
                            "session {}: file fetch failed: {:#}",
                            run.session_id, e
                        );
                        for page in &claimed {
                            self.record_page(&run, *page, true);
                        }
                        continue;
                    }
                }
            }

            let work = claimed
                .iter()
                .map(|page| self.run_page(&run, *page, file_bytes.clone()));
            let outcomes = futures::future::join_all(work).await;
            for (page, failed) in claimed.iter().zip(outcomes) {
                self.record_page(&run, *page, failed);
            }
        }
        info!("scheduler task finished for session {}", run.session_id);
    }

    /// Drive one page to a terminal state through the shared cache.
    /// Returns true when the page failed.
    async fn run_page(&self, run: &SessionRun, page: u32, bytes: Option<Arc<Vec<u8>>>) -> bool {
        let Some(pdf_hash) = run.file.content_hash.clone() else {
            return true;
        };
        let fingerprint = Fingerprint {
            pdf_hash,
            page,
            locale: run.locale,
            mode: EffectiveMode::TextOnly,
            selection_hash: None,
        };

        // Served pages charge the bucket; a page the user already holds
        // stickers for is a local duplicate and stays free.
        let already_local = self
            .store
            .has_auto_stickers(&run.user_id, &run.file.id, page);
        if !already_local
            && self
                .quota
                .deduct(&run.user_id, Bucket::AutoExplain, 1)
                .is_err()
        {
            warn!(
                "session {}: quota exhausted at page {}",
                run.session_id, page
            );
            return true;
        }

        match self.cache.probe(&fingerprint, &run.user_id) {
            ProbeResult::Ready { generation } => {
                self.adopt_ready(run, page, &generation, already_local);
                false
            }
            ProbeResult::Generating { generation_id } => {
                self.await_peer(run, page, &generation_id, already_local).await
            }
            ProbeResult::NotFound => {
                // Reserve only what was actually deducted above
                let units = u32::from(!already_local);
                let claim = self.cache.try_start(&fingerprint, &run.user_id, units, &[]);
                if !claim.started {
                    return self
                        .await_peer(run, page, &claim.generation_id, already_local)
                        .await;
                }
                let job = GenerateJob {
                    generation_id: claim.generation_id,
                    user_id: run.user_id.clone(),
                    course_id: run.course_id.clone(),
                    file: run.file.clone(),
                    page,
                    pdf_kind: self.session_kind(&run.session_id),
                    locale: run.locale,
                    mode: EffectiveMode::TextOnly,
                    images: vec![],
                    question: None,
                    file_bytes: bytes,
                };
                // Failure already refunded the reserved unit via the cache
                self.generator.run(job).await.is_none()
            }
        }
    }

    /// Poll a peer-owned generation until it settles or the deadline passes.
    async fn await_peer(
        &self,
        run: &SessionRun,
        page: u32,
        generation_id: &str,
        already_local: bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.generation_timeout;
        loop {
            match self.cache.get_status(generation_id) {
                Some(record) if record.state == GenerationState::Ready => {
                    self.adopt_ready(run, page, &record, already_local);
                    return false;
                }
                Some(record) if record.state == GenerationState::Failed => {
                    if !already_local {
                        self.quota.refund(&run.user_id, Bucket::AutoExplain, 1);
                    }
                    return true;
                }
                Some(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                _ => {
                    if !already_local {
                        self.quota.refund(&run.user_id, Bucket::AutoExplain, 1);
                    }
                    return true;
                }
            }
        }
    }

    /// Copy a ready record's stickers into the session user's collection.
    fn adopt_ready(
        &self,
        run: &SessionRun,
        page: u32,
        record: &GenerationRecord,
        already_local: bool,
    ) {
        if !already_local {
            let copies = project_stickers(record, &run.user_id, &run.course_id, &run.file.id);
            self.store.insert_stickers(&copies);
        }
        self.cache.record_latency_sample(
            run.file.content_hash.as_deref(),
            page,
            run.locale,
            EffectiveMode::TextOnly,
            0,
            true,
        );
    }

    fn record_page(&self, run: &SessionRun, page: u32, failed: bool) {
        let updated = self.sessions.mark_page_done(&run.session_id, page, failed);
        if let (Some(callback), Some(session)) = (&self.progress, updated) {
            callback(SessionProgress {
                session_id: run.session_id.clone(),
                page,
                failed,
                completed_in_window: session
                    .pages_completed
                    .iter()
                    .filter(|p| **p >= session.window_start && **p <= session.window_end)
                    .count() as u32,
                window_pages: session.window_pages(),
                state: session.state,
            });
        }
    }

    fn session_kind(&self, session_id: &str) -> PdfKind {
        self.sessions
            .get(session_id)
            .map(|s| s.pdf_kind)
            .unwrap_or(PdfKind::Text)
    }

    /// Close out a session whose window is fully covered.
    fn finish_if_covered(&self, session_id: &str) {
        self.store.with_session(session_id, |s| {
            if s.state == SessionState::Active && s.pages_in_progress.is_empty() {
                let all_covered = (s.window_start..=s.window_end)
                    .all(|p| s.pages_completed.contains(&p) || s.pages_failed.contains(&p));
                if all_covered {
                    s.state = SessionState::Completed;
                }
            }
        });
    }
}
