//! Single-node store backing every coordination table.
//!
//! Each public method takes the table lock once, mutates, and releases:
//! the in-process equivalent of one bounded database transaction. Row-level
//! uniqueness (fingerprint keys, entry titles, non-terminal job hashes,
//! active sessions) is enforced inside those critical sections, so callers
//! get the same mutual exclusion a relational unique constraint would give.

use crate::fingerprint::normalize_title;
use crate::types::*;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// Outcome of a generation claim: exactly one concurrent caller per
/// fingerprint observes `started == true`.
#[derive(Debug, Clone)]
pub struct TryStart {
    pub started: bool,
    pub generation_id: String,
}

/// Outcome of a context-entry upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryUpsert {
    Inserted,
    Replaced,
    Kept,
}

#[derive(Default)]
struct Tables {
    files: HashMap<String, FileRecord>,
    stickers: HashMap<String, Sticker>,
    generations: HashMap<String, GenerationRecord>,
    /// fingerprint key -> most recent generation id
    fingerprints: HashMap<String, String>,
    sessions: HashMap<String, WindowSession>,
    /// (user_id, file_id) -> active session id
    active_sessions: HashMap<(String, String), String>,
    entries: HashMap<String, ContextEntry>,
    /// (pdf_hash, normalized title) -> entry id
    entry_titles: HashMap<(String, String), String>,
    jobs: HashMap<String, ContextJob>,
    scopes: Vec<UserScope>,
    latency_samples: Vec<LatencySample>,
    share_disabled: HashSet<String>,
}

/// The process-wide store. Cheap to share via `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Files ────────────────────────────────────────────────────────────

    pub fn upsert_file(&self, file: FileRecord) {
        self.inner.lock().files.insert(file.id.clone(), file);
    }

    pub fn file(&self, id: &str) -> Option<FileRecord> {
        self.inner.lock().files.get(id).cloned()
    }

    /// Content hashes are immutable once set.
    pub fn set_content_hash(&self, id: &str, hash: String) -> bool {
        let mut tables = self.inner.lock();
        match tables.files.get_mut(id) {
            Some(file) if file.content_hash.is_none() => {
                file.content_hash = Some(hash);
                true
            }
            _ => false,
        }
    }

    // ── Stickers ─────────────────────────────────────────────────────────

    pub fn insert_stickers(&self, stickers: &[Sticker]) {
        let mut tables = self.inner.lock();
        for sticker in stickers {
            tables.stickers.insert(sticker.id.clone(), sticker.clone());
        }
    }

    pub fn sticker(&self, id: &str) -> Option<Sticker> {
        self.inner.lock().stickers.get(id).cloned()
    }

    pub fn stickers_for_page(&self, user_id: &str, file_id: &str, page: u32) -> Vec<Sticker> {
        let tables = self.inner.lock();
        let mut found: Vec<Sticker> = tables
            .stickers
            .values()
            .filter(|s| s.user_id == user_id && s.file_id == file_id && s.page == page)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at_ms);
        found
    }

    pub fn has_auto_stickers(&self, user_id: &str, file_id: &str, page: u32) -> bool {
        self.inner.lock().stickers.values().any(|s| {
            s.user_id == user_id
                && s.file_id == file_id
                && s.page == page
                && s.kind == StickerKind::Auto
        })
    }

    /// Atomic read-modify-write on one sticker.
    pub fn with_sticker<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Sticker) -> R,
    ) -> Option<R> {
        let mut tables = self.inner.lock();
        tables.stickers.get_mut(id).map(f)
    }

    // ── Generation records ───────────────────────────────────────────────

    /// Insert-or-read-back over the fingerprint uniqueness key. A fresh
    /// record is installed only when the key is absent or its current
    /// record already failed; every other caller reads the extant id.
    pub fn try_start_generation(&self, key: &str, record: GenerationRecord) -> TryStart {
        let mut tables = self.inner.lock();
        if let Some(existing_id) = tables.fingerprints.get(key) {
            if let Some(existing) = tables.generations.get(existing_id) {
                if existing.state != GenerationState::Failed {
                    return TryStart {
                        started: false,
                        generation_id: existing_id.clone(),
                    };
                }
            }
        }
        let id = record.id.clone();
        tables.fingerprints.insert(key.to_string(), id.clone());
        tables.generations.insert(id.clone(), record);
        debug!("claimed generation {} for fingerprint {}", id, key);
        TryStart { started: true, generation_id: id }
    }

    pub fn generation(&self, id: &str) -> Option<GenerationRecord> {
        self.inner.lock().generations.get(id).cloned()
    }

    pub fn generation_for_key(&self, key: &str) -> Option<GenerationRecord> {
        let tables = self.inner.lock();
        let id = tables.fingerprints.get(key)?;
        tables.generations.get(id).cloned()
    }

    /// generating -> ready. Terminal states never revert, so a second
    /// completion (or a completion racing a failure) is a no-op.
    pub fn complete_generation(
        &self,
        id: &str,
        stickers: Vec<Sticker>,
        latency_ms: u64,
    ) -> Option<GenerationRecord> {
        let mut tables = self.inner.lock();
        let record = tables.generations.get_mut(id)?;
        if record.state != GenerationState::Generating {
            return None;
        }
        record.state = GenerationState::Ready;
        record.stickers = stickers;
        record.completed_at_ms = Some(now_ms());
        record.latency_ms = Some(latency_ms);
        Some(record.clone())
    }

    /// generating -> failed. Returns the record so the caller can refund
    /// the reserved quota units.
    pub fn fail_generation(&self, id: &str, error: String) -> Option<GenerationRecord> {
        let mut tables = self.inner.lock();
        let record = tables.generations.get_mut(id)?;
        if record.state != GenerationState::Generating {
            return None;
        }
        record.state = GenerationState::Failed;
        record.error = Some(error);
        record.completed_at_ms = Some(now_ms());
        Some(record.clone())
    }

    // ── Window sessions ──────────────────────────────────────────────────

    /// At most one active session per (user, file). Returns the existing
    /// session id on conflict.
    pub fn create_session(&self, session: WindowSession) -> Result<WindowSession, String> {
        let mut tables = self.inner.lock();
        let owner = (session.user_id.clone(), session.file_id.clone());
        if let Some(existing_id) = tables.active_sessions.get(&owner) {
            if let Some(existing) = tables.sessions.get(existing_id) {
                if existing.state == SessionState::Active {
                    return Err(existing_id.clone());
                }
            }
        }
        tables.active_sessions.insert(owner, session.id.clone());
        tables.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub fn session(&self, id: &str) -> Option<WindowSession> {
        self.inner.lock().sessions.get(id).cloned()
    }

    /// Atomic read-modify-write on one session. The active-session index is
    /// maintained here: a session leaving `active` releases its owner slot.
    pub fn with_session<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut WindowSession) -> R,
    ) -> Option<R> {
        let mut tables = self.inner.lock();
        let session = tables.sessions.get_mut(id)?;
        let result = f(session);
        session.updated_at_ms = now_ms();
        if session.state.is_terminal() {
            let owner = (session.user_id.clone(), session.file_id.clone());
            if tables.active_sessions.get(&owner).map(|s| s.as_str()) == Some(id) {
                tables.active_sessions.remove(&owner);
            }
        }
        Some(result)
    }

    // ── Context entries ──────────────────────────────────────────────────

    /// Insert-or-replace under the (pdf-hash, normalized-title) uniqueness
    /// key. Replacement needs a strictly higher quality score; at equal
    /// score an English entry displaces a translated one, otherwise the
    /// earlier entry stays.
    pub fn upsert_entry(&self, entry: ContextEntry) -> EntryUpsert {
        let mut tables = self.inner.lock();
        Self::upsert_entry_locked(&mut tables, entry)
    }

    fn upsert_entry_locked(tables: &mut Tables, entry: ContextEntry) -> EntryUpsert {
        let key = (entry.pdf_hash.clone(), normalize_title(&entry.title));
        match tables.entry_titles.get(&key) {
            Some(existing_id) => {
                let existing_id = existing_id.clone();
                let replace = match tables.entries.get(&existing_id) {
                    Some(existing) => {
                        entry.quality_score > existing.quality_score
                            || (entry.quality_score == existing.quality_score
                                && entry.language == "en"
                                && existing.language != "en")
                    }
                    None => true,
                };
                if replace {
                    tables.entries.remove(&existing_id);
                    tables.entry_titles.insert(key, entry.id.clone());
                    tables.entries.insert(entry.id.clone(), entry);
                    EntryUpsert::Replaced
                } else {
                    EntryUpsert::Kept
                }
            }
            None => {
                tables.entry_titles.insert(key, entry.id.clone());
                tables.entries.insert(entry.id.clone(), entry);
                EntryUpsert::Inserted
            }
        }
    }

    pub fn entries_for_hashes(&self, hashes: &[String]) -> Vec<ContextEntry> {
        let tables = self.inner.lock();
        let wanted: HashSet<&str> = hashes.iter().map(|h| h.as_str()).collect();
        tables
            .entries
            .values()
            .filter(|e| wanted.contains(e.pdf_hash.as_str()))
            .cloned()
            .collect()
    }

    pub fn entry_count_for_hash(&self, pdf_hash: &str) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.pdf_hash == pdf_hash)
            .count()
    }

    /// One batch commits atomically: entry upserts and the job checkpoint
    /// land in the same critical section, so a retry after a crash resumes
    /// from a consistent batch boundary.
    pub fn commit_batch(
        &self,
        job_id: &str,
        entries: Vec<ContextEntry>,
        processed_pages: u32,
        processed_words: u64,
        current_batch: u32,
    ) -> usize {
        let mut tables = self.inner.lock();
        let mut stored = 0;
        for entry in entries {
            if Self::upsert_entry_locked(&mut tables, entry) != EntryUpsert::Kept {
                stored += 1;
            }
        }
        if let Some(job) = tables.jobs.get_mut(job_id) {
            job.processed_pages = processed_pages;
            job.processed_words = processed_words;
            job.current_batch = current_batch;
            job.updated_at_ms = now_ms();
        }
        stored
    }

    // ── Context jobs ─────────────────────────────────────────────────────

    /// Accepts the job only when the hash has no entries yet and no
    /// non-terminal job exists for it.
    pub fn enqueue_job(&self, job: ContextJob) -> Option<ContextJob> {
        let mut tables = self.inner.lock();
        let has_entries = tables.entries.values().any(|e| e.pdf_hash == job.pdf_hash);
        if has_entries {
            return None;
        }
        let has_open_job = tables
            .jobs
            .values()
            .any(|j| j.pdf_hash == job.pdf_hash && !j.state.is_terminal());
        if has_open_job {
            return None;
        }
        tables.jobs.insert(job.id.clone(), job.clone());
        Some(job)
    }

    /// Claim one runnable job: pending with `run_after` passed, or
    /// processing with an expired lease (dead worker). The fresh lease is
    /// written in the same critical section, so peers skip the row.
    pub fn claim_next_job(&self, worker_id: &str, lease: Duration) -> Option<ContextJob> {
        let now = now_ms();
        let lease_ms = lease.as_millis() as i64;
        let mut tables = self.inner.lock();
        let candidate_id = tables
            .jobs
            .values()
            .filter(|j| match j.state {
                JobState::Pending => j.run_after_ms <= now,
                JobState::Processing => {
                    j.lease_expires_at_ms.map(|t| t < now).unwrap_or(true)
                }
                _ => false,
            })
            .min_by_key(|j| j.created_at_ms)
            .map(|j| j.id.clone())?;
        let job = tables.jobs.get_mut(&candidate_id)?;
        job.state = JobState::Processing;
        job.lease_holder = Some(worker_id.to_string());
        job.lease_expires_at_ms = Some(now + lease_ms);
        job.updated_at_ms = now;
        Some(job.clone())
    }

    pub fn job(&self, id: &str) -> Option<ContextJob> {
        self.inner.lock().jobs.get(id).cloned()
    }

    pub fn job_for_hash(&self, pdf_hash: &str) -> Option<ContextJob> {
        self.inner
            .lock()
            .jobs
            .values()
            .find(|j| j.pdf_hash == pdf_hash)
            .cloned()
    }

    pub fn with_job<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ContextJob) -> R,
    ) -> Option<R> {
        let mut tables = self.inner.lock();
        let job = tables.jobs.get_mut(id)?;
        let result = f(job);
        job.updated_at_ms = now_ms();
        Some(result)
    }

    // ── User context scope ───────────────────────────────────────────────

    pub fn ensure_scope(&self, scope: UserScope) {
        let mut tables = self.inner.lock();
        if !tables.scopes.contains(&scope) {
            tables.scopes.push(scope);
        }
    }

    pub fn scope_hashes(&self, user_id: &str, course_id: &str) -> Vec<String> {
        let tables = self.inner.lock();
        let mut hashes: Vec<String> = tables
            .scopes
            .iter()
            .filter(|s| s.user_id == user_id && s.course_id == course_id)
            .map(|s| s.pdf_hash.clone())
            .collect();
        hashes.sort();
        hashes.dedup();
        hashes
    }

    /// Visibility check for shared generation records.
    pub fn user_can_read_hash(&self, user_id: &str, pdf_hash: &str) -> bool {
        self.inner
            .lock()
            .scopes
            .iter()
            .any(|s| s.user_id == user_id && s.pdf_hash == pdf_hash)
    }

    // ── Latency samples & share preference ───────────────────────────────

    pub fn record_latency(&self, sample: LatencySample) {
        self.inner.lock().latency_samples.push(sample);
    }

    pub fn latency_sample_count(&self) -> usize {
        self.inner.lock().latency_samples.len()
    }

    pub fn set_share_enabled(&self, user_id: &str, enabled: bool) {
        let mut tables = self.inner.lock();
        if enabled {
            tables.share_disabled.remove(user_id);
        } else {
            tables.share_disabled.insert(user_id.to_string());
        }
    }

    pub fn share_enabled(&self, user_id: &str) -> bool {
        !self.inner.lock().share_disabled.contains(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EffectiveMode, Locale};

    fn fingerprint(page: u32) -> Fingerprint {
        Fingerprint {
            pdf_hash: "hash-a".to_string(),
            page,
            locale: Locale::En,
            mode: EffectiveMode::TextOnly,
            selection_hash: None,
        }
    }

    fn record(page: u32) -> GenerationRecord {
        GenerationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            fingerprint: fingerprint(page),
            state: GenerationState::Generating,
            producing_user_id: "user-1".to_string(),
            quota_units: 1,
            images_count: 0,
            selected_regions: vec![],
            started_at_ms: now_ms(),
            completed_at_ms: None,
            error: None,
            stickers: vec![],
            latency_ms: None,
        }
    }

    fn entry(pdf_hash: &str, title: &str, quality: f64, language: &str) -> ContextEntry {
        ContextEntry {
            id: uuid::Uuid::new_v4().to_string(),
            pdf_hash: pdf_hash.to_string(),
            kind: EntryKind::Definition,
            title: title.to_string(),
            body: "body".to_string(),
            source_page: 1,
            keywords: vec!["calculus".to_string()],
            quality_score: quality,
            language: language.to_string(),
            extraction_version: 1,
            created_at_ms: now_ms(),
        }
    }

    #[test]
    fn try_start_claims_once() {
        let store = MemoryStore::new();
        let key = fingerprint(5).key();

        let first = store.try_start_generation(&key, record(5));
        let second = store.try_start_generation(&key, record(5));

        assert!(first.started);
        assert!(!second.started);
        assert_eq!(first.generation_id, second.generation_id);
    }

    #[test]
    fn try_start_reclaims_after_failure() {
        let store = MemoryStore::new();
        let key = fingerprint(5).key();

        let first = store.try_start_generation(&key, record(5));
        store.fail_generation(&first.generation_id, "ai-error".to_string());

        let second = store.try_start_generation(&key, record(5));
        assert!(second.started);
        assert_ne!(first.generation_id, second.generation_id);
    }

    #[test]
    fn terminal_generation_states_never_revert() {
        let store = MemoryStore::new();
        let key = fingerprint(1).key();
        let claim = store.try_start_generation(&key, record(1));

        assert!(store
            .complete_generation(&claim.generation_id, vec![], 100)
            .is_some());
        // Second completion and late failure are both rejected
        assert!(store
            .complete_generation(&claim.generation_id, vec![], 100)
            .is_none());
        assert!(store
            .fail_generation(&claim.generation_id, "late".to_string())
            .is_none());
        let state = store.generation(&claim.generation_id).map(|r| r.state);
        assert_eq!(state, Some(GenerationState::Ready));
    }

    #[test]
    fn entry_upsert_keeps_highest_quality() {
        let store = MemoryStore::new();
        assert_eq!(
            store.upsert_entry(entry("h", "Derivative", 0.85, "en")),
            EntryUpsert::Inserted
        );
        assert_eq!(
            store.upsert_entry(entry("h", "derivative", 0.92, "en")),
            EntryUpsert::Replaced
        );
        assert_eq!(
            store.upsert_entry(entry("h", "DERIVATIVE", 0.92, "en")),
            EntryUpsert::Kept
        );

        let entries = store.entries_for_hashes(&["h".to_string()]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].quality_score, 0.92);
    }

    #[test]
    fn entry_upsert_prefers_english_at_equal_score() {
        let store = MemoryStore::new();
        store.upsert_entry(entry("h", "limit", 0.8, "zh-Hans"));
        assert_eq!(
            store.upsert_entry(entry("h", "limit", 0.8, "en")),
            EntryUpsert::Replaced
        );
        // English never loses to a translation at equal score
        assert_eq!(
            store.upsert_entry(entry("h", "limit", 0.8, "zh-Hans")),
            EntryUpsert::Kept
        );
    }

    #[test]
    fn job_claim_is_exclusive_until_lease_expires() {
        let store = MemoryStore::new();
        let job = ContextJob {
            id: "job-1".to_string(),
            pdf_hash: "hash-a".to_string(),
            file_id: "file-1".to_string(),
            user_id: "user-1".to_string(),
            state: JobState::Pending,
            total_pages: 30,
            estimated_total_words: 9000,
            processed_pages: 0,
            processed_words: 0,
            current_batch: 0,
            total_batches: 3,
            extraction_version: 1,
            retry_count: 0,
            last_error: None,
            lease_holder: None,
            lease_expires_at_ms: None,
            run_after_ms: 0,
            created_at_ms: now_ms(),
            updated_at_ms: now_ms(),
        };
        store.enqueue_job(job);

        let claimed = store.claim_next_job("worker-a", Duration::from_secs(300));
        assert!(claimed.is_some());
        // Peer sees nothing while the lease is live
        assert!(store.claim_next_job("worker-b", Duration::from_secs(300)).is_none());
    }

    #[test]
    fn enqueue_rejects_duplicate_hash() {
        let store = MemoryStore::new();
        let mk = |id: &str| ContextJob {
            id: id.to_string(),
            pdf_hash: "hash-a".to_string(),
            file_id: "file-1".to_string(),
            user_id: "user-1".to_string(),
            state: JobState::Pending,
            total_pages: 10,
            estimated_total_words: 4000,
            processed_pages: 0,
            processed_words: 0,
            current_batch: 0,
            total_batches: 1,
            extraction_version: 1,
            retry_count: 0,
            last_error: None,
            lease_holder: None,
            lease_expires_at_ms: None,
            run_after_ms: 0,
            created_at_ms: now_ms(),
            updated_at_ms: now_ms(),
        };
        assert!(store.enqueue_job(mk("job-1")).is_some());
        assert!(store.enqueue_job(mk("job-2")).is_none());
    }

    #[test]
    fn one_active_session_per_user_file() {
        let store = MemoryStore::new();
        let session = WindowSession {
            id: "sess-1".to_string(),
            user_id: "user-1".to_string(),
            file_id: "file-1".to_string(),
            pdf_kind: PdfKind::Text,
            locale: Locale::En,
            state: SessionState::Active,
            window_start: 10,
            window_end: 17,
            current_page: 10,
            total_pages: 100,
            pages_completed: Default::default(),
            pages_in_progress: Default::default(),
            pages_failed: Default::default(),
            created_at_ms: now_ms(),
            updated_at_ms: now_ms(),
        };
        assert!(store.create_session(session.clone()).is_ok());

        let mut dup = session.clone();
        dup.id = "sess-2".to_string();
        assert_eq!(
            store.create_session(dup.clone()).err(),
            Some("sess-1".to_string())
        );

        // Terminal transition releases the owner slot
        store.with_session("sess-1", |s| s.state = SessionState::Canceled);
        assert!(store.create_session(dup).is_ok());
    }
}
