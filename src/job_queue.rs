//! Lease-based claim queue for context extraction jobs.
//!
//! One logical table with a uniqueness rule: at most one non-terminal job
//! per pdf-hash. Workers claim with a five-minute lease; a crashed worker's
//! job becomes claimable again when its lease lapses. Transient failures
//! reschedule with a fixed backoff ladder, then the job fails terminally.

use crate::config::AppConfig;
use crate::store::MemoryStore;
use crate::types::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Backoff before retries 1..=3.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(240),
];

pub struct ContextJobQueue {
    store: Arc<MemoryStore>,
    lease: Duration,
    max_retries: u32,
    extraction_version: u32,
}

impl ContextJobQueue {
    pub fn new(store: Arc<MemoryStore>, config: &AppConfig) -> Self {
        Self {
            store,
            lease: config.job_lease,
            max_retries: config.job_max_retries,
            extraction_version: config.extraction_version,
        }
    }

    /// Accept a new pending job unless the hash already has entries or an
    /// open job. Returns the accepted job.
    pub fn enqueue(
        &self,
        pdf_hash: &str,
        file_id: &str,
        user_id: &str,
        total_pages: u32,
    ) -> Option<ContextJob> {
        let now = now_ms();
        let job = ContextJob {
            id: uuid::Uuid::new_v4().to_string(),
            pdf_hash: pdf_hash.to_string(),
            file_id: file_id.to_string(),
            user_id: user_id.to_string(),
            state: JobState::Pending,
            total_pages,
            estimated_total_words: 0,
            processed_pages: 0,
            processed_words: 0,
            current_batch: 0,
            total_batches: 0,
            extraction_version: self.extraction_version,
            retry_count: 0,
            last_error: None,
            lease_holder: None,
            lease_expires_at_ms: None,
            run_after_ms: now,
            created_at_ms: now,
            updated_at_ms: now,
        };
        let accepted = self.store.enqueue_job(job);
        if let Some(ref job) = accepted {
            info!("context job {} enqueued for hash {}", job.id, pdf_hash);
        }
        accepted
    }

    /// Claim one runnable job under a fresh lease.
    pub fn claim(&self, worker_id: &str) -> Option<ContextJob> {
        let job = self.store.claim_next_job(worker_id, self.lease)?;
        info!(
            "worker {} claimed job {} (batch {}/{})",
            worker_id, job.id, job.current_batch, job.total_batches
        );
        Some(job)
    }

    /// Extend the lease mid-job; long documents outlive a single lease.
    pub fn heartbeat(&self, job_id: &str, worker_id: &str) {
        let lease_ms = self.lease.as_millis() as i64;
        self.store.with_job(job_id, |job| {
            if job.lease_holder.as_deref() == Some(worker_id) {
                job.lease_expires_at_ms = Some(now_ms() + lease_ms);
            }
        });
    }

    pub fn complete(&self, job_id: &str) -> Option<ContextJob> {
        self.store.with_job(job_id, |job| {
            job.state = JobState::Completed;
            job.lease_holder = None;
            job.lease_expires_at_ms = None;
            job.clone()
        })
    }

    /// Report a transient failure: reschedule with backoff while the retry
    /// budget lasts, otherwise fail terminally. Checkpoint fields are left
    /// untouched so a retry resumes mid-document.
    pub fn fail(&self, job_id: &str, error: &str) -> Option<ContextJob> {
        let max_retries = self.max_retries;
        let updated = self.store.with_job(job_id, |job| {
            job.retry_count += 1;
            job.last_error = Some(error.to_string());
            job.lease_holder = None;
            job.lease_expires_at_ms = None;
            if job.retry_count > max_retries {
                job.state = JobState::Failed;
            } else {
                let backoff = RETRY_BACKOFF
                    [(job.retry_count as usize - 1).min(RETRY_BACKOFF.len() - 1)];
                job.state = JobState::Pending;
                job.run_after_ms = now_ms() + backoff.as_millis() as i64;
            }
            job.clone()
        });
        if let Some(ref job) = updated {
            match job.state {
                JobState::Failed => warn!("job {} failed terminally: {}", job_id, error),
                _ => warn!(
                    "job {} rescheduled (retry {}/{}): {}",
                    job_id, job.retry_count, max_retries, error
                ),
            }
        }
        updated
    }

    /// Immediate terminal failure (validation, quota).
    pub fn fail_terminal(&self, job_id: &str, error: &str) -> Option<ContextJob> {
        warn!("job {} failed terminally: {}", job_id, error);
        self.store.with_job(job_id, |job| {
            job.last_error = Some(error.to_string());
            job.state = JobState::Failed;
            job.lease_holder = None;
            job.lease_expires_at_ms = None;
            job.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (Arc<MemoryStore>, ContextJobQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = ContextJobQueue::new(store.clone(), &AppConfig::default());
        (store, queue)
    }

    #[test]
    fn enqueue_once_per_hash() {
        let (_, queue) = queue();
        assert!(queue.enqueue("hash-a", "file-1", "user-1", 30).is_some());
        assert!(queue.enqueue("hash-a", "file-2", "user-2", 30).is_none());
        // A different hash is its own queue row
        assert!(queue.enqueue("hash-b", "file-3", "user-1", 10).is_some());
    }

    #[test]
    fn retries_follow_backoff_then_fail() {
        let (_, queue) = queue();
        let job = queue.enqueue("hash-a", "file-1", "user-1", 30).unwrap();

        for retry in 1..=3u32 {
            queue.claim("worker-a").unwrap();
            let failed = queue.fail(&job.id, "provider 503").unwrap();
            assert_eq!(failed.state, JobState::Pending);
            assert_eq!(failed.retry_count, retry);
            assert!(failed.run_after_ms > now_ms());
            // Not claimable until run_after passes
            assert!(queue.claim("worker-a").is_none());
            // Simulate the backoff elapsing
            queue.store.with_job(&job.id, |j| j.run_after_ms = now_ms() - 1);
        }

        queue.claim("worker-a").unwrap();
        let dead = queue.fail(&job.id, "provider 503").unwrap();
        assert_eq!(dead.state, JobState::Failed);
        assert_eq!(dead.retry_count, 4);
    }

    #[test]
    fn failure_preserves_checkpoint() {
        let (store, queue) = queue();
        let job = queue.enqueue("hash-a", "file-1", "user-1", 30).unwrap();
        queue.claim("worker-a").unwrap();
        store.commit_batch(&job.id, vec![], 12, 4800, 1);

        let failed = queue.fail(&job.id, "provider 503").unwrap();
        assert_eq!(failed.processed_pages, 12);
        assert_eq!(failed.processed_words, 4800);
        assert_eq!(failed.current_batch, 1);
    }

    #[test]
    fn completed_job_clears_lease() {
        let (_, queue) = queue();
        let job = queue.enqueue("hash-a", "file-1", "user-1", 30).unwrap();
        queue.claim("worker-a").unwrap();

        let done = queue.complete(&job.id).unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert!(done.lease_holder.is_none());
        // Terminal hash frees the uniqueness slot for a future re-extraction
        assert!(queue.enqueue("hash-a", "file-1", "user-1", 30).is_some());
    }
}
