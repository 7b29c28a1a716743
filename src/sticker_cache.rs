//! Shared sticker generation cache.
//!
//! Single source of truth for fingerprint -> {ready stickers | in-flight
//! generation id | absent}. Coalescing rests on one uniqueness key: the
//! store's `try_start_generation` inserts or reads back atomically, so
//! exactly one concurrent caller starts real work per fingerprint and the
//! rest poll the same generation id.

use crate::quota::{Bucket, QuotaService};
use crate::store::{MemoryStore, TryStart};
use crate::types::*;
use std::sync::Arc;
use tracing::{info, warn};

/// What a probe observed for a fingerprint.
#[derive(Debug, Clone)]
pub enum ProbeResult {
    Ready { generation: GenerationRecord },
    Generating { generation_id: String },
    NotFound,
}

pub struct StickerCache {
    store: Arc<MemoryStore>,
    quota: Arc<QuotaService>,
}

impl StickerCache {
    pub fn new(store: Arc<MemoryStore>, quota: Arc<QuotaService>) -> Self {
        Self { store, quota }
    }

    /// Whether results for this user may be shared with (and served from)
    /// the cross-user cache.
    pub fn check_user_share_preference(&self, user_id: &str) -> bool {
        self.store.share_enabled(user_id)
    }

    /// Opted-out users still coalesce their own duplicate requests, just
    /// under a key no other user can reach.
    fn cache_key(&self, fingerprint: &Fingerprint, user_id: &str) -> String {
        if self.check_user_share_preference(user_id) {
            fingerprint.key()
        } else {
            format!("{}|user:{}", fingerprint.key(), user_id)
        }
    }

    pub fn probe(&self, fingerprint: &Fingerprint, user_id: &str) -> ProbeResult {
        let key = self.cache_key(fingerprint, user_id);
        match self.store.generation_for_key(&key) {
            Some(record) => match record.state {
                GenerationState::Ready => ProbeResult::Ready { generation: record },
                GenerationState::Generating => ProbeResult::Generating {
                    generation_id: record.id,
                },
                GenerationState::Failed => ProbeResult::NotFound,
            },
            None => ProbeResult::NotFound,
        }
    }

    /// Claim the fingerprint or learn who already holds it.
    pub fn try_start(
        &self,
        fingerprint: &Fingerprint,
        user_id: &str,
        quota_units: u32,
        images: &[ImageRegionCapture],
    ) -> TryStart {
        let record = GenerationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            fingerprint: fingerprint.clone(),
            state: GenerationState::Generating,
            producing_user_id: user_id.to_string(),
            quota_units,
            images_count: images.len() as u32,
            selected_regions: images.iter().map(|i| i.region).collect(),
            started_at_ms: now_ms(),
            completed_at_ms: None,
            error: None,
            stickers: vec![],
            latency_ms: None,
        };
        let key = self.cache_key(fingerprint, user_id);
        let outcome = self.store.try_start_generation(&key, record);
        if outcome.started {
            info!(
                "generation {} started for page {} ({})",
                outcome.generation_id,
                fingerprint.page,
                fingerprint.mode.as_str()
            );
        }
        outcome
    }

    pub fn get_status(&self, generation_id: &str) -> Option<GenerationRecord> {
        self.store.generation(generation_id)
    }

    /// Terminal: generating -> ready with a non-empty sticker list.
    pub fn complete(
        &self,
        generation_id: &str,
        stickers: Vec<Sticker>,
        latency_ms: u64,
    ) -> Option<GenerationRecord> {
        debug_assert!(!stickers.is_empty(), "ready requires stickers");
        self.store.complete_generation(generation_id, stickers, latency_ms)
    }

    /// Terminal: generating -> failed, refunding the units reserved at
    /// start to the producing user.
    pub fn fail(&self, generation_id: &str, reason: String) -> Option<GenerationRecord> {
        let record = self.store.fail_generation(generation_id, reason.clone())?;
        warn!("generation {} failed: {}", generation_id, reason);
        if record.quota_units > 0 {
            self.quota
                .refund(&record.producing_user_id, Bucket::AutoExplain, record.quota_units);
        }
        Some(record)
    }

    pub fn record_latency_sample(
        &self,
        pdf_hash: Option<&str>,
        page: u32,
        locale: Locale,
        mode: EffectiveMode,
        latency_ms: u64,
        cache_hit: bool,
    ) {
        self.store.record_latency(LatencySample {
            pdf_hash: pdf_hash.map(|h| h.to_string()),
            page,
            locale,
            mode,
            latency_ms,
            cache_hit,
            recorded_at_ms: now_ms(),
        });
    }
}

/// A selected region plus its uploaded crop, as captured at try-start.
#[derive(Debug, Clone)]
pub struct ImageRegionCapture {
    pub region: SelectedRegion,
    pub jpeg_bytes: Vec<u8>,
}

/// Project a ready record's canonical stickers into a user's collection.
/// Pure copy: fresh ids, the requester's ownership, identical content. The
/// same content hash can live under different file ids per user, so the
/// target file and course come from the request.
pub fn project_stickers(
    record: &GenerationRecord,
    user_id: &str,
    course_id: &str,
    file_id: &str,
) -> Vec<Sticker> {
    record
        .stickers
        .iter()
        .map(|sticker| {
            let mut copy = sticker.copy_for(user_id);
            copy.course_id = course_id.to_string();
            copy.file_id = file_id.to_string();
            copy
        })
        .collect()
}
