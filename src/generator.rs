//! Sticker generation: resolve -> extract -> prompt -> call -> parse -> persist.
//!
//! `run` never propagates an error to its caller. Success completes the
//! generation record; every failure terminal-fails it (which refunds the
//! reserved quota) and pollers observe the failed state.

use crate::ai_client::{ChatProvider, ChatRequest, ImageAttachment};
use crate::config::AppConfig;
use crate::error::{ApiError, GenerateFailure};
use crate::fingerprint::region_anchor_id;
use crate::pdf::{FileFetcher, PageTextSource};
use crate::prompts::{
    context_hint, page_user_prompt, parse_sticker_pairs, selected_images_prompt, tutor_persona,
};
use crate::quota::{Bucket, QuotaService};
use crate::retrieval::{ContextRetriever, RetrievalRequest};
use crate::sticker_cache::{ImageRegionCapture, StickerCache};
use crate::store::MemoryStore;
use crate::types::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const STICKER_TEMPERATURE: f32 = 0.7;
const STICKER_MAX_TOKENS: u32 = 4000;

/// Everything one generation needs, resolved by the caller up front.
#[derive(Clone)]
pub struct GenerateJob {
    pub generation_id: String,
    pub user_id: String,
    pub course_id: String,
    pub file: FileRecord,
    pub page: u32,
    pub pdf_kind: PdfKind,
    pub locale: Locale,
    pub mode: EffectiveMode,
    pub images: Vec<ImageRegionCapture>,
    pub question: Option<String>,
    /// Bytes already in hand (window mode reuses one download).
    pub file_bytes: Option<Arc<Vec<u8>>>,
}

pub struct StickerGenerator {
    store: Arc<MemoryStore>,
    cache: Arc<StickerCache>,
    quota: Arc<QuotaService>,
    retriever: Option<Arc<ContextRetriever>>,
    provider: Arc<dyn ChatProvider>,
    fetcher: Arc<dyn FileFetcher>,
    text_source: Arc<dyn PageTextSource>,
    config: AppConfig,
}

impl StickerGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MemoryStore>,
        cache: Arc<StickerCache>,
        quota: Arc<QuotaService>,
        retriever: Option<Arc<ContextRetriever>>,
        provider: Arc<dyn ChatProvider>,
        fetcher: Arc<dyn FileFetcher>,
        text_source: Arc<dyn PageTextSource>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            cache,
            quota,
            retriever,
            provider,
            fetcher,
            text_source,
            config,
        }
    }

    /// Run one claimed generation to a terminal state. Returns the ready
    /// record on success, `None` after a recorded failure.
    pub async fn run(&self, job: GenerateJob) -> Option<GenerationRecord> {
        let start = Instant::now();
        match self.execute(&job).await {
            Ok(stickers) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                self.store.insert_stickers(&stickers);
                let record = self
                    .cache
                    .complete(&job.generation_id, stickers, latency_ms);
                self.cache.record_latency_sample(
                    job.file.content_hash.as_deref(),
                    job.page,
                    job.locale,
                    job.mode,
                    latency_ms,
                    false,
                );
                info!(
                    "generation {} ready in {}ms (page {})",
                    job.generation_id, latency_ms, job.page
                );
                record
            }
            Err(failure) => {
                warn!("generation {} failed: {}", job.generation_id, failure);
                self.cache
                    .fail(&job.generation_id, format!("{}: {}", failure.kind(), failure));
                None
            }
        }
    }

    async fn execute(&self, job: &GenerateJob) -> Result<Vec<Sticker>, GenerateFailure> {
        // 1. File bytes and page text
        let bytes: Arc<Vec<u8>> = match &job.file_bytes {
            Some(bytes) => bytes.clone(),
            None => Arc::new(
                self.fetcher
                    .fetch(&job.file.storage_key)
                    .await
                    .map_err(|e| GenerateFailure::Storage(format!("{:#}", e)))?,
            ),
        };
        let page_text = self
            .text_source
            .page_text(&bytes, job.page)
            .await
            .map_err(|e| GenerateFailure::Extraction(format!("{:#}", e)))?;

        // Slide decks legitimately carry near-empty pages; only running
        // text enforces the minimum.
        let chars = page_text.chars().count();
        if job.pdf_kind == PdfKind::Text && chars < self.config.min_page_text_chars {
            return Err(GenerateFailure::InsufficientText { page: job.page, chars });
        }

        // 2. Context hint, best effort
        let mut system = tutor_persona(job.locale).to_string();
        if let Some(retriever) = &self.retriever {
            let retrieved = retriever
                .retrieve_for_page(&RetrievalRequest {
                    user_id: job.user_id.clone(),
                    course_id: job.course_id.clone(),
                    current_pdf_hash: job.file.content_hash.clone(),
                    page_text: Some(page_text.clone()),
                    question: job.question.clone(),
                })
                .await;
            if let Some(hint) = context_hint(&retrieved.entries) {
                system.push_str(&hint);
            }
        }

        // 3. User prompt
        let user = match job.mode {
            EffectiveMode::TextOnly => page_user_prompt(
                &page_text,
                job.page,
                job.file.page_count,
                job.pdf_kind,
                job.question.as_deref(),
            ),
            EffectiveMode::WithSelectedImages => {
                selected_images_prompt(&page_text, job.page, job.images.len())
            }
        };

        // 4. AI call under the generation deadline
        let request = ChatRequest {
            system,
            user,
            images: job
                .images
                .iter()
                .map(|capture| ImageAttachment {
                    region: capture.region,
                    jpeg_bytes: capture.jpeg_bytes.clone(),
                })
                .collect(),
            temperature: STICKER_TEMPERATURE,
            max_tokens: STICKER_MAX_TOKENS,
            json_mode: false,
        };
        let response = tokio::time::timeout(self.config.generation_timeout, self.provider.chat(&request))
            .await
            .map_err(|_| GenerateFailure::Timeout {
                secs: self.config.generation_timeout.as_secs(),
            })?
            .map_err(|e| GenerateFailure::AiError(format!("{:#}", e)))?;

        // 5. Parse
        let pairs = parse_sticker_pairs(&response.content);
        if pairs.is_empty() {
            return Err(GenerateFailure::AiError(
                "empty or unparseable response".to_string(),
            ));
        }

        // 6. Materialize stickers
        let stickers = pairs
            .into_iter()
            .map(|pair| {
                let anchor = match job.mode {
                    EffectiveMode::WithSelectedImages => multi_anchor(&pair.anchor_text, &job.images),
                    EffectiveMode::TextOnly => match job.pdf_kind {
                        PdfKind::Ppt => StickerAnchor::full_page(pair.anchor_text),
                        PdfKind::Text => StickerAnchor::text(pair.anchor_text),
                    },
                };
                Sticker::auto(
                    &job.user_id,
                    &job.course_id,
                    &job.file.id,
                    job.page,
                    anchor,
                    pair.explanation,
                )
            })
            .collect();
        Ok(stickers)
    }

    // ── Sticker versions ─────────────────────────────────────────────────

    /// Regenerate the body of one sticker and append it as a new active
    /// version. Charged to the learning-interactions bucket.
    pub async fn refresh_sticker(&self, user_id: &str, sticker_id: &str) -> Result<Sticker, ApiError> {
        let sticker = self
            .store
            .sticker(sticker_id)
            .filter(|s| s.user_id == user_id)
            .ok_or(ApiError::NotFound)?;
        let file = self.store.file(&sticker.file_id).ok_or(ApiError::NotFound)?;

        self.quota
            .deduct(user_id, Bucket::LearningInteractions, 1)
            .map_err(|snapshot| ApiError::QuotaExceeded {
                bucket: Bucket::LearningInteractions.name().to_string(),
                snapshot,
            })?;

        let body = match self.regenerate_body(&sticker, &file).await {
            Ok(body) => body,
            Err(e) => {
                self.quota.refund(user_id, Bucket::LearningInteractions, 1);
                return Err(ApiError::Internal(format!("refresh failed: {}", e)));
            }
        };

        let now = now_ms();
        self.store
            .with_sticker(sticker_id, |s| {
                s.versions.push(StickerVersion {
                    content_markdown: body.clone(),
                    created_at_ms: now,
                });
                s.active_version = s.versions.len() - 1;
                s.content_markdown = body.clone();
                s.clone()
            })
            .ok_or(ApiError::NotFound)
    }

    async fn regenerate_body(
        &self,
        sticker: &Sticker,
        file: &FileRecord,
    ) -> Result<String, GenerateFailure> {
        let bytes = self
            .fetcher
            .fetch(&file.storage_key)
            .await
            .map_err(|e| GenerateFailure::Storage(format!("{:#}", e)))?;
        let page_text = self
            .text_source
            .page_text(&bytes, sticker.page)
            .await
            .map_err(|e| GenerateFailure::Extraction(format!("{:#}", e)))?;

        let request = ChatRequest {
            system: tutor_persona(Locale::En).to_string(),
            user: format!(
                "Write a fresh explanation for the highlighted phrase \
\"{}\" on page {}. Respond with a JSON array containing one object with keys \
\"anchorText\" and \"explanation\".\n\nPage text:\n{}",
                sticker.anchor.text_snippet, sticker.page, page_text
            ),
            images: vec![],
            temperature: STICKER_TEMPERATURE,
            max_tokens: STICKER_MAX_TOKENS,
            json_mode: false,
        };
        let response = tokio::time::timeout(self.config.generation_timeout, self.provider.chat(&request))
            .await
            .map_err(|_| GenerateFailure::Timeout {
                secs: self.config.generation_timeout.as_secs(),
            })?
            .map_err(|e| GenerateFailure::AiError(format!("{:#}", e)))?;

        parse_sticker_pairs(&response.content)
            .into_iter()
            .next()
            .map(|pair| pair.explanation)
            .ok_or_else(|| GenerateFailure::AiError("empty refresh response".to_string()))
    }
}

/// One text anchor plus an image anchor per selected region, ids in the
/// stable `page-x-y-w-h` form.
fn multi_anchor(anchor_text: &str, images: &[ImageRegionCapture]) -> StickerAnchor {
    let mut parts = vec![AnchorPart::Text {
        snippet: anchor_text.to_string(),
    }];
    for capture in images {
        parts.push(AnchorPart::Image {
            id: region_anchor_id(&capture.region),
            page: capture.region.page,
            rect: capture.region.rect,
        });
    }
    StickerAnchor {
        text_snippet: anchor_text.to_string(),
        rect: None,
        is_full_page: None,
        anchors: Some(parts),
    }
}
