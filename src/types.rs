//! Core type definitions for the Marginalia sticker backend

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::SystemTime;

/// Current wall clock in unix milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Locale a sticker is generated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Locale {
    #[serde(rename = "en")]
    En,
    #[serde(rename = "zh-Hans")]
    ZhHans,
}

impl Locale {
    /// Accepts the wire aliases clients actually send.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "en" => Some(Locale::En),
            "zh" | "zh-Hans" => Some(Locale::ZhHans),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Locale::En => "en",
            Locale::ZhHans => "zh-Hans",
        }
    }
}

/// Whether a generation covers plain page text or user-selected image crops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveMode {
    TextOnly,
    WithSelectedImages,
}

impl EffectiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveMode::TextOnly => "text_only",
            EffectiveMode::WithSelectedImages => "with_selected_images",
        }
    }
}

/// Generation style tag: slide decks get full-page anchors, running text
/// gets paragraph anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdfKind {
    Ppt,
    Text,
}

/// Document classification as uploaded; collapses to a [`PdfKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PdfType {
    Lecture,
    Homework,
    Exam,
    Other,
}

impl PdfType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Lecture" => Some(PdfType::Lecture),
            "Homework" => Some(PdfType::Homework),
            "Exam" => Some(PdfType::Exam),
            "Other" => Some(PdfType::Other),
            _ => None,
        }
    }

    /// Lectures are treated as slide decks, everything else as running text.
    pub fn kind(&self) -> PdfKind {
        match self {
            PdfType::Lecture => PdfKind::Ppt,
            _ => PdfKind::Text,
        }
    }
}

/// Normalized rectangle, all coordinates in [0, 1] relative to the page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// One user-selected region on a page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectedRegion {
    pub page: u32,
    pub rect: Rect,
}

/// Canonical tuple identifying one cacheable unit of sticker generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub pdf_hash: String,
    pub page: u32,
    pub locale: Locale,
    pub mode: EffectiveMode,
    pub selection_hash: Option<String>,
}

impl Fingerprint {
    /// Uniqueness key over all five components. The missing selection hash
    /// uses an explicit marker so text-only and selection fingerprints on the
    /// same page never collide.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.pdf_hash,
            self.page,
            self.locale.as_str(),
            self.mode.as_str(),
            self.selection_hash.as_deref().unwrap_or("-")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StickerKind {
    Auto,
    Manual,
}

/// One element of a mixed text+image anchor list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AnchorPart {
    Text { snippet: String },
    Image { id: String, page: u32, rect: Rect },
}

/// Where a sticker attaches on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickerAnchor {
    pub text_snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rect: Option<Rect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_full_page: Option<bool>,
    /// Present only for multi-region (selected images) stickers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchors: Option<Vec<AnchorPart>>,
}

impl StickerAnchor {
    pub fn text(snippet: impl Into<String>) -> Self {
        Self {
            text_snippet: snippet.into(),
            rect: None,
            is_full_page: None,
            anchors: None,
        }
    }

    pub fn full_page(snippet: impl Into<String>) -> Self {
        Self {
            text_snippet: snippet.into(),
            rect: None,
            is_full_page: Some(true),
            anchors: None,
        }
    }
}

/// One stored body of a sticker. Refreshing appends a version; switching
/// changes which one is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickerVersion {
    pub content_markdown: String,
    pub created_at_ms: i64,
}

/// A single anchored explanation owned by (user, file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sticker {
    pub id: String,
    pub user_id: String,
    pub course_id: String,
    pub file_id: String,
    pub page: u32,
    pub kind: StickerKind,
    pub anchor: StickerAnchor,
    pub parent_id: Option<String>,
    pub content_markdown: String,
    pub folded: bool,
    pub depth: u32,
    pub created_at_ms: i64,
    pub versions: Vec<StickerVersion>,
    pub active_version: usize,
}

impl Sticker {
    /// Root auto sticker, first version seeded from the body.
    pub fn auto(
        user_id: &str,
        course_id: &str,
        file_id: &str,
        page: u32,
        anchor: StickerAnchor,
        body: String,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            course_id: course_id.to_string(),
            file_id: file_id.to_string(),
            page,
            kind: StickerKind::Auto,
            anchor,
            parent_id: None,
            content_markdown: body.clone(),
            folded: false,
            depth: 0,
            created_at_ms: now,
            versions: vec![StickerVersion {
                content_markdown: body,
                created_at_ms: now,
            }],
            active_version: 0,
        }
    }

    /// Projection for another user: fresh id, same content.
    pub fn copy_for(&self, user_id: &str) -> Self {
        let mut copy = self.clone();
        copy.id = uuid::Uuid::new_v4().to_string();
        copy.user_id = user_id.to_string();
        copy.created_at_ms = now_ms();
        copy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Generating,
    Ready,
    Failed,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GenerationState::Generating)
    }
}

/// Persisted coordination object for one generation of a fingerprint.
/// Shared across users; at most one per fingerprint is non-terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: String,
    pub fingerprint: Fingerprint,
    pub state: GenerationState,
    pub producing_user_id: String,
    pub quota_units: u32,
    pub images_count: u32,
    /// Captured at start so cache hits can rebuild the multi-anchor layout.
    pub selected_regions: Vec<SelectedRegion>,
    pub started_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub error: Option<String>,
    /// Canonical stickers, set exactly once on the ready transition.
    pub stickers: Vec<Sticker>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Completed,
    Canceled,
    Expired,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Active)
    }
}

/// Sliding-window auto-explain session, owned by (user, file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSession {
    pub id: String,
    pub user_id: String,
    pub file_id: String,
    pub pdf_kind: PdfKind,
    pub locale: Locale,
    pub state: SessionState,
    pub window_start: u32,
    pub window_end: u32,
    pub current_page: u32,
    pub total_pages: u32,
    pub pages_completed: BTreeSet<u32>,
    pub pages_in_progress: BTreeSet<u32>,
    pub pages_failed: BTreeSet<u32>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl WindowSession {
    /// Pages in the window no worker should pick up again.
    pub fn covered_pages(&self) -> BTreeSet<u32> {
        let mut covered = self.pages_completed.clone();
        covered.extend(self.pages_in_progress.iter().copied());
        covered.extend(self.pages_failed.iter().copied());
        covered
    }

    pub fn window_pages(&self) -> u32 {
        self.window_end - self.window_start + 1
    }

    /// completed / total within the current window, rounded to a percent.
    pub fn progress_percent(&self) -> u32 {
        let total = self.window_pages();
        if total == 0 {
            return 0;
        }
        let done = self
            .pages_completed
            .iter()
            .filter(|p| **p >= self.window_start && **p <= self.window_end)
            .count() as u32;
        (done * 100 + total / 2) / total
    }
}

/// Kind of knowledge a context entry captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Definition,
    Formula,
    Theorem,
    Concept,
    Principle,
}

impl EntryKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "definition" => Some(EntryKind::Definition),
            "formula" => Some(EntryKind::Formula),
            "theorem" => Some(EntryKind::Theorem),
            "concept" => Some(EntryKind::Concept),
            "principle" => Some(EntryKind::Principle),
            _ => None,
        }
    }

    /// Retrieval ranking bonus per kind.
    pub fn type_bonus(&self) -> f64 {
        match self {
            EntryKind::Definition => 20.0,
            EntryKind::Formula => 15.0,
            EntryKind::Theorem => 10.0,
            EntryKind::Principle => 10.0,
            EntryKind::Concept => 5.0,
        }
    }
}

/// Deduplicated, quality-scored snippet of course knowledge mined from a PDF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: String,
    pub pdf_hash: String,
    pub kind: EntryKind,
    pub title: String,
    pub body: String,
    pub source_page: u32,
    pub keywords: Vec<String>,
    pub quality_score: f64,
    pub language: String,
    pub extraction_version: u32,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Context extraction job; unique per pdf-hash among non-terminal jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextJob {
    pub id: String,
    pub pdf_hash: String,
    pub file_id: String,
    pub user_id: String,
    pub state: JobState,
    pub total_pages: u32,
    pub estimated_total_words: u64,
    pub processed_pages: u32,
    pub processed_words: u64,
    pub current_batch: u32,
    pub total_batches: u32,
    pub extraction_version: u32,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub lease_holder: Option<String>,
    pub lease_expires_at_ms: Option<i64>,
    pub run_after_ms: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Association granting a user context access to a pdf-hash within a course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserScope {
    pub user_id: String,
    pub course_id: String,
    pub file_id: String,
    pub pdf_hash: String,
}

/// Minimal file record the handlers resolve requests against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub course_id: String,
    pub owner_user_id: String,
    pub storage_key: String,
    pub page_count: u32,
    pub is_scanned: bool,
    pub content_hash: Option<String>,
}

/// Monthly quota bucket state returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub used: u32,
    pub limit: u32,
    pub reset_at_ms: i64,
}

impl QuotaSnapshot {
    pub fn allowed(&self) -> bool {
        self.used < self.limit
    }
}

/// One latency observation for offline analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySample {
    pub pdf_hash: Option<String>,
    pub page: u32,
    pub locale: Locale,
    pub mode: EffectiveMode,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub recorded_at_ms: i64,
}
