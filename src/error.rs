//! Error types for the Marginalia backend.
//!
//! Two tiers, mirroring how failures propagate:
//!
//! * [`ApiError`]: surfaced to HTTP clients through the JSON error
//!   envelope. Carries a stable wire code and the status to respond with.
//! * [`GenerateFailure`]: a failed sticker generation. Never propagated to
//!   a caller directly; it terminal-fails the generation record (refunding
//!   reserved quota) and pollers observe the failed state.
//!
//! Background workers never raise to a user: extraction failures land in the
//! job record and the log, then the retry policy takes over.

use crate::types::QuotaSnapshot;
use thiserror::Error;

/// User-visible request errors, mapped onto the wire envelope.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {message}")]
    Validation { message: String, field: Option<String> },

    #[error("missing or invalid user identity")]
    Unauthorized,

    /// Ownership failures deliberately collapse into not-found so existence
    /// never leaks.
    #[error("resource not found")]
    NotFound,

    #[error("page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: u32, total: u32 },

    #[error("scanned files are not supported for sticker generation")]
    FileIsScanned,

    #[error("page has insufficient text for explanation")]
    InsufficientText,

    #[error("quota exceeded for bucket '{bucket}'")]
    QuotaExceeded { bucket: String, snapshot: QuotaSnapshot },

    #[error("an active session already exists for this file")]
    SessionExists { session_id: String },

    #[error("session is not active")]
    SessionNotActive,

    #[error("session update failed: {0}")]
    UpdateFailed(String),

    #[error("sticker version not found")]
    VersionNotFound,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation { message: message.into(), field: None }
    }

    pub fn field(message: impl Into<String>, field: impl Into<String>) -> Self {
        ApiError::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Stable wire code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "VALIDATION",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::PageOutOfRange { .. } => "PAGE_OUT_OF_RANGE",
            ApiError::FileIsScanned => "FILE_IS_SCANNED",
            ApiError::InsufficientText => "INSUFFICIENT_TEXT",
            ApiError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            ApiError::SessionExists { .. } => "SESSION_EXISTS",
            ApiError::SessionNotActive => "SESSION_NOT_ACTIVE",
            ApiError::UpdateFailed(_) => "UPDATE_FAILED",
            ApiError::VersionNotFound => "VERSION_NOT_FOUND",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation { .. } => 400,
            ApiError::PageOutOfRange { .. } => 400,
            ApiError::FileIsScanned => 400,
            ApiError::InsufficientText => 400,
            ApiError::Unauthorized => 401,
            ApiError::NotFound => 404,
            ApiError::VersionNotFound => 404,
            ApiError::SessionExists { .. } => 409,
            ApiError::SessionNotActive => 409,
            ApiError::UpdateFailed(_) => 409,
            ApiError::QuotaExceeded { .. } => 429,
            ApiError::Internal(_) => 500,
        }
    }
}

/// Why a single sticker generation failed. Stored on the generation record.
#[derive(Debug, Clone, Error)]
pub enum GenerateFailure {
    /// Page text below the minimum; only raised for text-kind PDFs.
    #[error("insufficient text on page {page} ({chars} chars)")]
    InsufficientText { page: u32, chars: usize },

    /// The model returned nothing usable, or the call itself failed.
    #[error("ai error: {0}")]
    AiError(String),

    /// The AI call exceeded the generation deadline.
    #[error("generation timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("text extraction error: {0}")]
    Extraction(String),
}

impl GenerateFailure {
    /// Short kind tag recorded on the generation record.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerateFailure::InsufficientText { .. } => "insufficient-text",
            GenerateFailure::AiError(_) => "ai-error",
            GenerateFailure::Timeout { .. } => "timeout",
            GenerateFailure::Storage(_) => "storage-error",
            GenerateFailure::Extraction(_) => "extraction-error",
        }
    }
}

/// Failure of one extraction batch, classified for the retry policy.
#[derive(Debug, Error)]
pub enum ExtractFailure {
    /// Retries with backoff, up to the job's retry budget.
    #[error("transient: {0}")]
    Transient(String),

    /// Fails the job immediately.
    #[error("terminal: {0}")]
    Terminal(String),
}
