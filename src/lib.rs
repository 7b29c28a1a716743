//! Marginalia - coordination backend for an AI-powered PDF reader
//!
//! Turns noisy, concurrent explain-this-page requests into at-most-once AI
//! work per fingerprint, with:
//! - A shared sticker generation cache (coalesced concurrent callers)
//! - Sliding-window prefetch sessions with priority-ordered scheduling
//! - A once-per-content-hash context extraction pipeline with a lease queue
//! - Scoped, scored, token-budgeted context retrieval for prompts

pub mod ai_client;
pub mod config;
pub mod error;
pub mod extraction;
pub mod fingerprint;
pub mod generator;
pub mod job_queue;
pub mod pdf;
pub mod prompts;
pub mod quota;
pub mod retrieval;
pub mod scheduler;
pub mod server;
pub mod session_store;
pub mod sticker_cache;
pub mod store;
pub mod types;

pub use ai_client::{ChatProvider, HttpChatClient, MockChatProvider};
pub use config::AppConfig;
pub use error::{ApiError, GenerateFailure};
pub use extraction::ExtractionWorker;
pub use generator::{GenerateJob, StickerGenerator};
pub use job_queue::ContextJobQueue;
pub use pdf::{FileFetcher, FixturePdf, HttpFileFetcher, HttpTextExtractor, InMemoryFiles, PageTextSource};
pub use quota::{Bucket, QuotaService};
pub use retrieval::{ContextRetriever, KeywordExtractor};
pub use scheduler::{SessionRun, WindowScheduler};
pub use server::{create_router, run_server, AppState};
pub use session_store::{NavAction, SessionStore};
pub use sticker_cache::{ProbeResult, StickerCache};
pub use store::MemoryStore;
pub use types::*;

#[cfg(test)]
mod tests;
