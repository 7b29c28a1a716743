//! Environment-driven configuration with documented defaults.

use std::time::Duration;

/// All tunables in one place so the binary, the workers, and the tests share
/// a single source of defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub ai_base_url: String,
    pub ai_api_key: Option<String>,
    /// Default model is a cost-efficient tier; heavy prompts do not need more.
    pub ai_model: String,
    /// Object storage base URL files are fetched from.
    pub storage_base_url: String,
    /// Text extraction sidecar base URL.
    pub extractor_base_url: String,
    pub port: u16,

    /// Window sessions never exceed this many pages.
    pub window_max_pages: u32,
    /// Forward lookahead for running-text PDFs (window = current..current+7).
    pub text_lookahead: u32,
    /// Forward lookahead for slide decks.
    pub ppt_lookahead: u32,
    /// Navigation deltas beyond this are treated as a jump.
    pub jump_threshold: u32,
    /// Active sessions older than this expire lazily on the next read.
    pub session_max_lifetime: Duration,
    /// Parallel page generations per session, by pdf kind.
    pub text_concurrency: usize,
    pub ppt_concurrency: usize,

    /// Deadline for one AI completion call.
    pub generation_timeout: Duration,
    /// Poll interval suggested to clients waiting on a generation.
    pub poll_interval: Duration,
    /// Pages with less text than this fail for text-kind PDFs.
    pub min_page_text_chars: usize,

    pub auto_explain_limit: u32,
    pub learning_interactions_limit: u32,
    pub extractions_limit: u32,

    /// Extraction batch word budget: aim for target, never start a batch past
    /// max, never stop under min unless the document runs out.
    pub batch_target_words: u64,
    pub batch_min_words: u64,
    pub batch_max_words: u64,
    /// Pages sampled up front to estimate total words.
    pub sample_pages: u32,
    pub extraction_version: u32,
    /// Lease a worker holds on a claimed job.
    pub job_lease: Duration,
    pub job_max_retries: u32,
    /// Idle delay between claim attempts in the worker loop.
    pub worker_poll: Duration,

    /// Quality floor below which candidate entries are dropped.
    pub quality_threshold: f64,
    /// Token budget for context injected into prompts.
    pub context_token_budget: usize,
    pub context_max_entries: usize,
    pub keyword_cache_cap: usize,
    pub keyword_cache_ttl: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ai_base_url: "https://api.openai.com/v1".to_string(),
            ai_api_key: None,
            ai_model: "gpt-4o-mini".to_string(),
            storage_base_url: "http://127.0.0.1:9000".to_string(),
            extractor_base_url: "http://127.0.0.1:9100".to_string(),
            port: 8082,

            window_max_pages: 8,
            text_lookahead: 7,
            ppt_lookahead: 3,
            jump_threshold: 10,
            session_max_lifetime: Duration::from_secs(30 * 60),
            text_concurrency: 2,
            ppt_concurrency: 1,

            generation_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            min_page_text_chars: 50,

            auto_explain_limit: 300,
            learning_interactions_limit: 500,
            extractions_limit: 20,

            batch_target_words: 4000,
            batch_min_words: 2000,
            batch_max_words: 6000,
            sample_pages: 10,
            extraction_version: 1,
            job_lease: Duration::from_secs(5 * 60),
            job_max_retries: 3,
            worker_poll: Duration::from_secs(5),

            quality_threshold: 0.7,
            context_token_budget: 2000,
            context_max_entries: 30,
            keyword_cache_cap: 1000,
            keyword_cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl AppConfig {
    /// Defaults overridden by environment variables where deployment cares.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(url) = std::env::var("MARGINALIA_AI_BASE_URL") {
            cfg.ai_base_url = url;
        }
        cfg.ai_api_key = std::env::var("MARGINALIA_AI_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok();
        if let Ok(model) = std::env::var("MARGINALIA_AI_MODEL") {
            cfg.ai_model = model;
        }
        if let Ok(url) = std::env::var("MARGINALIA_STORAGE_URL") {
            cfg.storage_base_url = url;
        }
        if let Ok(url) = std::env::var("MARGINALIA_EXTRACTOR_URL") {
            cfg.extractor_base_url = url;
        }
        if let Some(port) = std::env::var("MARGINALIA_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            cfg.port = port;
        }
        if let Some(limit) = std::env::var("MARGINALIA_AUTO_EXPLAIN_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            cfg.auto_explain_limit = limit;
        }
        if let Some(limit) = std::env::var("MARGINALIA_EXTRACTIONS_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            cfg.extractions_limit = limit;
        }
        cfg
    }
}
