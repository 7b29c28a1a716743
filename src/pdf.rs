//! External collaborators: object storage and PDF text extraction.
//!
//! Both are seams, not implementations: production wires an HTTP fetcher in
//! front of object storage and an extraction sidecar; tests and mock mode
//! use the in-memory fixtures.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// Fetches raw file bytes by storage key.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, storage_key: &str) -> Result<Vec<u8>>;
}

/// Extracts per-page text from PDF bytes.
#[async_trait]
pub trait PageTextSource: Send + Sync {
    async fn page_count(&self, bytes: &[u8]) -> Result<u32>;

    /// Text of a 1-based page.
    async fn page_text(&self, bytes: &[u8], page: u32) -> Result<String>;
}

// ── HTTP implementations ─────────────────────────────────────────────────

/// Plain GET against the object storage gateway.
pub struct HttpFileFetcher {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFileFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FileFetcher for HttpFileFetcher {
    async fn fetch(&self, storage_key: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.base_url, storage_key);
        debug!("fetching file bytes from {}", url);
        let response = self.client.get(&url).send().await.context("storage request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("storage error {} for key {}", response.status(), storage_key);
        }
        let bytes = response.bytes().await.context("storage body read failed")?;
        Ok(bytes.to_vec())
    }
}

/// Client for the text extraction sidecar service.
pub struct HttpTextExtractor {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ExtractPageResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ExtractInfoResponse {
    page_count: u32,
}

impl HttpTextExtractor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PageTextSource for HttpTextExtractor {
    async fn page_count(&self, bytes: &[u8]) -> Result<u32> {
        let url = format!("{}/info", self.base_url);
        let response = self
            .client
            .post(&url)
            .body(bytes.to_vec())
            .send()
            .await
            .context("extractor request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("extractor error {}", response.status());
        }
        let info: ExtractInfoResponse = response.json().await.context("extractor info parse failed")?;
        Ok(info.page_count)
    }

    async fn page_text(&self, bytes: &[u8], page: u32) -> Result<String> {
        let url = format!("{}/pages/{}", self.base_url, page);
        let response = self
            .client
            .post(&url)
            .body(bytes.to_vec())
            .send()
            .await
            .context("extractor request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("extractor error {} for page {}", response.status(), page);
        }
        let extracted: ExtractPageResponse = response.json().await.context("extractor page parse failed")?;
        Ok(extracted.text)
    }
}

// ── In-memory fixtures ───────────────────────────────────────────────────

/// Keyed byte blobs standing in for object storage.
#[derive(Default)]
pub struct InMemoryFiles {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, storage_key: &str, bytes: Vec<u8>) {
        self.blobs.lock().insert(storage_key.to_string(), bytes);
    }
}

#[async_trait]
impl FileFetcher for InMemoryFiles {
    async fn fetch(&self, storage_key: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(storage_key)
            .cloned()
            .with_context(|| format!("no blob for key {}", storage_key))
    }
}

/// Fixed page texts for a document; ignores the byte payload.
pub struct FixturePdf {
    pages: Vec<String>,
}

impl FixturePdf {
    pub fn new(pages: Vec<&str>) -> Self {
        Self {
            pages: pages.into_iter().map(|p| p.to_string()).collect(),
        }
    }

    /// A document of `count` identical pages, handy for window tests.
    pub fn uniform(count: u32, text: &str) -> Self {
        Self {
            pages: (0..count).map(|_| text.to_string()).collect(),
        }
    }
}

#[async_trait]
impl PageTextSource for FixturePdf {
    async fn page_count(&self, _bytes: &[u8]) -> Result<u32> {
        Ok(self.pages.len() as u32)
    }

    async fn page_text(&self, _bytes: &[u8], page: u32) -> Result<String> {
        self.pages
            .get(page.saturating_sub(1) as usize)
            .cloned()
            .with_context(|| format!("page {} out of range", page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_pages_are_one_based() {
        let pdf = FixturePdf::new(vec!["first", "second"]);
        assert_eq!(tokio_test::block_on(pdf.page_count(&[])).unwrap(), 2);
        assert_eq!(tokio_test::block_on(pdf.page_text(&[], 1)).unwrap(), "first");
        assert_eq!(tokio_test::block_on(pdf.page_text(&[], 2)).unwrap(), "second");
        assert!(tokio_test::block_on(pdf.page_text(&[], 3)).is_err());
    }

    #[test]
    fn missing_blob_is_an_error() {
        let files = InMemoryFiles::new();
        files.put("objects/a.pdf", vec![1, 2, 3]);
        assert_eq!(
            tokio_test::block_on(files.fetch("objects/a.pdf")).unwrap(),
            vec![1, 2, 3]
        );
        assert!(tokio_test::block_on(files.fetch("objects/missing.pdf")).is_err());
    }
}
