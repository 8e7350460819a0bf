//! Probe document fetching with fingerprint-based change detection
//!
//! The probe source is either an http(s) URL or a local file. Each fetch is
//! fingerprinted with SHA256 so an unchanged probe is not re-ingested.

use anyhow::{bail, Context, Result};
use meterline_core::document::fingerprint;
use meterline_core::{Document, Format};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A fetched probe that differs from the previous one
pub struct FetchedProbe {
    pub document: Document,
    pub sha: String,
}

pub struct ProbeFetcher {
    /// HTTP client
    client: reqwest::Client,
    source: String,
    format: Format,
    /// Fingerprint of the last probe handed out
    last_sha: Mutex<Option<String>>,
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

impl ProbeFetcher {
    pub fn new(source: impl Into<String>, format: Format) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            source: source.into(),
            format,
            last_sha: Mutex::new(None),
        })
    }

    /// Fetch the raw probe text
    pub async fn fetch_raw(&self) -> Result<String> {
        if !is_url(&self.source) {
            return tokio::fs::read_to_string(&self.source)
                .await
                .with_context(|| format!("Failed to read probe file {}", self.source));
        }

        info!(url = %self.source, "Fetching probe");
        let response = self
            .client
            .get(&self.source)
            .send()
            .await
            .with_context(|| format!("Failed to fetch probe from {}", self.source))?;

        if !response.status().is_success() {
            bail!("Probe fetch from {} returned {}", self.source, response.status());
        }

        response
            .text()
            .await
            .context("Failed to read probe response body")
    }

    /// Fetch and parse the probe; `None` when its fingerprint matches the
    /// last committed one
    pub async fn fetch_if_changed(&self) -> Result<Option<FetchedProbe>> {
        let content = self.fetch_raw().await?;
        let sha = fingerprint(content.as_bytes());

        if self.last_sha.lock().await.as_deref() == Some(sha.as_str()) {
            debug!(sha = %&sha[..8], "Probe unchanged");
            return Ok(None);
        }

        let document = Document::parse(&content, self.format)
            .with_context(|| format!("Failed to parse probe from {}", self.source))?;
        info!(source = %self.source, sha = %&sha[..8], "Probe changed");
        Ok(Some(FetchedProbe { document, sha }))
    }

    /// Remember a probe as ingested so identical fetches are skipped
    pub async fn commit(&self, sha: String) {
        *self.last_sha.lock().await = Some(sha);
    }
}
