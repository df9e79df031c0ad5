//! Directory client for candidate VPN endpoints.
//!
//! The directory is a geo-filtered recommendations endpoint returning a JSON
//! array of server objects; only each server's `hostname` is used. Every
//! call is a fresh query: no retries, no caching.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::DirectoryConfig;

/// Errors from the directory service.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("directory returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed directory response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Source of candidate endpoint hostnames.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Query the directory, surfacing failures.
    async fn try_fetch_candidates(&self) -> Result<Vec<String>, DirectoryError>;

    /// Query the directory; any failure yields an empty list.
    async fn fetch_candidates(&self) -> Vec<String> {
        match self.try_fetch_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "Failed to fetch VPN servers");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerRecommendation {
    #[serde(default)]
    hostname: Option<String>,
}

/// HTTP client for the recommendations endpoint.
pub struct DirectoryClient {
    client: reqwest::Client,
    url: String,
}

impl DirectoryClient {
    /// Create a new directory client.
    pub fn new(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            url: recommendations_url(config),
        })
    }

    /// Fully-qualified query URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Directory for DirectoryClient {
    async fn try_fetch_candidates(&self) -> Result<Vec<String>, DirectoryError> {
        debug!(url = %self.url, "Fetching VPN server recommendations");

        let response = self.client.get(&self.url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let servers: Vec<ServerRecommendation> = serde_json::from_slice(&body)?;
        let candidates: Vec<String> = servers
            .into_iter()
            .filter_map(|s| s.hostname)
            .filter(|h| !h.is_empty())
            .collect();

        debug!(count = candidates.len(), "Fetched VPN server recommendations");
        Ok(candidates)
    }
}

fn recommendations_url(config: &DirectoryConfig) -> String {
    let ids: Vec<String> = config.country_ids.iter().map(u32::to_string).collect();
    format!(
        "{}/v1/servers/recommendations?filters[country_id]={}&limit={}",
        config.base_url.trim_end_matches('/'),
        ids.join(","),
        config.limit
    )
}

/// Fixed in-memory directory for tests and offline development.
#[derive(Default)]
pub struct StaticDirectory {
    candidates: Mutex<Vec<String>>,
    failing: bool,
    calls: AtomicUsize,
}

impl StaticDirectory {
    /// Create a directory that always returns `candidates`.
    pub fn new<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: Mutex::new(candidates.into_iter().map(Into::into).collect()),
            failing: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Create a directory whose every query fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Replace the candidate list.
    pub fn set_candidates<I, S>(&self, candidates: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut guard = self.candidates.lock().unwrap_or_else(|e| e.into_inner());
        *guard = candidates.into_iter().map(Into::into).collect();
    }

    /// Number of queries served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn try_fetch_candidates(&self) -> Result<Vec<String>, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(DirectoryError::Status {
                status: 503,
                body: "static directory configured to fail".to_string(),
            });
        }
        let guard = self.candidates.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.clone())
    }
}
