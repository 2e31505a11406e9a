//! Direct fetches from origin servers.
//!
//! Filtering detection here is deliberately simple: HTTP 451 or a body that
//! contains a configured blockpage marker. Richer fingerprinting belongs in
//! a custom [`OriginClient`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::resource::Resource;
use crate::{CenoError, Result};

const USER_AGENT: &str = concat!("ceno/", env!("CARGO_PKG_VERSION"));
const UNAVAILABLE_FOR_LEGAL_REASONS: u16 = 451;

/// Fetches a URL directly from its origin.
///
/// Implementations return [`CenoError::NetworkFiltering`] when they detect
/// censorship so the dispatcher can bypass retries.
#[async_trait]
pub trait OriginClient: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Resource>;
}

/// reqwest-backed origin client.
pub struct HttpOriginClient {
    client: Client,
    blockpage_markers: Vec<String>,
}

impl HttpOriginClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CenoError::Network {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            blockpage_markers: Vec::new(),
        })
    }

    /// Treat any response whose body contains one of `markers` as filtered.
    pub fn with_blockpage_markers(mut self, markers: Vec<String>) -> Self {
        self.blockpage_markers = markers;
        self
    }

    fn detect_filtering(&self, resource: &Resource) -> Option<String> {
        if resource.status() == UNAVAILABLE_FOR_LEGAL_REASONS {
            return Some("HTTP 451 Unavailable For Legal Reasons".into());
        }
        let body = String::from_utf8_lossy(resource.content());
        self.blockpage_markers
            .iter()
            .find(|marker| body.contains(marker.as_str()))
            .map(|marker| format!("blockpage marker {:?} matched", marker))
    }
}

#[async_trait]
impl OriginClient for HttpOriginClient {
    async fn fetch(&self, url: &str) -> Result<Resource> {
        debug!("Origin fetch: {}", url);
        let response = self.client.get(url).send().await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;
        let resource = Resource::new(url, status, headers, body);

        if let Some(reason) = self.detect_filtering(&resource) {
            warn!("Filtering detected for {}: {}", url, reason);
            return Err(CenoError::NetworkFiltering {
                url: url.to_string(),
                reason,
            });
        }
        Ok(resource)
    }
}
