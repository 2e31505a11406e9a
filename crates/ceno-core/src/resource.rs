//! Immutable web resources and their cache directives.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{CenoError, Result};

/// Parse `url`, accepting only absolute `http`/`https` URLs.
pub fn validate_url(url: &str) -> Result<Url> {
    let invalid = |reason: String| CenoError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(invalid(format!("unsupported scheme {:?}", other))),
    }
}

/// Cacheability hints parsed from `Cache-Control`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDirectives {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
    #[serde(default)]
    pub no_store: bool,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub no_cache: bool,
}

impl CacheDirectives {
    /// Parse a `Cache-Control` header value. Unknown directives are ignored.
    pub fn parse(value: &str) -> Self {
        let mut directives = Self::default();
        for part in value.split(',') {
            let part = part.trim();
            let (name, arg) = match part.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (part, None),
            };
            match name.to_ascii_lowercase().as_str() {
                "max-age" => {
                    directives.max_age_secs = arg.and_then(|a| a.parse().ok());
                }
                "no-store" => directives.no_store = true,
                "private" => directives.private = true,
                "no-cache" => directives.no_cache = true,
                _ => {}
            }
        }
        directives
    }

    /// Collect directives from every `Cache-Control` header in `headers`.
    pub fn from_headers(headers: &[(String, String)]) -> Self {
        let value = headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("cache-control"))
            .map(|(_, value)| value.as_str())
            .collect::<Vec<_>>()
            .join(",");
        Self::parse(&value)
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }

    /// Whether a shared cache may keep this response at all.
    pub fn is_shareable(&self) -> bool {
        !self.no_store && !self.private
    }
}

/// A fetched web resource. Never mutated once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    content: Bytes,
    directives: CacheDirectives,
    fetched_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(
        url: impl Into<String>,
        status: u16,
        headers: Vec<(String, String)>,
        content: impl Into<Bytes>,
    ) -> Self {
        Self::with_fetched_at(url, status, headers, content, Utc::now())
    }

    pub fn with_fetched_at(
        url: impl Into<String>,
        status: u16,
        headers: Vec<(String, String)>,
        content: impl Into<Bytes>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let directives = CacheDirectives::from_headers(&headers);
        Self {
            url: url.into(),
            status,
            headers,
            content: content.into(),
            directives,
            fetched_at,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header named `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn directives(&self) -> &CacheDirectives {
        &self.directives
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Age relative to `now`, clamped at zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether this resource may be admitted into the shared cache.
    pub fn is_cacheable(&self) -> bool {
        (200..300).contains(&self.status) && self.directives.is_shareable()
    }
}
