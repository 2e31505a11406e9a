//! Decentralized content caches: serve and seed previously fetched
//! resources by URL without deciding what to cache.

mod multiplexer;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::SourceFailure;
use crate::resource::Resource;
use crate::Result;

pub use multiplexer::{ContentCacheConfig, ContentCacheMultiplexer};

/// A content cache implementation (IPFS, BitTorrent, DHT-based, ...).
#[async_trait]
pub trait ContentCacheBackend: Send + Sync {
    /// Stable backend identifier.
    fn id(&self) -> &str;

    /// Whether availability counts from this backend are independent copies
    /// that can be summed with other backends' counts.
    fn counts_distinct_copies(&self) -> bool {
        true
    }

    /// Look up `url`. `Ok(None)` is a miss.
    async fn fetch(&self, url: &str) -> Result<Option<Resource>>;

    /// Start seeding `resource`.
    async fn seed(&self, resource: &Resource) -> Result<()>;

    /// Stop seeding `url`. Stopping something not seeded is not an error.
    async fn stop_seeding(&self, url: &str) -> Result<()>;

    /// Approximate number of copies of `url` in the network.
    async fn estimate_availability(&self, url: &str) -> Result<u64>;
}

pub type DynContentCacheBackend = Arc<dyn ContentCacheBackend>;

/// Per-backend outcome of a seed or stop fan-out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendOutcome {
    pub backend: String,
    /// `None` when the backend accepted, otherwise the rejection reason.
    pub error: Option<String>,
}

impl BackendOutcome {
    pub fn accepted(&self) -> bool {
        self.error.is_none()
    }
}

/// Structured result of a fan-out operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanOutReport {
    pub url: String,
    pub outcomes: Vec<BackendOutcome>,
}

impl FanOutReport {
    pub fn any_accepted(&self) -> bool {
        self.outcomes.iter().any(BackendOutcome::accepted)
    }

    pub fn accepted(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.accepted())
            .map(|o| o.backend.as_str())
            .collect()
    }

    pub fn rejected(&self) -> Vec<SourceFailure> {
        self.outcomes
            .iter()
            .filter_map(|o| {
                o.error
                    .as_ref()
                    .map(|reason| SourceFailure::new(o.backend.clone(), reason.clone()))
            })
            .collect()
    }
}

/// Approximate, non-authoritative copy count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailabilityEstimate {
    pub url: String,
    pub count: u64,
    /// Backends whose answers went into `count`.
    pub sources: Vec<String>,
    /// Backends that timed out or failed and were left out.
    pub omitted: Vec<String>,
}

impl AvailabilityEstimate {
    /// Some backend did not answer, so the count may be low.
    pub fn is_partial(&self) -> bool {
        !self.omitted.is_empty()
    }
}
