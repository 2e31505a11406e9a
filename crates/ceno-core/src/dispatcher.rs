//! Request resolution: origin, then injector, then static cache.
//!
//! ```text
//! ORIGIN ──ok──────────────────────────────▶ SUCCESS
//!   │ filtered (no retry) / other error
//!   ▼
//! INJECTOR ──ok────────────────────────────▶ SUCCESS
//!   │ blocked / error
//!   ▼
//! STATIC_CACHE ──ok────────────────────────▶ SUCCESS
//!   │ miss / error
//!   ▼
//! FAILURE (one diagnostic per failed stage)
//! ```
//!
//! One cancellation token spans the chain. Cancelling it aborts the stage in
//! flight and fails immediately with a cancellation diagnostic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::{until_cancelled, CancellationToken};
use crate::config::{CenoConfig, DispatchDefaults};
use crate::content_cache::ContentCacheMultiplexer;
use crate::hidden_service::{HiddenServiceMultiplexer, HiddenServiceName};
use crate::injector::request_via;
use crate::origin::OriginClient;
use crate::resource::{validate_url, Resource};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::{CenoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Origin,
    Injector,
    StaticCache,
}

impl Stage {
    fn next(self) -> Option<Stage> {
        match self {
            Stage::Origin => Some(Stage::Injector),
            Stage::Injector => Some(Stage::StaticCache),
            Stage::StaticCache => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Origin => write!(f, "ORIGIN"),
            Stage::Injector => write!(f, "INJECTOR"),
            Stage::StaticCache => write!(f, "STATIC_CACHE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Filtered,
    Network,
    Blocked,
    Miss,
    Timeout,
    Cancelled,
    Other,
}

impl From<&CenoError> for DiagnosticKind {
    fn from(error: &CenoError) -> Self {
        match error {
            CenoError::NetworkFiltering { .. } => DiagnosticKind::Filtered,
            CenoError::ConnectionBlocked { .. } | CenoError::HostUnavailable { .. } => {
                DiagnosticKind::Blocked
            }
            CenoError::CacheMiss { .. } => DiagnosticKind::Miss,
            CenoError::Timeout(_) => DiagnosticKind::Timeout,
            CenoError::Cancelled => DiagnosticKind::Cancelled,
            CenoError::Network { .. } | CenoError::Protocol { .. } => DiagnosticKind::Network,
            _ => DiagnosticKind::Other,
        }
    }
}

/// Why one stage failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageDiagnostic {
    pub stage: Stage,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl StageDiagnostic {
    fn from_error(stage: Stage, error: &CenoError) -> Self {
        Self {
            stage,
            kind: error.into(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for StageDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}): {}", self.stage, self.kind, self.message)
    }
}

/// A successfully resolved request.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub resource: Resource,
    pub stage: Stage,
    /// Failures of the stages tried before `stage`.
    pub diagnostics: Vec<StageDiagnostic>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Limit for each stage, retries included.
    pub stage_timeout: Duration,
    pub origin_retry: RetryPolicy,
    pub injector: HiddenServiceName,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            stage_timeout: DispatchDefaults::STAGE_TIMEOUT,
            origin_retry: RetryPolicy::default(),
            injector: HiddenServiceName::new(DispatchDefaults::INJECTOR_SERVICE),
        }
    }
}

impl From<&CenoConfig> for DispatcherConfig {
    fn from(config: &CenoConfig) -> Self {
        Self {
            stage_timeout: config.stage_timeout(),
            origin_retry: RetryPolicy::default().with_max_attempts(config.origin_retry_attempts),
            injector: HiddenServiceName::new(config.injector_service.clone()),
        }
    }
}

pub struct RequestDispatcher {
    origin: Arc<dyn OriginClient>,
    hidden_services: Arc<HiddenServiceMultiplexer>,
    content: Arc<ContentCacheMultiplexer>,
    config: DispatcherConfig,
}

impl RequestDispatcher {
    pub fn new(
        origin: Arc<dyn OriginClient>,
        hidden_services: Arc<HiddenServiceMultiplexer>,
        content: Arc<ContentCacheMultiplexer>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            origin,
            hidden_services,
            content,
            config,
        }
    }

    /// Resolve `url`, falling through the stages until one succeeds.
    ///
    /// Fails with [`CenoError::AggregatedFailure`] carrying one diagnostic
    /// per failed stage, or [`CenoError::InvalidUrl`] before any stage runs.
    pub async fn resolve(&self, url: &str, cancel: &CancellationToken) -> Result<Resolved> {
        validate_url(url)?;
        let mut diagnostics = Vec::new();
        let mut current = Some(Stage::Origin);

        while let Some(stage) = current {
            debug!("{} -> {}", url, stage);

            let outcome = until_cancelled(
                cancel,
                tokio::time::timeout(self.config.stage_timeout, self.run_stage(stage, url, cancel)),
            )
            .await;

            let error = match outcome {
                Ok(Ok(Ok(resource))) => {
                    info!("{} resolved at {} ({} failed stages)", url, stage, diagnostics.len());
                    return Ok(Resolved {
                        resource,
                        stage,
                        diagnostics,
                    });
                }
                Ok(Ok(Err(e))) => e,
                Ok(Err(_elapsed)) => CenoError::Timeout(self.config.stage_timeout),
                Err(cancelled) => cancelled.into(),
            };
            // A stage that failed as the token fired counts as cancelled.
            let error = if cancel.is_cancelled() && !matches!(error, CenoError::Cancelled) {
                debug!("{} failed at {} while cancelling: {}", url, stage, error);
                CenoError::Cancelled
            } else {
                error
            };

            let diagnostic = StageDiagnostic::from_error(stage, &error);
            debug!("{} failed: {}", url, diagnostic);
            diagnostics.push(diagnostic);

            if matches!(error, CenoError::Cancelled) {
                warn!("{} cancelled during {}", url, stage);
                break;
            }
            current = stage.next();
        }

        Err(CenoError::AggregatedFailure {
            url: url.to_string(),
            diagnostics,
        })
    }

    async fn run_stage(&self, stage: Stage, url: &str, cancel: &CancellationToken) -> Result<Resource> {
        match stage {
            Stage::Origin => self.fetch_origin(url, cancel).await,
            Stage::Injector => self.fetch_via_injector(url, cancel).await,
            Stage::StaticCache => self.content.fetch(url, cancel).await,
        }
    }

    async fn fetch_origin(&self, url: &str, cancel: &CancellationToken) -> Result<Resource> {
        let (result, stats) =
            retry_with_backoff(&self.config.origin_retry, cancel, || self.origin.fetch(url)).await;
        if stats.attempts > 1 {
            debug!("Origin fetch for {} took {} attempts", url, stats.attempts);
        }
        result
    }

    async fn fetch_via_injector(&self, url: &str, cancel: &CancellationToken) -> Result<Resource> {
        let mut conn = self.hidden_services.connect(&self.config.injector, cancel).await?;
        let result = request_via(&mut conn, url).await;
        if let Err(e) = conn.close().await {
            debug!("Closing injector connection failed: {}", e);
        }
        result
    }
}
