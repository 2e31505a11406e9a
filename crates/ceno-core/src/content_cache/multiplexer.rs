//! Fan-out of fetch/seed/stop/estimate across content-cache backends.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::{AvailabilityEstimate, BackendOutcome, DynContentCacheBackend, FanOutReport};
use crate::cancel::CancellationToken;
use crate::config::{CenoConfig, MultiplexDefaults};
use crate::race::{race, Attempt, RaceResult};
use crate::resource::Resource;
use crate::{CenoError, Result};

#[derive(Debug, Clone)]
pub struct ContentCacheConfig {
    /// Time given to losing fetches to unwind.
    pub fetch_grace: Duration,
    /// Per-backend limit for availability estimates.
    pub estimate_timeout: Duration,
}

impl Default for ContentCacheConfig {
    fn default() -> Self {
        Self {
            fetch_grace: MultiplexDefaults::CONNECT_GRACE,
            estimate_timeout: MultiplexDefaults::ESTIMATE_TIMEOUT,
        }
    }
}

impl From<&CenoConfig> for ContentCacheConfig {
    fn from(config: &CenoConfig) -> Self {
        Self {
            fetch_grace: config.connect_grace(),
            estimate_timeout: config.estimate_timeout(),
        }
    }
}

type PairKey = (String, String);

/// Routes content-cache operations to every registered backend.
pub struct ContentCacheMultiplexer {
    backends: RwLock<Vec<DynContentCacheBackend>>,
    /// Serializes seed/stop per (backend, url).
    pair_locks: Mutex<HashMap<PairKey, Arc<AsyncMutex<()>>>>,
    /// Pairs currently seeding.
    seeding: Mutex<HashSet<PairKey>>,
    config: ContentCacheConfig,
}

impl ContentCacheMultiplexer {
    pub fn new(config: ContentCacheConfig) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            pair_locks: Mutex::new(HashMap::new()),
            seeding: Mutex::new(HashSet::new()),
            config,
        }
    }

    pub fn register_backend(&self, backend: DynContentCacheBackend) {
        let id = backend.id().to_string();
        let mut backends = self.backends.write();
        backends.retain(|b| b.id() != id);
        backends.push(backend);
        info!("Registered content-cache backend: {}", id);
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.read().iter().map(|b| b.id().to_string()).collect()
    }

    /// Backends currently seeding `url`.
    pub fn seeding_backends(&self, url: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .seeding
            .lock()
            .iter()
            .filter(|(_, u)| u == url)
            .map(|(backend, _)| backend.clone())
            .collect();
        ids.sort();
        ids
    }

    fn snapshot(&self) -> Vec<DynContentCacheBackend> {
        self.backends.read().clone()
    }

    async fn lock_pair(&self, backend: &str, url: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.pair_locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry((backend.to_string(), url.to_string()))
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Race a fetch across every backend. A miss counts as a failed attempt.
    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Resource> {
        let attempts: Vec<Attempt<Resource>> = self
            .snapshot()
            .into_iter()
            .map(|backend| {
                let id = backend.id().to_string();
                let url = url.to_string();
                Attempt::new(id, async move {
                    backend
                        .fetch(&url)
                        .await?
                        .ok_or_else(|| CenoError::Other("miss".into()))
                })
            })
            .collect();

        debug!("Racing {} cache fetches for {}", attempts.len(), url);
        match race(attempts, cancel, self.config.fetch_grace).await {
            RaceResult::Success { value, source, .. } => {
                info!("Cache hit for {} from {}", url, source);
                Ok(value)
            }
            RaceResult::AllFailed(_) if cancel.is_cancelled() => Err(CenoError::Cancelled),
            RaceResult::AllFailed(failures) => {
                debug!("Cache miss for {} on every backend", url);
                Err(CenoError::CacheMiss {
                    url: url.to_string(),
                    failures,
                })
            }
        }
    }

    /// Ask every backend to seed `resource`.
    ///
    /// Succeeds when at least one backend accepts; the report carries each
    /// backend's outcome.
    pub async fn seed(&self, resource: &Resource) -> Result<FanOutReport> {
        let url = resource.url();
        let calls = self.snapshot().into_iter().map(|backend| async move {
            let id = backend.id().to_string();
            let _guard = self.lock_pair(&id, url).await;
            let error = match backend.seed(resource).await {
                Ok(()) => {
                    self.seeding.lock().insert((id.clone(), url.to_string()));
                    None
                }
                Err(e) => {
                    warn!("Backend {} rejected seeding {}: {}", id, url, e);
                    Some(e.to_string())
                }
            };
            BackendOutcome { backend: id, error }
        });

        let report = FanOutReport {
            url: url.to_string(),
            outcomes: join_all(calls).await,
        };

        if report.any_accepted() {
            info!("Seeding {} on {:?}", url, report.accepted());
            Ok(report)
        } else {
            Err(CenoError::SeedRejected {
                url: url.to_string(),
                failures: report.rejected(),
            })
        }
    }

    /// Stop seeding `url` on the backends currently seeding it.
    ///
    /// Backends not seeding `url` are not contacted; calling this twice is a
    /// no-op the second time.
    pub async fn stop_seeding(&self, url: &str) -> FanOutReport {
        let targets: Vec<DynContentCacheBackend> = {
            let seeding = self.seeding.lock();
            self.snapshot()
                .into_iter()
                .filter(|b| seeding.contains(&(b.id().to_string(), url.to_string())))
                .collect()
        };

        let calls = targets.into_iter().map(|backend| async move {
            let id = backend.id().to_string();
            let _guard = self.lock_pair(&id, url).await;
            let key = (id.clone(), url.to_string());
            if !self.seeding.lock().contains(&key) {
                return BackendOutcome {
                    backend: id,
                    error: None,
                };
            }
            let error = match backend.stop_seeding(url).await {
                Ok(()) => {
                    self.seeding.lock().remove(&key);
                    None
                }
                Err(e) => {
                    warn!("Backend {} failed to stop seeding {}: {}", id, url, e);
                    Some(e.to_string())
                }
            };
            BackendOutcome { backend: id, error }
        });

        let report = FanOutReport {
            url: url.to_string(),
            outcomes: join_all(calls).await,
        };
        debug!("Stopped seeding {} on {} backend(s)", url, report.outcomes.len());
        report
    }

    /// Combine per-backend estimates.
    ///
    /// Backends that time out or fail are omitted rather than counted as
    /// zero. Counts are summed when every responder reports distinct copies,
    /// otherwise the maximum is taken.
    pub async fn estimate_availability(&self, url: &str) -> AvailabilityEstimate {
        let timeout = self.config.estimate_timeout;
        let calls = self.snapshot().into_iter().map(|backend| async move {
            let id = backend.id().to_string();
            let distinct = backend.counts_distinct_copies();
            let result = tokio::time::timeout(timeout, backend.estimate_availability(url)).await;
            (id, distinct, result)
        });

        let mut estimate = AvailabilityEstimate {
            url: url.to_string(),
            count: 0,
            sources: Vec::new(),
            omitted: Vec::new(),
        };
        let mut counts = Vec::new();
        let mut all_distinct = true;

        for (id, distinct, result) in join_all(calls).await {
            match result {
                Ok(Ok(count)) => {
                    all_distinct &= distinct;
                    counts.push(count);
                    estimate.sources.push(id);
                }
                Ok(Err(e)) => {
                    debug!("Estimate from {} failed: {}", id, e);
                    estimate.omitted.push(id);
                }
                Err(_) => {
                    debug!("Estimate from {} timed out after {:?}", id, timeout);
                    estimate.omitted.push(id);
                }
            }
        }

        estimate.count = if all_distinct {
            counts.iter().sum()
        } else {
            counts.iter().copied().max().unwrap_or(0)
        };
        debug!(
            "Availability of {}: {} (from {:?}, omitted {:?})",
            url, estimate.count, estimate.sources, estimate.omitted
        );
        estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_cache::ContentCacheBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingBackend {
        id: &'static str,
        distinct: bool,
        copies: u64,
        estimate_delay: Duration,
        stops: AtomicU32,
        accept_seed: bool,
    }

    impl CountingBackend {
        fn new(id: &'static str, copies: u64) -> Self {
            Self {
                id,
                distinct: true,
                copies,
                estimate_delay: Duration::ZERO,
                stops: AtomicU32::new(0),
                accept_seed: true,
            }
        }
    }

    #[async_trait]
    impl ContentCacheBackend for CountingBackend {
        fn id(&self) -> &str {
            self.id
        }
        fn counts_distinct_copies(&self) -> bool {
            self.distinct
        }
        async fn fetch(&self, _url: &str) -> Result<Option<Resource>> {
            Ok(None)
        }
        async fn seed(&self, _resource: &Resource) -> Result<()> {
            if self.accept_seed {
                Ok(())
            } else {
                Err(CenoError::Other("no space".into()))
            }
        }
        async fn stop_seeding(&self, _url: &str) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn estimate_availability(&self, _url: &str) -> Result<u64> {
            tokio::time::sleep(self.estimate_delay).await;
            Ok(self.copies)
        }
    }

    fn mux() -> ContentCacheMultiplexer {
        ContentCacheMultiplexer::new(ContentCacheConfig {
            fetch_grace: Duration::from_millis(50),
            estimate_timeout: Duration::from_millis(100),
        })
    }

    fn resource() -> Resource {
        Resource::new("https://example.org/a", 200, Vec::new(), "body")
    }

    #[tokio::test]
    async fn test_fetch_all_miss() {
        let mux = mux();
        mux.register_backend(Arc::new(CountingBackend::new("ipfs", 1)));
        let err = mux
            .fetch("https://example.org/a", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CenoError::CacheMiss { .. }));
        assert_eq!(err.source_failures()[0].reason, "miss");
    }

    #[tokio::test]
    async fn test_estimate_sums_distinct_counts() {
        let mux = mux();
        mux.register_backend(Arc::new(CountingBackend::new("ipfs", 2)));
        mux.register_backend(Arc::new(CountingBackend::new("bt", 3)));

        let estimate = mux.estimate_availability("u").await;
        assert_eq!(estimate.count, 5);
        assert!(!estimate.is_partial());
    }

    #[tokio::test]
    async fn test_estimate_takes_max_when_overlapping() {
        let mux = mux();
        mux.register_backend(Arc::new(CountingBackend::new("ipfs", 2)));
        mux.register_backend(Arc::new(CountingBackend {
            distinct: false,
            ..CountingBackend::new("dht", 4)
        }));

        assert_eq!(mux.estimate_availability("u").await.count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_omits_timeouts() {
        let mux = mux();
        mux.register_backend(Arc::new(CountingBackend::new("ipfs", 2)));
        mux.register_backend(Arc::new(CountingBackend {
            estimate_delay: Duration::from_secs(10),
            ..CountingBackend::new("slow", 7)
        }));

        let estimate = mux.estimate_availability("u").await;
        assert_eq!(estimate.count, 2);
        assert_eq!(estimate.sources, vec!["ipfs".to_string()]);
        assert_eq!(estimate.omitted, vec!["slow".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_seeding_is_idempotent() {
        let mux = mux();
        let backend = Arc::new(CountingBackend::new("ipfs", 1));
        mux.register_backend(backend.clone());

        mux.seed(&resource()).await.unwrap();
        assert_eq!(mux.seeding_backends("https://example.org/a"), vec!["ipfs"]);

        mux.stop_seeding("https://example.org/a").await;
        let second = mux.stop_seeding("https://example.org/a").await;

        assert!(second.outcomes.is_empty());
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
        assert!(mux.seeding_backends("https://example.org/a").is_empty());
    }

    #[tokio::test]
    async fn test_stop_skips_backends_not_seeding() {
        let mux = mux();
        let accepting = Arc::new(CountingBackend::new("ipfs", 1));
        let refusing = Arc::new(CountingBackend {
            accept_seed: false,
            ..CountingBackend::new("bt", 1)
        });
        mux.register_backend(accepting.clone());
        mux.register_backend(refusing.clone());

        mux.seed(&resource()).await.unwrap();
        mux.stop_seeding("https://example.org/a").await;

        assert_eq!(accepting.stops.load(Ordering::SeqCst), 1);
        assert_eq!(refusing.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_seed_rejected_everywhere() {
        let mux = mux();
        mux.register_backend(Arc::new(CountingBackend {
            accept_seed: false,
            ..CountingBackend::new("bt", 1)
        }));
        let err = mux.seed(&resource()).await.unwrap_err();
        assert!(matches!(err, CenoError::SeedRejected { .. }));
    }
}
