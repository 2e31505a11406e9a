//! Disk-budgeted admission and eviction of cached resources.
//!
//! Every decision that touches the index runs on one writer task fed by a
//! bounded queue, so concurrent admissions see consistent disk usage. The
//! writer owns the [`DiskStore`]; callers talk to it through [`CacheManager`].
//!
//! Admitting tells the content-cache multiplexer to seed the resource;
//! evicting tells it to stop. Both happen after the writer has committed,
//! one URL at a time, and follow whatever the index holds when they run, so
//! the last one to finish leaves the backends matching residency.

pub mod index;
pub mod scoring;
pub mod store;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{CacheDefaults, CenoConfig};
use crate::content_cache::{ContentCacheMultiplexer, FanOutReport};
use crate::resource::Resource;
use crate::{CenoError, Result};

pub use index::{AdmissionDecision, CacheEntry, CacheIndex, Candidate};
pub use scoring::ScoringWeights;
pub use store::DiskStore;

#[derive(Debug, Clone)]
pub struct CacheManagerConfig {
    pub root: PathBuf,
    pub disk_budget_bytes: u64,
    /// TTL for resources without `max-age`.
    pub default_ttl: Duration,
    pub weights: ScoringWeights,
    pub sweep_interval: Duration,
    pub queue_depth: usize,
}

impl CacheManagerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            disk_budget_bytes: CacheDefaults::DISK_BUDGET_BYTES,
            default_ttl: CacheDefaults::DEFAULT_TTL,
            weights: ScoringWeights::default(),
            sweep_interval: CacheDefaults::SWEEP_INTERVAL,
            queue_depth: CacheDefaults::QUEUE_DEPTH,
        }
    }
}

impl From<&CenoConfig> for CacheManagerConfig {
    fn from(config: &CenoConfig) -> Self {
        Self {
            root: config.cache_dir.clone(),
            disk_budget_bytes: config.disk_budget_bytes,
            default_ttl: config.default_ttl(),
            weights: config.scoring,
            sweep_interval: config.sweep_interval(),
            queue_depth: CacheDefaults::QUEUE_DEPTH,
        }
    }
}

/// Result of [`CacheManager::admit`].
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionOutcome {
    pub url: String,
    pub score: f64,
    pub decision: AdmissionDecision,
    /// Seed fan-out report, present when the resource was admitted and at
    /// least one backend accepted it.
    pub seed: Option<FanOutReport>,
}

impl AdmissionOutcome {
    pub fn admitted(&self) -> bool {
        self.decision.is_admit()
    }
}

enum Command {
    Admit {
        resource: Resource,
        availability: u64,
        reply: oneshot::Sender<Result<(f64, AdmissionDecision)>>,
    },
    Evaluate {
        url: String,
        size_bytes: u64,
        availability: u64,
        reply: oneshot::Sender<(f64, AdmissionDecision)>,
    },
    Sweep {
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    Remove {
        url: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Get {
        url: String,
        reply: oneshot::Sender<Result<Option<Resource>>>,
    },
    Contains {
        url: String,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<CacheEntry>>,
    },
}

struct Writer {
    store: DiskStore,
    budget: u64,
    default_ttl: Duration,
    weights: ScoringWeights,
}

impl Writer {
    fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.blocking_recv() {
            self.handle(command);
        }
        debug!("Cache writer stopped");
    }

    fn handle(&mut self, command: Command) {
        // A dropped reply receiver means the caller gave up; nothing to do.
        match command {
            Command::Admit {
                resource,
                availability,
                reply,
            } => {
                let _ = reply.send(self.admit(&resource, availability));
            }
            Command::Evaluate {
                url,
                size_bytes,
                availability,
                reply,
            } => {
                let score = self.candidate_score(availability, 1.0);
                let candidate = Candidate {
                    url,
                    size_bytes,
                    score,
                };
                let _ = reply.send((score, self.plan(&candidate)));
            }
            Command::Sweep { reply } => {
                let _ = reply.send(self.store.sweep(&self.weights, Utc::now(), self.budget));
            }
            Command::Remove { url, reply } => {
                let result = self.store.remove_all(&[url]).map(|removed| !removed.is_empty());
                let _ = reply.send(result);
            }
            Command::Get { url, reply } => {
                let _ = reply.send(self.store.read(&url));
            }
            Command::Contains { url, reply } => {
                let _ = reply.send(self.store.index().get(&url).is_some());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.store.index().entries().cloned().collect());
            }
        }
    }

    fn candidate_score(&self, availability: u64, freshness: f64) -> f64 {
        self.weights.score(availability, freshness)
    }

    fn plan(&mut self, candidate: &Candidate) -> AdmissionDecision {
        self.store.index_mut().rescore(&self.weights, Utc::now());
        self.store.index().plan_admission(candidate, self.budget)
    }

    fn admit(&mut self, resource: &Resource, availability: u64) -> Result<(f64, AdmissionDecision)> {
        let now = Utc::now();
        let ttl = resource.directives().max_age().unwrap_or(self.default_ttl);
        let mut entry = CacheEntry {
            url: resource.url().to_string(),
            object: store::object_stem(resource.url()),
            size_bytes: resource.size(),
            fetched_at: resource.fetched_at(),
            ttl_secs: ttl.as_secs(),
            availability,
            score: 0.0,
        };
        entry.rescore(&self.weights, now);

        let candidate = Candidate {
            url: entry.url.clone(),
            size_bytes: entry.size_bytes,
            score: entry.score,
        };
        let score = entry.score;
        let decision = self.plan(&candidate);

        if let AdmissionDecision::Admit { evict } = &decision {
            let projected = self
                .store
                .index()
                .usage_after(&candidate.url, candidate.size_bytes, evict);
            if projected > self.budget {
                warn!(
                    "Refusing {}: plan would leave {} bytes resident, budget {}",
                    candidate.url, projected, self.budget
                );
                return Err(CenoError::DiskBudgetExceeded {
                    needed: projected,
                    available: self.budget,
                });
            }
            self.store.apply_admission(resource, entry, evict)?;
            info!(
                "Admitted {} ({} bytes, score {:.4}), evicted {}",
                candidate.url,
                candidate.size_bytes,
                score,
                evict.len()
            );
        } else {
            debug!("Rejected {}: {:?}", candidate.url, decision);
        }
        Ok((score, decision))
    }
}

/// Handle to the cache writer. Cheap to clone.
#[derive(Clone)]
pub struct CacheManager {
    tx: mpsc::Sender<Command>,
    content: Arc<ContentCacheMultiplexer>,
    config: Arc<CacheManagerConfig>,
    /// Serializes seed/stop follow-ups per URL.
    seed_locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl CacheManager {
    /// Open the on-disk store and start the writer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: CacheManagerConfig, content: Arc<ContentCacheMultiplexer>) -> Result<Self> {
        config.weights.validate()?;
        if config.sweep_interval.is_zero() {
            return Err(CenoError::Config {
                message: "cache sweep interval must be positive".into(),
            });
        }
        let store = DiskStore::open(&config.root)?;
        if store.index().used_bytes() > config.disk_budget_bytes {
            warn!(
                "Cache at {} holds {} bytes, above budget {}; the next sweep or admission trims it",
                config.root.display(),
                store.index().used_bytes(),
                config.disk_budget_bytes
            );
        }

        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let writer = Writer {
            store,
            budget: config.disk_budget_bytes,
            default_ttl: config.default_ttl,
            weights: config.weights,
        };
        tokio::task::spawn_blocking(move || writer.run(rx));

        Ok(Self {
            tx,
            content,
            config: Arc::new(config),
            seed_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &CacheManagerConfig {
        &self.config
    }

    pub fn content(&self) -> &Arc<ContentCacheMultiplexer> {
        &self.content
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| CenoError::Other("cache writer has stopped".into()))?;
        rx.await
            .map_err(|_| CenoError::Other("cache writer dropped the request".into()))
    }

    async fn lock_url(&self, url: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.seed_locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry(url.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Whether `url` is in the index right now.
    pub async fn is_resident(&self, url: &str) -> Result<bool> {
        self.request(|reply| Command::Contains {
            url: url.to_string(),
            reply,
        })
        .await
    }

    /// Bring backend seeding for `url` in line with residency: seed it if
    /// resident, stop it otherwise. `resource` is the copy to seed, read
    /// back from disk when absent.
    async fn sync_seeding(&self, url: &str, resource: Option<&Resource>) -> Option<FanOutReport> {
        let _guard = self.lock_url(url).await;
        match self.is_resident(url).await {
            Ok(true) => {}
            Ok(false) => {
                self.content.stop_seeding(url).await;
                return None;
            }
            Err(e) => {
                warn!("Could not check residency of {}: {}", url, e);
                return None;
            }
        }

        let stored;
        let resource = match resource {
            Some(resource) => resource,
            None => match self.get(url).await {
                Ok(Some(resource)) => {
                    stored = resource;
                    &stored
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!("Could not read {} back for seeding: {}", url, e);
                    return None;
                }
            },
        };
        match self.content.seed(resource).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("{} is resident but no backend seeds it: {}", url, e);
                None
            }
        }
    }

    /// Consider `resource` for admission using the network's availability
    /// estimate. On admission the resource is seeded; evicted URLs stop
    /// seeding.
    pub async fn admit(&self, resource: Resource) -> Result<AdmissionOutcome> {
        let availability = self.content.estimate_availability(resource.url()).await.count;
        self.admit_with_availability(resource, availability).await
    }

    pub async fn admit_with_availability(
        &self,
        resource: Resource,
        availability: u64,
    ) -> Result<AdmissionOutcome> {
        let url = resource.url().to_string();
        if !resource.is_cacheable() {
            return Ok(AdmissionOutcome {
                url,
                score: 0.0,
                decision: AdmissionDecision::Reject {
                    reason: "resource is not cacheable".into(),
                },
                seed: None,
            });
        }

        let (score, decision) = self
            .request(|reply| Command::Admit {
                resource: resource.clone(),
                availability,
                reply,
            })
            .await??;

        let mut seed = None;
        if let AdmissionDecision::Admit { evict } = &decision {
            for evicted in evict {
                self.sync_seeding(evicted, None).await;
            }
            seed = self.sync_seeding(&url, Some(&resource)).await;
        }

        Ok(AdmissionOutcome {
            url,
            score,
            decision,
            seed,
        })
    }

    /// Dry-run admission for a resource not fetched yet.
    pub async fn evaluate(
        &self,
        url: &str,
        size_bytes: u64,
        availability: u64,
    ) -> Result<(f64, AdmissionDecision)> {
        self.request(|reply| Command::Evaluate {
            url: url.to_string(),
            size_bytes,
            availability,
            reply,
        })
        .await
    }

    /// Rescore everything, evict stale entries, then trim the lowest
    /// scores until the cache fits its budget.
    pub async fn sweep(&self) -> Result<Vec<String>> {
        let evicted = self.request(|reply| Command::Sweep { reply }).await??;
        for url in &evicted {
            self.sync_seeding(url, None).await;
        }
        Ok(evicted)
    }

    /// Drop `url` from the cache and stop seeding it.
    pub async fn evict(&self, url: &str) -> Result<bool> {
        let removed = self
            .request(|reply| Command::Remove {
                url: url.to_string(),
                reply,
            })
            .await??;
        if removed {
            self.sync_seeding(url, None).await;
        }
        Ok(removed)
    }

    /// Resident copy of `url`, if any.
    pub async fn get(&self, url: &str) -> Result<Option<Resource>> {
        self.request(|reply| Command::Get {
            url: url.to_string(),
            reply,
        })
        .await?
    }

    pub async fn entries(&self) -> Result<Vec<CacheEntry>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn used_bytes(&self) -> Result<u64> {
        Ok(self.entries().await?.iter().map(|e| e.size_bytes).sum())
    }

    /// Sweep every `sweep_interval` until `shutdown` fires.
    pub fn start_sweeper(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Cache sweeper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        match manager.sweep().await {
                            Ok(evicted) if !evicted.is_empty() => {
                                info!("Sweeper evicted {} entries", evicted.len());
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Cache sweep failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}
