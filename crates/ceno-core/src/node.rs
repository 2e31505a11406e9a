//! A fully wired CENO node.
//!
//! [`CenoNodeBuilder`] takes a [`CenoConfig`] plus the backends chosen at
//! runtime and produces a [`CenoNode`] owning the scheduler, both
//! multiplexers, the cache manager, the dispatcher and, optionally, the hosted
//! injector and seeder services.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache_manager::{CacheManager, CacheManagerConfig};
use crate::cancel::CancellationToken;
use crate::config::CenoConfig;
use crate::content_cache::{ContentCacheConfig, ContentCacheMultiplexer, DynContentCacheBackend};
use crate::dispatcher::{DispatcherConfig, RequestDispatcher, Resolved};
use crate::hidden_service::{
    DynHiddenServiceBackend, HiddenServiceMultiplexer, HiddenServiceName, MultiplexerConfig,
};
use crate::injector::InjectorService;
use crate::origin::{HttpOriginClient, OriginClient};
use crate::resource::Resource;
use crate::scheduler::{BudgetKind, Priority, ResourceScheduler, SchedulerConfig};
use crate::seeder::{AltruisticSeeder, AvailabilityBooster, BoostReport};
use crate::{CenoError, Result};

/// Builder for [`CenoNode`].
///
/// # Example
///
/// ```rust,ignore
/// let node = CenoNode::builder(config)
///     .hidden_service_backend(Arc::new(my_i2p_backend))
///     .content_cache_backend(Arc::new(my_ipfs_backend))
///     .serve_seeder(true)
///     .build()
///     .await?;
///
/// let resolved = node.resolve("https://example.org/", &CancellationToken::new()).await?;
/// node.shutdown().await;
/// ```
pub struct CenoNodeBuilder {
    config: CenoConfig,
    origin: Option<Arc<dyn OriginClient>>,
    hidden_service_backends: Vec<DynHiddenServiceBackend>,
    content_cache_backends: Vec<DynContentCacheBackend>,
    serve_injector: bool,
    serve_seeder: bool,
    cache_resolved: bool,
    start_sweeper: bool,
}

impl CenoNodeBuilder {
    pub fn new(config: CenoConfig) -> Self {
        Self {
            config,
            origin: None,
            hidden_service_backends: Vec::new(),
            content_cache_backends: Vec::new(),
            serve_injector: false,
            serve_seeder: false,
            cache_resolved: true,
            start_sweeper: true,
        }
    }

    /// Origin client for the dispatcher and injector.
    ///
    /// Default: [`HttpOriginClient`] with the stage timeout.
    pub fn origin(mut self, origin: Arc<dyn OriginClient>) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn hidden_service_backend(mut self, backend: DynHiddenServiceBackend) -> Self {
        self.hidden_service_backends.push(backend);
        self
    }

    pub fn content_cache_backend(mut self, backend: DynContentCacheBackend) -> Self {
        self.content_cache_backends.push(backend);
        self
    }

    /// Host the injector service on this node.
    ///
    /// Default: `false`
    pub fn serve_injector(mut self, enable: bool) -> Self {
        self.serve_injector = enable;
        self
    }

    /// Host the altruistic seeder service on this node.
    ///
    /// Default: `false`
    pub fn serve_seeder(mut self, enable: bool) -> Self {
        self.serve_seeder = enable;
        self
    }

    /// Offer cache-eligible resolved resources to the local cache.
    ///
    /// Default: `true`
    pub fn cache_resolved(mut self, enable: bool) -> Self {
        self.cache_resolved = enable;
        self
    }

    /// Run the periodic cache sweep.
    ///
    /// Default: `true`
    pub fn start_sweeper(mut self, enable: bool) -> Self {
        self.start_sweeper = enable;
        self
    }

    /// Build the node. Must run inside a tokio runtime.
    pub async fn build(self) -> Result<CenoNode> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let origin: Arc<dyn OriginClient> = match self.origin {
            Some(origin) => origin,
            None => Arc::new(HttpOriginClient::new(config.stage_timeout())?),
        };

        let scheduler = ResourceScheduler::new(SchedulerConfig::from(config.as_ref()));

        let hidden_services = Arc::new(HiddenServiceMultiplexer::new(MultiplexerConfig::from(
            config.as_ref(),
        )));
        for backend in self.hidden_service_backends {
            hidden_services.register_backend(backend);
        }

        let content = Arc::new(ContentCacheMultiplexer::new(ContentCacheConfig::from(
            config.as_ref(),
        )));
        for backend in self.content_cache_backends {
            content.register_backend(backend);
        }

        let cache = CacheManager::open(CacheManagerConfig::from(config.as_ref()), Arc::clone(&content))?;

        let dispatcher = Arc::new(RequestDispatcher::new(
            Arc::clone(&origin),
            Arc::clone(&hidden_services),
            Arc::clone(&content),
            DispatcherConfig::from(config.as_ref()),
        ));

        let booster = AvailabilityBooster::new(
            Arc::clone(&hidden_services),
            Arc::clone(&content),
            scheduler.clone(),
            config.seeder.clone(),
            config.stage_timeout(),
        );

        let node = CenoNode {
            config: Arc::clone(&config),
            scheduler: scheduler.clone(),
            hidden_services: Arc::clone(&hidden_services),
            content,
            cache: cache.clone(),
            dispatcher,
            booster,
            cache_resolved: self.cache_resolved,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };

        if self.start_sweeper {
            node.track(cache.start_sweeper(node.shutdown.child_token()));
        }

        if self.serve_injector {
            let injector = Arc::new(
                InjectorService::new(HiddenServiceName::new(config.injector_service.clone()), origin)
                    .with_cache(cache.clone()),
            );
            let hs = Arc::clone(&hidden_services);
            let token = node.shutdown.child_token();
            node.track(tokio::spawn(async move {
                if let Err(e) = injector.serve(&hs, token).await {
                    warn!("Injector service stopped: {}", e);
                }
            }));
        }

        if self.serve_seeder {
            let seeder = Arc::new(AltruisticSeeder::new(cache, scheduler, config.seeder.clone()));
            let hs = Arc::clone(&hidden_services);
            let token = node.shutdown.child_token();
            node.track(tokio::spawn(async move {
                if let Err(e) = seeder.serve(&hs, token).await {
                    warn!("Seeder service stopped: {}", e);
                }
            }));
        }

        info!(
            "CENO node ready: {} hidden-service backends, {} content-cache backends, cache at {}",
            node.hidden_services.backend_ids().len(),
            node.content.backend_ids().len(),
            config.cache_dir.display()
        );
        Ok(node)
    }
}

/// A running node. Call [`shutdown`](CenoNode::shutdown) to stop it.
pub struct CenoNode {
    config: Arc<CenoConfig>,
    scheduler: ResourceScheduler,
    hidden_services: Arc<HiddenServiceMultiplexer>,
    content: Arc<ContentCacheMultiplexer>,
    cache: CacheManager,
    dispatcher: Arc<RequestDispatcher>,
    booster: AvailabilityBooster,
    cache_resolved: bool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CenoNode {
    pub fn builder(config: CenoConfig) -> CenoNodeBuilder {
        CenoNodeBuilder::new(config)
    }

    pub fn config(&self) -> &CenoConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &ResourceScheduler {
        &self.scheduler
    }

    pub fn hidden_services(&self) -> &Arc<HiddenServiceMultiplexer> {
        &self.hidden_services
    }

    pub fn content(&self) -> &Arc<ContentCacheMultiplexer> {
        &self.content
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Resolve `url` on behalf of the local user.
    ///
    /// Takes an essential bandwidth lease, so it may be delayed but is never
    /// denied for budget reasons.
    pub async fn resolve(&self, url: &str, cancel: &CancellationToken) -> Result<Resolved> {
        if self.shutdown.is_cancelled() {
            return Err(CenoError::SchedulerShutdown);
        }
        let lease = self
            .scheduler
            .request_lease(
                BudgetKind::Bandwidth,
                self.config.seeder.fetch_estimate_bytes,
                Priority::Essential,
            )
            .await?;

        let resolved = self.dispatcher.resolve(url, cancel).await;

        if let Ok(resolved) = &resolved {
            let used = resolved.resource.size().min(lease.remaining());
            if let Err(e) = lease.consume(used) {
                debug!("Bandwidth for {} not accounted: {}", url, e);
            }
            if self.cache_resolved {
                self.offer_to_cache(resolved.resource.clone());
            }
        }
        lease.release();
        resolved
    }

    fn offer_to_cache(&self, resource: Resource) {
        if !resource.is_cacheable() {
            return;
        }
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let url = resource.url().to_string();
            match cache.admit(resource).await {
                Ok(outcome) if outcome.admitted() => debug!("Cached resolved {}", url),
                Ok(_) => debug!("Resolved {} not admitted", url),
                Err(e) => warn!("Caching resolved {} failed: {}", url, e),
            }
        });
    }

    /// Ask seeders under the configured seeder service to raise the
    /// availability of `url`.
    pub async fn boost(
        &self,
        url: &str,
        copy: Option<&Resource>,
        cancel: &CancellationToken,
    ) -> BoostReport {
        let seeders = [HiddenServiceName::new(self.config.seeder.service.clone())];
        self.booster.boost(url, &seeders, copy, cancel).await
    }

    /// Like [`boost`](Self::boost) with an explicit list of seeder services.
    pub async fn boost_via(
        &self,
        url: &str,
        seeders: &[HiddenServiceName],
        copy: Option<&Resource>,
        cancel: &CancellationToken,
    ) -> BoostReport {
        self.booster.boost(url, seeders, copy, cancel).await
    }

    /// Stop hosted services and the sweeper, then shut the scheduler down,
    /// which cancels every outstanding lease.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down CENO node");
        self.shutdown.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Node task ended abnormally: {}", e);
            }
        }
        self.scheduler.shutdown();
    }
}
