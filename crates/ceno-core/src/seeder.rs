//! Altruistic seeding: helping other nodes keep resources available.
//!
//! [`AltruisticSeeder`] is the hosted side. It treats each
//! `increase_availability` request as an admission candidate and only accepts
//! when both the cache manager and the scheduler agree.
//!
//! [`AvailabilityBooster`] is the requester side. It contacts up to K seeders
//! and stops as soon as the availability estimate is satisfactory. Each
//! contact is altruistic traffic and needs its own lease.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache_manager::{AdmissionDecision, CacheManager};
use crate::cancel::CancellationToken;
use crate::config::{SeederConfig, SeederDefaults};
use crate::content_cache::ContentCacheMultiplexer;
use crate::hidden_service::{Connection, HiddenServiceMultiplexer, HiddenServiceName};
use crate::protocol::{
    expect_body, expect_message, read_message, write_frame, write_message, Message, ResourceHead,
};
use crate::resource::Resource;
use crate::scheduler::{BudgetKind, Lease, Priority, ResourceScheduler};
use crate::{CenoError, Result};

/// Reply to an `increase_availability` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedDecision {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl SeedDecision {
    fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn refused(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Hosted `increase_availability` service.
pub struct AltruisticSeeder {
    cache: CacheManager,
    scheduler: ResourceScheduler,
    config: SeederConfig,
}

impl AltruisticSeeder {
    pub fn new(cache: CacheManager, scheduler: ResourceScheduler, config: SeederConfig) -> Self {
        Self {
            cache,
            scheduler,
            config,
        }
    }

    /// Decide on and, if accepted, carry out a request to seed `url`.
    ///
    /// `supplied` is the requester's own copy, used instead of fetching.
    pub async fn handle_increase_availability(
        &self,
        url: &str,
        supplied: Option<Resource>,
    ) -> SeedDecision {
        match self.try_seed(url, supplied).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("increase_availability({}) failed: {}", url, e);
                SeedDecision::refused(e.to_string())
            }
        }
    }

    async fn try_seed(&self, url: &str, supplied: Option<Resource>) -> Result<SeedDecision> {
        if let Some(copy) = &supplied {
            if copy.url() != url {
                return Ok(SeedDecision::refused("supplied copy is for a different URL"));
            }
            if !copy.is_cacheable() {
                return Ok(SeedDecision::refused("supplied copy is not cacheable"));
            }
        }

        let size = supplied
            .as_ref()
            .map_or(self.config.fetch_estimate_bytes, Resource::size);
        let availability = self.cache.content().estimate_availability(url).await.count;

        let (_, decision) = self.cache.evaluate(url, size, availability).await?;
        if let AdmissionDecision::Reject { reason } = decision {
            debug!("Refusing to seed {}: {}", url, reason);
            return Ok(SeedDecision::refused(format!("admission rejected: {}", reason)));
        }

        // Fetch plus seed cost, valid past the end of the seed period.
        let validity = self.config.seed_duration() + self.scheduler.lease_duration();
        let lease = match self
            .scheduler
            .request_lease_for(
                BudgetKind::Bandwidth,
                size.saturating_mul(2),
                Priority::Altruistic,
                validity,
            )
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                debug!("Refusing to seed {}: {}", url, e);
                return Ok(SeedDecision::refused(format!("budget denied: {}", e)));
            }
        };

        let resource = match supplied {
            Some(copy) => copy,
            None => self.obtain(url, &lease).await?,
        };
        if let Err(e) = lease.consume(resource.size().min(lease.remaining())) {
            debug!("Fetch of {} not accounted: {}", url, e);
        }

        let outcome = self
            .cache
            .admit_with_availability(resource, availability)
            .await?;
        if let AdmissionDecision::Reject { reason } = outcome.decision {
            return Ok(SeedDecision::refused(format!("admission rejected: {}", reason)));
        }
        if outcome.seed.is_none() {
            self.cache.evict(url).await?;
            return Ok(SeedDecision::refused("no content-cache backend accepted the seed"));
        }

        info!("Seeding {} for {:?}", url, self.config.seed_duration());
        self.hold_for_seed_duration(url.to_string(), lease);
        Ok(SeedDecision::accepted())
    }

    async fn obtain(&self, url: &str, lease: &Lease) -> Result<Resource> {
        if let Some(resident) = self.cache.get(url).await? {
            debug!("Using resident copy of {}", url);
            return Ok(resident);
        }
        self.cache.content().fetch(url, lease.cancellation()).await
    }

    /// Keep the seed-time share of the lease reserved for the seed
    /// duration. Afterwards the sweeper decides whether the entry stays.
    fn hold_for_seed_duration(&self, url: String, lease: Lease) {
        let duration = self.config.seed_duration().min(lease.time_left());
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    debug!("Seed period for {} over", url);
                }
                _ = lease.cancellation().cancelled() => {
                    debug!("Seed period for {} cut short by shutdown", url);
                }
            }
            let consumed = lease.consumed();
            let remaining = lease.remaining();
            if let Err(e) = lease.consume(remaining) {
                warn!("Could not account seeding traffic for {}: {}", url, e);
            }
            lease.release();
            debug!("Released seed lease for {} ({} bytes fetched)", url, consumed);
        });
    }

    /// Host the seeder service and answer requests until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        hidden_services: &HiddenServiceMultiplexer,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let name = HiddenServiceName::new(self.config.service.clone());
        let mut incoming = hidden_services.host(&name).await?;
        let mut handlers = JoinSet::new();
        info!("Altruistic seeder serving {}", name);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = incoming.next() => {
                    let Some(conn) = next else { break };
                    let seeder = Arc::clone(&self);
                    handlers.spawn(async move {
                        if let Err(e) = seeder.handle_connection(conn).await {
                            warn!("Seeder connection failed: {}", e);
                        }
                    });
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        handlers.shutdown().await;
        Ok(())
    }

    pub async fn handle_connection(&self, mut conn: Connection) -> Result<()> {
        while let Some(message) = read_message(&mut conn).await? {
            let Message::IncreaseAvailability { url, copy } = message else {
                return Err(CenoError::protocol("seeder only handles increase_availability"));
            };
            let supplied = match copy {
                Some(head) => {
                    let body = expect_body(&mut conn).await?;
                    Some(Resource::new(url.clone(), head.status, head.headers, body))
                }
                None => None,
            };

            let decision = self.handle_increase_availability(&url, supplied).await;
            write_message(
                &mut conn,
                &Message::IncreaseAvailabilityResponse {
                    accepted: decision.accepted,
                    reason: decision.reason,
                },
            )
            .await?;
        }
        Ok(())
    }
}

/// Send one `increase_availability` request over `conn`.
pub async fn request_increase_availability(
    conn: &mut Connection,
    url: &str,
    copy: Option<&Resource>,
) -> Result<SeedDecision> {
    let head = copy.map(|r| ResourceHead {
        status: r.status(),
        headers: r.headers().to_vec(),
    });
    write_message(
        conn,
        &Message::IncreaseAvailability {
            url: url.to_string(),
            copy: head,
        },
    )
    .await?;
    if let Some(resource) = copy {
        write_frame(conn, resource.content()).await?;
    }

    match expect_message(conn).await? {
        Message::IncreaseAvailabilityResponse { accepted, reason } => Ok(SeedDecision { accepted, reason }),
        other => Err(CenoError::protocol(format!(
            "unexpected reply to increase_availability: {:?}",
            other
        ))),
    }
}

/// One contacted seeder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeederContact {
    pub service: String,
    pub backend: Option<String>,
    pub accepted: bool,
    pub detail: Option<String>,
    /// Estimate re-checked after this contact.
    pub estimate_after: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoostReport {
    pub url: String,
    pub initial_estimate: u64,
    pub final_estimate: u64,
    pub satisfied: bool,
    pub contacts: Vec<SeederContact>,
    /// Why the boost stopped early for lack of budget, if it did.
    pub budget_denied: Option<String>,
}

impl BoostReport {
    /// Connect attempts made, failed ones included.
    pub fn attempts(&self) -> usize {
        self.contacts.len()
    }
}

/// Requester side of altruistic seeding.
pub struct AvailabilityBooster {
    hidden_services: Arc<HiddenServiceMultiplexer>,
    content: Arc<ContentCacheMultiplexer>,
    scheduler: ResourceScheduler,
    config: SeederConfig,
    connect_timeout: Duration,
}

impl AvailabilityBooster {
    pub fn new(
        hidden_services: Arc<HiddenServiceMultiplexer>,
        content: Arc<ContentCacheMultiplexer>,
        scheduler: ResourceScheduler,
        config: SeederConfig,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            hidden_services,
            content,
            scheduler,
            config,
            connect_timeout,
        }
    }

    /// Raise availability of `url` by asking seeders, one at a time.
    ///
    /// `seeders` are tried round-robin; each try connects afresh, so a
    /// load-balanced name can reach a different node every time. Stops at
    /// the first estimate meeting the threshold, after K attempts, or when
    /// the scheduler denies the next contact's altruistic lease. Giving up is
    /// not an error.
    pub async fn boost(
        &self,
        url: &str,
        seeders: &[HiddenServiceName],
        copy: Option<&Resource>,
        cancel: &CancellationToken,
    ) -> BoostReport {
        let threshold = self.config.satisfactory_availability;
        let initial = self.content.estimate_availability(url).await.count;
        let mut report = BoostReport {
            url: url.to_string(),
            initial_estimate: initial,
            final_estimate: initial,
            satisfied: initial >= threshold,
            contacts: Vec::new(),
            budget_denied: None,
        };
        if report.satisfied || seeders.is_empty() {
            return report;
        }

        for (attempt, service) in seeders
            .iter()
            .cycle()
            .take(self.config.max_attempts as usize)
            .enumerate()
        {
            if cancel.is_cancelled() {
                debug!("Boost for {} cancelled after {} attempts", url, attempt);
                break;
            }

            let cost = copy.map_or(0, Resource::size) + SeederDefaults::CONTACT_BYTES;
            let lease = match self
                .scheduler
                .request_lease(BudgetKind::Bandwidth, cost, Priority::Altruistic)
                .await
            {
                Ok(lease) => lease,
                Err(e) => {
                    info!("Boost for {} stopped after {} attempts: {}", url, attempt, e);
                    report.budget_denied = Some(e.to_string());
                    break;
                }
            };

            let mut contact = self.contact(service, url, copy, cancel).await;
            if contact.backend.is_some() {
                if let Err(e) = lease.consume(cost) {
                    debug!("Contact with {} not accounted: {}", service, e);
                }
            }
            lease.release();
            let estimate = self.content.estimate_availability(url).await.count;
            contact.estimate_after = estimate;
            report.contacts.push(contact);
            report.final_estimate = estimate;

            if estimate >= threshold {
                report.satisfied = true;
                info!(
                    "Availability of {} reached {} after {} attempts",
                    url,
                    estimate,
                    attempt + 1
                );
                break;
            }
        }

        if !report.satisfied {
            info!(
                "Giving up on {} at availability {} after {} attempts",
                url,
                report.final_estimate,
                report.attempts()
            );
        }
        report
    }

    async fn contact(
        &self,
        service: &HiddenServiceName,
        url: &str,
        copy: Option<&Resource>,
        cancel: &CancellationToken,
    ) -> SeederContact {
        let mut contact = SeederContact {
            service: service.to_string(),
            backend: None,
            accepted: false,
            detail: None,
            estimate_after: 0,
        };

        let exchange = async {
            let mut conn = self.hidden_services.connect(service, cancel).await?;
            contact.backend = Some(conn.backend().to_string());
            let decision = request_increase_availability(&mut conn, url, copy).await;
            let _ = conn.close().await;
            decision
        };

        match tokio::time::timeout(self.connect_timeout, exchange).await {
            Ok(Ok(decision)) => {
                contact.accepted = decision.accepted;
                contact.detail = decision.reason;
            }
            Ok(Err(e)) => contact.detail = Some(e.to_string()),
            Err(_) => contact.detail = Some(format!("timed out after {:?}", self.connect_timeout)),
        }
        debug!("Seeder {} for {}: {:?}", service, url, contact);
        contact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_manager::CacheManagerConfig;
    use crate::content_cache::{ContentCacheBackend, ContentCacheConfig};
    use crate::hidden_service::MultiplexerConfig;
    use crate::scheduler::SchedulerConfig;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct StubCache;

    #[async_trait]
    impl ContentCacheBackend for StubCache {
        fn id(&self) -> &str {
            "stub"
        }
        async fn fetch(&self, url: &str) -> Result<Option<Resource>> {
            Ok(Some(Resource::new(
                url,
                200,
                vec![("Cache-Control".into(), "max-age=600".into())],
                vec![0u8; 100],
            )))
        }
        async fn seed(&self, _resource: &Resource) -> Result<()> {
            Ok(())
        }
        async fn stop_seeding(&self, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn estimate_availability(&self, _url: &str) -> Result<u64> {
            Ok(1)
        }
    }

    fn seeder(dir: &TempDir, scheduler: SchedulerConfig) -> AltruisticSeeder {
        let content = Arc::new(ContentCacheMultiplexer::new(ContentCacheConfig::default()));
        content.register_backend(Arc::new(StubCache));
        let cache = CacheManager::open(
            CacheManagerConfig {
                disk_budget_bytes: 10_000,
                ..CacheManagerConfig::new(dir.path())
            },
            content,
        )
        .unwrap();
        let config = SeederConfig {
            fetch_estimate_bytes: 100,
            seed_duration_secs: 1,
            ..SeederConfig::default()
        };
        AltruisticSeeder::new(cache, ResourceScheduler::new(scheduler), config)
    }

    fn generous() -> SchedulerConfig {
        SchedulerConfig {
            bandwidth_capacity: 100_000,
            altruism_percent: 50,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_accepts_and_admits() {
        let dir = TempDir::new().unwrap();
        let seeder = seeder(&dir, generous());

        let decision = seeder
            .handle_increase_availability("https://example.org/a", None)
            .await;
        assert!(decision.accepted, "{:?}", decision);
        assert!(seeder.cache.get("https://example.org/a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refuses_when_budget_denied() {
        let dir = TempDir::new().unwrap();
        let seeder = seeder(
            &dir,
            SchedulerConfig {
                bandwidth_capacity: 100,
                altruism_percent: 10,
                ..SchedulerConfig::default()
            },
        );

        let decision = seeder
            .handle_increase_availability("https://example.org/a", None)
            .await;
        assert!(!decision.accepted);
        assert!(decision.reason.unwrap().starts_with("budget denied"));
        assert!(seeder.cache.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refuses_when_admission_rejected() {
        let dir = TempDir::new().unwrap();
        let mut seeder = seeder(&dir, generous());
        seeder.config.fetch_estimate_bytes = 1_000_000;

        let decision = seeder
            .handle_increase_availability("https://example.org/huge", None)
            .await;
        assert!(!decision.accepted);
        assert!(decision.reason.unwrap().starts_with("admission rejected"));
    }

    #[tokio::test]
    async fn test_uses_supplied_copy() {
        let dir = TempDir::new().unwrap();
        let seeder = seeder(&dir, generous());
        let copy = Resource::new("https://example.org/b", 200, Vec::new(), "mine");

        let decision = seeder
            .handle_increase_availability("https://example.org/b", Some(copy))
            .await;
        assert!(decision.accepted);
        let resident = seeder.cache.get("https://example.org/b").await.unwrap().unwrap();
        assert_eq!(resident.content().as_ref(), b"mine");
    }

    #[tokio::test]
    async fn test_supplied_copy_must_match_url() {
        let dir = TempDir::new().unwrap();
        let seeder = seeder(&dir, generous());
        let copy = Resource::new("https://other.example/", 200, Vec::new(), "x");

        let decision = seeder
            .handle_increase_availability("https://example.org/b", Some(copy))
            .await;
        assert!(!decision.accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seed_traffic_accounted_after_long_hold() {
        let dir = TempDir::new().unwrap();
        let mut seeder = seeder(
            &dir,
            SchedulerConfig {
                bandwidth_capacity: 100_000,
                bandwidth_refill_per_sec: 0,
                altruism_percent: 50,
                ..SchedulerConfig::default()
            },
        );
        seeder.config.seed_duration_secs = 3_600;
        assert!(seeder.config.seed_duration() > seeder.scheduler.lease_duration());

        let decision = seeder
            .handle_increase_availability("https://example.org/a", None)
            .await;
        assert!(decision.accepted, "{:?}", decision);

        tokio::time::sleep(Duration::from_secs(3_601)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // Fetch and seed share both consumed, none returned.
        let snapshot = seeder.scheduler.snapshot(BudgetKind::Bandwidth);
        assert_eq!(snapshot.outstanding, 0);
        assert_eq!(snapshot.available, 100_000 - 200);
    }

    #[tokio::test]
    async fn test_boost_stops_when_altruism_denied() {
        let content = Arc::new(ContentCacheMultiplexer::new(ContentCacheConfig::default()));
        content.register_backend(Arc::new(StubCache));
        let scheduler = ResourceScheduler::new(generous());
        scheduler.report_energy_level(0);
        let booster = AvailabilityBooster::new(
            Arc::new(HiddenServiceMultiplexer::new(MultiplexerConfig::default())),
            content,
            scheduler,
            SeederConfig::default(),
            Duration::from_secs(1),
        );

        let report = booster
            .boost(
                "https://example.org/a",
                &[HiddenServiceName::new("ceno-seeder")],
                None,
                &CancellationToken::new(),
            )
            .await;

        assert!(!report.satisfied);
        assert_eq!(report.attempts(), 0);
        assert!(report.budget_denied.is_some());
    }

    #[tokio::test]
    async fn test_request_over_connection() {
        let dir = TempDir::new().unwrap();
        let seeder = seeder(&dir, generous());
        let (a, b) = tokio::io::duplex(4096);
        let mut client = Connection::new("mock", Box::new(a));
        let server = Connection::new("mock", Box::new(b));
        tokio::spawn(async move { seeder.handle_connection(server).await });

        let decision = request_increase_availability(&mut client, "https://example.org/c", None)
            .await
            .unwrap();
        assert!(decision.accepted);
    }
}
