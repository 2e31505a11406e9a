//! Budget leasing for bandwidth and energy.
//!
//! The scheduler tracks two budgets:
//! - **Bandwidth**: a token bucket (capacity + refill rate). Altruistic work
//!   additionally draws from a smaller bucket sized as a percentage of the
//!   main one.
//! - **Energy**: depletion-only. Below the battery floor every altruistic
//!   request is denied outright, bandwidth ones included.
//!
//! Essential leases (direct user requests) are never denied, only delayed
//! until they fit. Altruistic leases are denied instead of delayed.
//!
//! All budget state sits behind one mutex, so concurrent requests and
//! releases are serialized and cannot lose updates.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{CenoConfig, SchedulerDefaults};
use crate::{CenoError, Result};

/// Which budget a lease draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetKind {
    Bandwidth,
    Energy,
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetKind::Bandwidth => write!(f, "bandwidth"),
            BudgetKind::Energy => write!(f, "energy"),
        }
    }
}

/// Whether work is on behalf of the local user or altruistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Direct user requests: throttled, never denied.
    Essential,
    /// Seeding and other voluntary work: denied when over budget.
    Altruistic,
}

/// Scheduler budget configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub bandwidth_capacity: u64,
    pub bandwidth_refill_per_sec: u64,
    pub altruism_percent: u8,
    pub energy_capacity: u64,
    pub battery_floor_percent: u8,
    pub lease_duration: Duration,
    /// Upper bound on a single throttling sleep before budgets are rechecked.
    pub max_throttle_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bandwidth_capacity: SchedulerDefaults::BANDWIDTH_CAPACITY_BYTES,
            bandwidth_refill_per_sec: SchedulerDefaults::BANDWIDTH_REFILL_BYTES_PER_SEC,
            altruism_percent: SchedulerDefaults::ALTRUISM_PERCENT,
            energy_capacity: SchedulerDefaults::ENERGY_CAPACITY,
            battery_floor_percent: SchedulerDefaults::BATTERY_FLOOR_PERCENT,
            lease_duration: SchedulerDefaults::LEASE_DURATION,
            max_throttle_wait: SchedulerDefaults::MAX_THROTTLE_WAIT,
        }
    }
}

impl From<&CenoConfig> for SchedulerConfig {
    fn from(config: &CenoConfig) -> Self {
        Self {
            bandwidth_capacity: config.bandwidth_capacity_bytes,
            bandwidth_refill_per_sec: config.bandwidth_refill_bytes_per_sec,
            altruism_percent: config.altruism_percent,
            energy_capacity: config.energy_capacity,
            battery_floor_percent: config.battery_floor_percent,
            ..Default::default()
        }
    }
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: u64, refill_per_sec: u64) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
    }

    fn has(&self, amount: u64) -> bool {
        self.tokens >= amount as f64
    }

    fn take(&mut self, amount: u64) {
        self.tokens = (self.tokens - amount as f64).max(0.0);
    }

    fn give_back(&mut self, amount: u64) {
        self.tokens = (self.tokens + amount as f64).min(self.capacity);
    }

    /// Time until `amount` tokens will be available.
    fn wait_for(&self, amount: u64) -> Duration {
        let needed = amount as f64 - self.tokens;
        if needed <= 0.0 || self.refill_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(needed / self.refill_per_sec)
    }
}

struct BandwidthBudget {
    capacity: u64,
    outstanding: u64,
    main: TokenBucket,
    altruistic: TokenBucket,
}

struct EnergyBudget {
    capacity: u64,
    outstanding: u64,
    remaining: u64,
    floor: u64,
}

enum Grant {
    Granted(u64),
    Denied { available: u64 },
    Wait(Duration),
}

struct Budgets {
    bandwidth: BandwidthBudget,
    energy: EnergyBudget,
    next_lease_id: u64,
    shut_down: bool,
}

impl Budgets {
    fn try_grant(&mut self, kind: BudgetKind, amount: u64, priority: Priority) -> Grant {
        match kind {
            BudgetKind::Bandwidth => self.try_grant_bandwidth(amount, priority),
            BudgetKind::Energy => self.try_grant_energy(amount, priority),
        }
    }

    fn try_grant_bandwidth(&mut self, amount: u64, priority: Priority) -> Grant {
        let below_energy_floor = self.energy.remaining < self.energy.floor;
        let budget = &mut self.bandwidth;
        let now = Instant::now();
        budget.main.refill(now);
        budget.altruistic.refill(now);

        match priority {
            Priority::Essential => {
                // Clamp so an oversized request can still be granted eventually.
                let amount = amount.min(budget.capacity);
                if budget.outstanding + amount > budget.capacity {
                    return Grant::Wait(Duration::ZERO);
                }
                if !budget.main.has(amount) {
                    return Grant::Wait(budget.main.wait_for(amount));
                }
                budget.main.take(amount);
                budget.outstanding += amount;
                Grant::Granted(amount)
            }
            Priority::Altruistic => {
                if below_energy_floor {
                    return Grant::Denied { available: 0 };
                }
                let headroom = budget.capacity.saturating_sub(budget.outstanding);
                let available = (budget.altruistic.tokens as u64)
                    .min(budget.main.tokens as u64)
                    .min(headroom);
                if amount > available {
                    return Grant::Denied { available };
                }
                budget.main.take(amount);
                budget.altruistic.take(amount);
                budget.outstanding += amount;
                Grant::Granted(amount)
            }
        }
    }

    fn try_grant_energy(&mut self, amount: u64, priority: Priority) -> Grant {
        let budget = &mut self.energy;
        match priority {
            Priority::Essential => {
                let amount = amount.min(budget.capacity);
                if budget.outstanding + amount > budget.capacity {
                    return Grant::Wait(Duration::ZERO);
                }
                budget.remaining = budget.remaining.saturating_sub(amount);
                budget.outstanding += amount;
                Grant::Granted(amount)
            }
            Priority::Altruistic => {
                let above_floor = budget.remaining.saturating_sub(budget.floor);
                let headroom = budget.capacity.saturating_sub(budget.outstanding);
                let available = above_floor.min(headroom);
                if budget.remaining < budget.floor || amount > available {
                    return Grant::Denied { available };
                }
                budget.remaining -= amount;
                budget.outstanding += amount;
                Grant::Granted(amount)
            }
        }
    }

    fn release(&mut self, kind: BudgetKind, priority: Priority, granted: u64, consumed: u64) {
        let unused = granted.saturating_sub(consumed);
        match kind {
            BudgetKind::Bandwidth => {
                let budget = &mut self.bandwidth;
                budget.outstanding = budget.outstanding.saturating_sub(granted);
                budget.main.give_back(unused);
                if priority == Priority::Altruistic {
                    budget.altruistic.give_back(unused);
                }
            }
            BudgetKind::Energy => {
                let budget = &mut self.energy;
                budget.outstanding = budget.outstanding.saturating_sub(granted);
                budget.remaining = (budget.remaining + unused).min(budget.capacity);
            }
        }
    }
}

struct SchedulerInner {
    budgets: Mutex<Budgets>,
    released: Notify,
    shutdown: CancellationToken,
    config: SchedulerConfig,
}

/// Point-in-time view of one budget.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetSnapshot {
    pub kind: BudgetKind,
    pub capacity: u64,
    /// Sum of granted amounts of leases not yet released.
    pub outstanding: u64,
    /// Bandwidth tokens in the main bucket, or remaining energy.
    pub available: u64,
}

/// Shared, long-lived budget scheduler. Cheap to clone.
#[derive(Clone)]
pub struct ResourceScheduler {
    inner: Arc<SchedulerInner>,
}

impl ResourceScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let pct = |value: u64| value * u64::from(config.altruism_percent) / 100;
        let floor = config.energy_capacity * u64::from(config.battery_floor_percent) / 100;

        info!(
            "Resource scheduler: bandwidth {} bytes @ {}/s ({}% altruistic), energy {} (floor {})",
            config.bandwidth_capacity,
            config.bandwidth_refill_per_sec,
            config.altruism_percent,
            config.energy_capacity,
            floor
        );

        let budgets = Budgets {
            bandwidth: BandwidthBudget {
                capacity: config.bandwidth_capacity,
                outstanding: 0,
                main: TokenBucket::new(config.bandwidth_capacity, config.bandwidth_refill_per_sec),
                altruistic: TokenBucket::new(
                    pct(config.bandwidth_capacity),
                    pct(config.bandwidth_refill_per_sec),
                ),
            },
            energy: EnergyBudget {
                capacity: config.energy_capacity,
                outstanding: 0,
                remaining: config.energy_capacity,
                floor,
            },
            next_lease_id: 1,
            shut_down: false,
        };

        Self {
            inner: Arc::new(SchedulerInner {
                budgets: Mutex::new(budgets),
                released: Notify::new(),
                shutdown: CancellationToken::new(),
                config,
            }),
        }
    }

    /// Request a lease of `amount` units of `kind`.
    ///
    /// Essential requests wait until the budget allows them; altruistic
    /// requests fail with [`CenoError::ResourceBudgetExceeded`] instead.
    pub async fn request_lease(
        &self,
        kind: BudgetKind,
        amount: u64,
        priority: Priority,
    ) -> Result<Lease> {
        self.request_lease_for(kind, amount, priority, self.inner.config.lease_duration)
            .await
    }

    /// Like [`request_lease`](Self::request_lease), for a lease that stays
    /// consumable for `duration` instead of the configured default.
    pub async fn request_lease_for(
        &self,
        kind: BudgetKind,
        amount: u64,
        priority: Priority,
        duration: Duration,
    ) -> Result<Lease> {
        loop {
            let wait = {
                let mut budgets = self.inner.budgets.lock();
                if budgets.shut_down {
                    return Err(CenoError::SchedulerShutdown);
                }

                match budgets.try_grant(kind, amount, priority) {
                    Grant::Granted(granted) => {
                        let id = budgets.next_lease_id;
                        budgets.next_lease_id += 1;
                        debug!("Lease #{} granted: {} {} ({:?})", id, granted, kind, priority);
                        return Ok(Lease {
                            id,
                            kind,
                            priority,
                            granted,
                            consumed: AtomicU64::new(0),
                            expires_at: Instant::now() + duration,
                            cancel: self.inner.shutdown.child_token(),
                            scheduler: Some(Arc::clone(&self.inner)),
                        });
                    }
                    Grant::Denied { available } => {
                        debug!(
                            "Lease denied: {} {} requested, {} available",
                            amount, kind, available
                        );
                        return Err(CenoError::ResourceBudgetExceeded {
                            kind: kind.to_string(),
                            requested: amount,
                            available,
                        });
                    }
                    Grant::Wait(wait) => wait,
                }
            };

            let wait = if wait.is_zero() {
                self.inner.config.max_throttle_wait
            } else {
                wait.min(self.inner.config.max_throttle_wait)
            };
            debug!("Throttling essential {} lease of {} for {:?}", kind, amount, wait);

            tokio::select! {
                _ = self.inner.released.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = self.inner.shutdown.cancelled() => return Err(CenoError::SchedulerShutdown),
            }
        }
    }

    /// Default validity of a lease.
    pub fn lease_duration(&self) -> Duration {
        self.inner.config.lease_duration
    }

    /// Update the remaining energy (e.g. from a battery reading).
    pub fn report_energy_level(&self, remaining: u64) {
        let mut budgets = self.inner.budgets.lock();
        let energy = &mut budgets.energy;
        energy.remaining = remaining.min(energy.capacity);
        if energy.remaining < energy.floor {
            warn!(
                "Energy level {} below floor {}, altruistic work suspended",
                energy.remaining, energy.floor
            );
        }
    }

    /// Whether the energy budget is below the altruism floor.
    pub fn below_energy_floor(&self) -> bool {
        let budgets = self.inner.budgets.lock();
        budgets.energy.remaining < budgets.energy.floor
    }

    pub fn snapshot(&self, kind: BudgetKind) -> BudgetSnapshot {
        let mut budgets = self.inner.budgets.lock();
        match kind {
            BudgetKind::Bandwidth => {
                let bandwidth = &mut budgets.bandwidth;
                bandwidth.main.refill(Instant::now());
                BudgetSnapshot {
                    kind,
                    capacity: bandwidth.capacity,
                    outstanding: bandwidth.outstanding,
                    available: bandwidth.main.tokens as u64,
                }
            }
            BudgetKind::Energy => BudgetSnapshot {
                kind,
                capacity: budgets.energy.capacity,
                outstanding: budgets.energy.outstanding,
                available: budgets.energy.remaining,
            },
        }
    }

    /// Stop granting leases and cancel every outstanding lease's token.
    pub fn shutdown(&self) {
        let mut budgets = self.inner.budgets.lock();
        if budgets.shut_down {
            return;
        }
        budgets.shut_down = true;
        drop(budgets);

        self.inner.shutdown.cancel();
        self.inner.released.notify_waiters();
        info!("Resource scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.budgets.lock().shut_down
    }
}

/// A scheduler-issued grant. Released exactly once: explicitly via
/// [`release`](Lease::release) or on drop. Unused budget is returned.
pub struct Lease {
    id: u64,
    kind: BudgetKind,
    priority: Priority,
    granted: u64,
    consumed: AtomicU64,
    expires_at: Instant,
    cancel: CancellationToken,
    scheduler: Option<Arc<SchedulerInner>>,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> BudgetKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn granted(&self) -> u64 {
        self.granted
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> u64 {
        self.granted.saturating_sub(self.consumed())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time until the lease expires, zero once it has.
    pub fn time_left(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Fires when the scheduler shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record consumption. Fails if it would exceed the grant or the lease
    /// has expired or been cancelled.
    pub fn consume(&self, amount: u64) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CenoError::SchedulerShutdown);
        }
        if self.is_expired() {
            return Err(CenoError::ResourceBudgetExceeded {
                kind: self.kind.to_string(),
                requested: amount,
                available: 0,
            });
        }

        self.consumed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |consumed| {
                let total = consumed.checked_add(amount)?;
                (total <= self.granted).then_some(total)
            })
            .map(|_| ())
            .map_err(|consumed| CenoError::ResourceBudgetExceeded {
                kind: self.kind.to_string(),
                requested: amount,
                available: self.granted.saturating_sub(consumed),
            })
    }

    /// Release the lease, returning the unused amount to the budget.
    pub fn release(mut self) -> u64 {
        self.release_inner()
    }

    fn release_inner(&mut self) -> u64 {
        let Some(scheduler) = self.scheduler.take() else {
            return 0;
        };
        let consumed = self.consumed();
        scheduler
            .budgets
            .lock()
            .release(self.kind, self.priority, self.granted, consumed);
        scheduler.released.notify_waiters();
        debug!(
            "Lease #{} released: {}/{} {} consumed",
            self.id, consumed, self.granted, self.kind
        );
        self.granted.saturating_sub(consumed)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("granted", &self.granted)
            .field("consumed", &self.consumed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: u64, refill: u64) -> SchedulerConfig {
        SchedulerConfig {
            bandwidth_capacity: capacity,
            bandwidth_refill_per_sec: refill,
            altruism_percent: 50,
            energy_capacity: 1_000,
            battery_floor_percent: 30,
            lease_duration: Duration::from_secs(60),
            max_throttle_wait: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_essential_lease_returns_unused_budget() {
        let scheduler = ResourceScheduler::new(config(1_000, 1));
        let lease = scheduler
            .request_lease(BudgetKind::Bandwidth, 400, Priority::Essential)
            .await
            .unwrap();
        assert_eq!(lease.granted(), 400);

        lease.consume(100).unwrap();
        assert_eq!(scheduler.snapshot(BudgetKind::Bandwidth).outstanding, 400);

        assert_eq!(lease.release(), 300);
        let snapshot = scheduler.snapshot(BudgetKind::Bandwidth);
        assert_eq!(snapshot.outstanding, 0);
        assert!(snapshot.available >= 900);
    }

    #[tokio::test]
    async fn test_consumption_bounded_by_grant() {
        let scheduler = ResourceScheduler::new(config(1_000, 1));
        let lease = scheduler
            .request_lease(BudgetKind::Bandwidth, 100, Priority::Essential)
            .await
            .unwrap();

        lease.consume(80).unwrap();
        assert!(matches!(
            lease.consume(30),
            Err(CenoError::ResourceBudgetExceeded { available: 20, .. })
        ));
        assert_eq!(lease.consumed(), 80);
    }

    #[tokio::test]
    async fn test_altruistic_limited_to_share() {
        let scheduler = ResourceScheduler::new(config(1_000, 1));

        // 50% altruism share = 500 bytes.
        let first = scheduler
            .request_lease(BudgetKind::Bandwidth, 400, Priority::Altruistic)
            .await
            .unwrap();
        let denied = scheduler
            .request_lease(BudgetKind::Bandwidth, 200, Priority::Altruistic)
            .await;
        assert!(matches!(
            denied,
            Err(CenoError::ResourceBudgetExceeded { .. })
        ));
        drop(first);
    }

    #[tokio::test]
    async fn test_outstanding_never_exceeds_capacity() {
        let scheduler = ResourceScheduler::new(SchedulerConfig {
            altruism_percent: 100,
            ..config(1_000, 1)
        });

        let mut leases = Vec::new();
        for _ in 0..20 {
            if let Ok(lease) = scheduler
                .request_lease(BudgetKind::Bandwidth, 150, Priority::Altruistic)
                .await
            {
                leases.push(lease);
            }
        }

        let granted: u64 = leases.iter().map(Lease::granted).sum();
        assert!(granted <= 1_000);
        assert_eq!(leases.len(), 6);
        assert_eq!(scheduler.snapshot(BudgetKind::Bandwidth).outstanding, granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_essential_throttled_not_denied() {
        let scheduler = ResourceScheduler::new(config(1_000, 1_000));
        let first = scheduler
            .request_lease(BudgetKind::Bandwidth, 1_000, Priority::Essential)
            .await
            .unwrap();
        first.consume(1_000).unwrap();
        first.release();

        let start = Instant::now();
        let second = scheduler
            .request_lease(BudgetKind::Bandwidth, 500, Priority::Essential)
            .await
            .unwrap();
        assert_eq!(second.granted(), 500);
        assert!(start.elapsed() >= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn test_oversized_essential_request_is_clamped() {
        let scheduler = ResourceScheduler::new(config(1_000, 1));
        let lease = scheduler
            .request_lease(BudgetKind::Bandwidth, 5_000, Priority::Essential)
            .await
            .unwrap();
        assert_eq!(lease.granted(), 1_000);
    }

    #[tokio::test]
    async fn test_battery_floor_denies_altruistic() {
        let scheduler = ResourceScheduler::new(config(1_000, 1));
        scheduler.report_energy_level(200); // floor is 300
        assert!(scheduler.below_energy_floor());

        let denied = scheduler
            .request_lease(BudgetKind::Energy, 1, Priority::Altruistic)
            .await;
        assert!(matches!(
            denied,
            Err(CenoError::ResourceBudgetExceeded { .. })
        ));
        assert!(scheduler
            .request_lease(BudgetKind::Bandwidth, 1, Priority::Altruistic)
            .await
            .is_err());

        let essential = scheduler
            .request_lease(BudgetKind::Energy, 50, Priority::Essential)
            .await
            .unwrap();
        assert_eq!(essential.granted(), 50);
    }

    #[tokio::test]
    async fn test_altruistic_energy_cannot_cross_floor() {
        let scheduler = ResourceScheduler::new(config(1_000, 1));

        // 1000 remaining, floor 300: 700 available to altruistic work.
        assert!(scheduler
            .request_lease(BudgetKind::Energy, 800, Priority::Altruistic)
            .await
            .is_err());
        let lease = scheduler
            .request_lease(BudgetKind::Energy, 700, Priority::Altruistic)
            .await
            .unwrap();
        lease.consume(700).unwrap();
        lease.release();

        assert_eq!(scheduler.snapshot(BudgetKind::Energy).available, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_validity_follows_requested_duration() {
        let scheduler = ResourceScheduler::new(config(1_000, 1));
        let short = scheduler
            .request_lease(BudgetKind::Energy, 10, Priority::Essential)
            .await
            .unwrap();
        let long = scheduler
            .request_lease_for(
                BudgetKind::Energy,
                10,
                Priority::Essential,
                Duration::from_secs(300),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(short.is_expired());
        assert!(short.consume(1).is_err());
        assert_eq!(long.time_left(), Duration::from_secs(180));
        long.consume(10).unwrap();
    }

    #[tokio::test]
    async fn test_dropped_lease_released() {
        let scheduler = ResourceScheduler::new(config(1_000, 1));
        {
            let _lease = scheduler
                .request_lease(BudgetKind::Energy, 100, Priority::Essential)
                .await
                .unwrap();
            assert_eq!(scheduler.snapshot(BudgetKind::Energy).outstanding, 100);
        }
        let snapshot = scheduler.snapshot(BudgetKind::Energy);
        assert_eq!(snapshot.outstanding, 0);
        assert_eq!(snapshot.available, 1_000);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_leases_and_denies_requests() {
        let scheduler = ResourceScheduler::new(config(1_000, 1));
        let lease = scheduler
            .request_lease(BudgetKind::Bandwidth, 10, Priority::Essential)
            .await
            .unwrap();

        scheduler.shutdown();

        assert!(lease.cancellation().is_cancelled());
        assert!(matches!(lease.consume(1), Err(CenoError::SchedulerShutdown)));
        assert!(matches!(
            scheduler
                .request_lease(BudgetKind::Bandwidth, 10, Priority::Essential)
                .await,
            Err(CenoError::SchedulerShutdown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_throttled_request() {
        let scheduler = ResourceScheduler::new(config(100, 1));
        let _held = scheduler
            .request_lease(BudgetKind::Bandwidth, 100, Priority::Essential)
            .await
            .unwrap();

        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .request_lease(BudgetKind::Bandwidth, 50, Priority::Essential)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.shutdown();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CenoError::SchedulerShutdown)));
    }
}
