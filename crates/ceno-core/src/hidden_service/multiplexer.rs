//! Fan-out of connect/host across hidden-service backends.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use super::{ConnectStrategy, Connection, DynHiddenServiceBackend, HiddenServiceName};
use crate::cancel::CancellationToken;
use crate::config::{CenoConfig, MultiplexDefaults};
use crate::error::SourceFailure;
use crate::race::{race, Attempt, RaceResult};
use crate::{CenoError, Result};

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// How long cancelled losers get to unwind after a connect race is won.
    pub connect_grace: Duration,
    pub strategy: ConnectStrategy,
    pub circuit: CircuitBreakerConfig,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            connect_grace: MultiplexDefaults::CONNECT_GRACE,
            strategy: ConnectStrategy::default(),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

impl From<&CenoConfig> for MultiplexerConfig {
    fn from(config: &CenoConfig) -> Self {
        Self {
            connect_grace: config.connect_grace(),
            strategy: config.connect_strategy,
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Clone)]
struct Registered {
    backend: DynHiddenServiceBackend,
    breaker: Arc<CircuitBreaker>,
}

/// Routes hidden-service operations to every registered backend.
pub struct HiddenServiceMultiplexer {
    backends: RwLock<Vec<Registered>>,
    config: MultiplexerConfig,
}

impl HiddenServiceMultiplexer {
    pub fn new(config: MultiplexerConfig) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Register a backend. A backend with the same id replaces the old one.
    pub fn register_backend(&self, backend: DynHiddenServiceBackend) {
        let id = backend.id().to_string();
        let breaker = Arc::new(CircuitBreaker::new(id.clone(), self.config.circuit.clone()));
        let mut backends = self.backends.write();
        backends.retain(|r| r.backend.id() != id);
        backends.push(Registered { backend, breaker });
        info!("Registered hidden-service backend: {}", id);
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends
            .read()
            .iter()
            .map(|r| r.backend.id().to_string())
            .collect()
    }

    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        self.backends.read().iter().map(|r| r.breaker.stats()).collect()
    }

    fn snapshot(&self) -> Vec<Registered> {
        self.backends.read().clone()
    }

    /// Connect to `name` through whichever backend gets there first.
    ///
    /// Backends that do not advertise `name` or whose circuit is open are
    /// skipped. Losers are cancelled and given the grace period to unwind.
    pub async fn connect(
        &self,
        name: &HiddenServiceName,
        cancel: &CancellationToken,
    ) -> Result<Connection> {
        match self.config.strategy {
            ConnectStrategy::FirstSuccess => self.connect_first_success(name, cancel).await,
        }
    }

    async fn connect_first_success(
        &self,
        name: &HiddenServiceName,
        cancel: &CancellationToken,
    ) -> Result<Connection> {
        let mut failures = Vec::new();
        let mut attempts = Vec::new();
        let mut breakers: HashMap<String, Arc<CircuitBreaker>> = HashMap::new();

        for entry in self.snapshot() {
            let id = entry.backend.id().to_string();
            if !entry.backend.supports(name) {
                failures.push(SourceFailure::new(id, "service not advertised"));
                continue;
            }
            if !entry.breaker.allow_request() {
                failures.push(SourceFailure::new(id, "known blocked (circuit open)"));
                continue;
            }

            let backend = Arc::clone(&entry.backend);
            let target = name.clone();
            attempts.push(Attempt::new(id.clone(), async move {
                backend.connect(&target).await
            }));
            breakers.insert(id, entry.breaker);
        }

        if attempts.is_empty() {
            debug!("No usable backend for {}", name);
            return Err(CenoError::ConnectionBlocked {
                name: name.to_string(),
                failures,
            });
        }

        debug!("Racing {} connect attempts to {}", attempts.len(), name);
        let result = race(attempts, cancel, self.config.connect_grace).await;

        // Breakers that see neither a success nor a failure get their trial
        // slot back, otherwise a cancelled half-open trial locks them out.
        let mut settled: HashSet<String> = HashSet::new();
        let outcome = match result {
            RaceResult::Success {
                value,
                source,
                cancelled,
                failures: lost,
            } => {
                for failure in &lost {
                    if let Some(breaker) = breakers.get(&failure.source) {
                        breaker.record_failure();
                        settled.insert(failure.source.clone());
                    }
                }
                if let Some(breaker) = breakers.get(&source) {
                    breaker.record_success();
                    settled.insert(source.clone());
                }
                if !cancelled.is_empty() {
                    debug!("Cancelled losing connects to {}: {:?}", name, cancelled);
                }
                info!("Connected to {} via {}", name, source);
                Ok(Connection::new(source, value))
            }
            RaceResult::AllFailed(_) if cancel.is_cancelled() => Err(CenoError::Cancelled),
            RaceResult::AllFailed(errors) => {
                for failure in &errors {
                    if let Some(breaker) = breakers.get(&failure.source) {
                        breaker.record_failure();
                        settled.insert(failure.source.clone());
                    }
                }
                failures.extend(errors);
                warn!("Connection to {} blocked on every backend", name);
                Err(CenoError::ConnectionBlocked {
                    name: name.to_string(),
                    failures,
                })
            }
        };

        for (id, breaker) in &breakers {
            if !settled.contains(id) {
                breaker.release_trial();
            }
        }
        outcome
    }

    /// Host `name` on every supporting backend and merge incoming connections.
    ///
    /// Each call builds an independent merge. Backends that fail to start
    /// listening are skipped; the call fails only if none can host.
    pub async fn host(&self, name: &HiddenServiceName) -> Result<BoxStream<'static, Connection>> {
        let mut failures = Vec::new();
        let mut streams = Vec::new();

        for entry in self.snapshot() {
            let id = entry.backend.id().to_string();
            if !entry.backend.supports(name) {
                failures.push(SourceFailure::new(id, "service not advertised"));
                continue;
            }
            match entry.backend.host(name).await {
                Ok(incoming) => {
                    debug!("Hosting {} on {}", name, id);
                    let tag = id.clone();
                    let tagged = incoming.filter_map(move |item| {
                        let tag = tag.clone();
                        async move {
                            match item {
                                Ok(stream) => Some(Connection::new(tag, stream)),
                                Err(e) => {
                                    warn!("Dropping failed incoming connection on {}: {}", tag, e);
                                    None
                                }
                            }
                        }
                    });
                    streams.push(tagged.boxed());
                }
                Err(e) => {
                    warn!("Backend {} cannot host {}: {}", id, name, e);
                    failures.push(SourceFailure::new(id, e.to_string()));
                }
            }
        }

        if streams.is_empty() {
            return Err(CenoError::HostUnavailable {
                name: name.to_string(),
                failures,
            });
        }

        info!("Hosting {} on {} backend(s)", name, streams.len());
        Ok(stream::select_all(streams).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hidden_service::{ByteStream, HiddenServiceBackend, IncomingStream};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingBackend {
        id: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HiddenServiceBackend for FailingBackend {
        fn id(&self) -> &str {
            self.id
        }
        fn supports(&self, _name: &HiddenServiceName) -> bool {
            true
        }
        async fn connect(&self, _name: &HiddenServiceName) -> Result<Box<dyn ByteStream>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CenoError::Network {
                message: "unreachable".into(),
            })
        }
        async fn host(&self, _name: &HiddenServiceName) -> Result<IncomingStream> {
            Err(CenoError::Network {
                message: "cannot listen".into(),
            })
        }
    }

    struct UnsupportedBackend;

    #[async_trait]
    impl HiddenServiceBackend for UnsupportedBackend {
        fn id(&self) -> &str {
            "unsupported"
        }
        fn supports(&self, _name: &HiddenServiceName) -> bool {
            false
        }
        async fn connect(&self, _name: &HiddenServiceName) -> Result<Box<dyn ByteStream>> {
            unreachable!("never advertised")
        }
        async fn host(&self, _name: &HiddenServiceName) -> Result<IncomingStream> {
            unreachable!("never advertised")
        }
    }

    /// Fails its first connect when `fail_first`, then connects after `delay`.
    struct ScriptedBackend {
        id: &'static str,
        fail_first: bool,
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HiddenServiceBackend for ScriptedBackend {
        fn id(&self) -> &str {
            self.id
        }
        fn supports(&self, _name: &HiddenServiceName) -> bool {
            true
        }
        async fn connect(&self, _name: &HiddenServiceName) -> Result<Box<dyn ByteStream>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(CenoError::Network {
                    message: "reset by firewall".into(),
                });
            }
            tokio::time::sleep(self.delay).await;
            let (near, _far) = tokio::io::duplex(64);
            Ok(Box::new(near))
        }
        async fn host(&self, _name: &HiddenServiceName) -> Result<IncomingStream> {
            Err(CenoError::Network {
                message: "cannot listen".into(),
            })
        }
    }

    fn mux(threshold: u32) -> HiddenServiceMultiplexer {
        HiddenServiceMultiplexer::new(MultiplexerConfig {
            connect_grace: Duration::from_millis(50),
            strategy: ConnectStrategy::FirstSuccess,
            circuit: CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
        })
    }

    #[tokio::test]
    async fn test_connect_without_backends_is_blocked() {
        let result = mux(3)
            .connect(&"injector".into(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CenoError::ConnectionBlocked { .. })));
    }

    #[tokio::test]
    async fn test_connect_reports_every_backend_reason() {
        let mux = mux(3);
        mux.register_backend(Arc::new(FailingBackend {
            id: "i2p",
            calls: AtomicU32::new(0),
        }));
        mux.register_backend(Arc::new(UnsupportedBackend));

        let err = mux
            .connect(&"injector".into(), &CancellationToken::new())
            .await
            .unwrap_err();

        let mut sources: Vec<_> = err
            .source_failures()
            .iter()
            .map(|f| f.source.as_str())
            .collect();
        sources.sort();
        assert_eq!(sources, vec!["i2p", "unsupported"]);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_backend() {
        let mux = mux(1);
        let backend = Arc::new(FailingBackend {
            id: "dht",
            calls: AtomicU32::new(0),
        });
        mux.register_backend(backend.clone());

        let name: HiddenServiceName = "injector".into();
        let cancel = CancellationToken::new();
        assert!(mux.connect(&name, &cancel).await.is_err());
        assert!(mux.connect(&name, &cancel).await.is_err());

        // Second connect was filtered by the open circuit.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(mux.circuit_stats()[0].state, crate::hidden_service::CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_backend_retried_after_losing_race() {
        let mux = HiddenServiceMultiplexer::new(MultiplexerConfig {
            connect_grace: Duration::from_millis(50),
            strategy: ConnectStrategy::FirstSuccess,
            circuit: CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(1),
                half_open_max_calls: 1,
            },
        });
        let slow = Arc::new(ScriptedBackend {
            id: "slow",
            fail_first: true,
            delay: Duration::from_millis(500),
            calls: AtomicU32::new(0),
        });
        let fast = Arc::new(ScriptedBackend {
            id: "fast",
            fail_first: false,
            delay: Duration::from_millis(10),
            calls: AtomicU32::new(0),
        });
        mux.register_backend(slow.clone());
        mux.register_backend(fast.clone());
        let name: HiddenServiceName = "injector".into();
        let cancel = CancellationToken::new();

        // "slow" fails once and its circuit opens.
        assert_eq!(mux.connect(&name, &cancel).await.unwrap().backend(), "fast");
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);

        // Every half-open trial loses to "fast" and is cancelled, which must
        // not use up the trial slot for good.
        for round in 2..=5 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert_eq!(mux.connect(&name, &cancel).await.unwrap().backend(), "fast");
            assert_eq!(slow.calls.load(Ordering::SeqCst), round);
        }
        let slow_state = mux
            .circuit_stats()
            .into_iter()
            .find(|s| s.backend == "slow")
            .unwrap()
            .state;
        assert_eq!(slow_state, crate::hidden_service::CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_caller_cancel_returns_trial_slots() {
        let mux = HiddenServiceMultiplexer::new(MultiplexerConfig {
            connect_grace: Duration::from_millis(50),
            strategy: ConnectStrategy::FirstSuccess,
            circuit: CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::ZERO,
                half_open_max_calls: 1,
            },
        });
        let backend = Arc::new(ScriptedBackend {
            id: "i2p",
            fail_first: true,
            delay: Duration::from_secs(60),
            calls: AtomicU32::new(0),
        });
        mux.register_backend(backend.clone());
        let name: HiddenServiceName = "injector".into();

        assert!(mux.connect(&name, &CancellationToken::new()).await.is_err());

        // Each later trial hangs until the caller gives up; the slot it held
        // must be free again for the next caller.
        for round in 2..=3 {
            let cancel = CancellationToken::new();
            let canceller = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                canceller.cancel();
            });
            let result = mux.connect(&name, &cancel).await;
            assert!(matches!(result, Err(CenoError::Cancelled)));
            assert_eq!(backend.calls.load(Ordering::SeqCst), round);
        }
    }

    #[tokio::test]
    async fn test_host_fails_only_when_every_backend_fails() {
        let mux = mux(3);
        mux.register_backend(Arc::new(FailingBackend {
            id: "i2p",
            calls: AtomicU32::new(0),
        }));
        let result = mux.host(&"seeder".into()).await;
        assert!(matches!(result, Err(CenoError::HostUnavailable { .. })));
    }

    #[test]
    fn test_register_replaces_same_id() {
        let mux = mux(3);
        mux.register_backend(Arc::new(UnsupportedBackend));
        mux.register_backend(Arc::new(UnsupportedBackend));
        assert_eq!(mux.backend_ids(), vec!["unsupported".to_string()]);
    }
}
