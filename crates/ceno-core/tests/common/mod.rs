//! In-memory backends shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ceno_core::hidden_service::IncomingStream;
use ceno_core::{
    ByteStream, CenoError, ContentCacheBackend, HiddenServiceBackend, HiddenServiceName, Resource,
    Result,
};
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;

/// Sets its flag when dropped; used to observe cancelled attempts.
pub struct DropFlag(pub Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehaviour {
    /// Hand out a stream to one of the hosted listeners after `delay`.
    Deliver { delay: Duration },
    /// Never complete.
    Hang,
    /// Fail immediately.
    Refuse,
}

type Listener = mpsc::UnboundedSender<Result<Box<dyn ByteStream>>>;

/// A hidden-service transport that loops connections back in-process.
///
/// Every `host` call adds a listener for the name; `connect` hands the
/// server half of a duplex pipe to the listeners in round-robin order,
/// like a load-balanced group of nodes.
pub struct LoopbackBackend {
    id: String,
    behaviour: ConnectBehaviour,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    next: AtomicUsize,
    pub connects: AtomicUsize,
    pub abandoned: Arc<AtomicBool>,
}

impl LoopbackBackend {
    pub fn new(id: &str, behaviour: ConnectBehaviour) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            behaviour,
            listeners: Mutex::new(HashMap::new()),
            next: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            abandoned: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners
            .lock()
            .get(name)
            .map(|l| l.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Wait until `count` listeners for `name` are registered.
    pub async fn wait_for_listeners(&self, name: &str, count: usize) {
        for _ in 0..200 {
            if self.listener_count(name) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("listeners for {} never came up", name);
    }
}

#[async_trait]
impl HiddenServiceBackend for LoopbackBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, _name: &HiddenServiceName) -> bool {
        true
    }

    async fn connect(&self, name: &HiddenServiceName) -> Result<Box<dyn ByteStream>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            ConnectBehaviour::Refuse => Err(CenoError::Network {
                message: format!("{} is blocked here", name),
            }),
            ConnectBehaviour::Hang => {
                let _flag = DropFlag(Arc::clone(&self.abandoned));
                futures::future::pending().await
            }
            ConnectBehaviour::Deliver { delay } => {
                tokio::time::sleep(delay).await;
                let listener = {
                    let listeners = self.listeners.lock();
                    let open: Vec<Listener> = listeners
                        .get(name.as_str())
                        .map(|l| l.iter().filter(|tx| !tx.is_closed()).cloned().collect())
                        .unwrap_or_default();
                    if open.is_empty() {
                        None
                    } else {
                        Some(open[self.next.fetch_add(1, Ordering::SeqCst) % open.len()].clone())
                    }
                };
                let Some(listener) = listener else {
                    return Err(CenoError::Network {
                        message: format!("nobody hosts {}", name),
                    });
                };

                let (client, server) = tokio::io::duplex(256 * 1024);
                listener
                    .unbounded_send(Ok(Box::new(server)))
                    .map_err(|_| CenoError::Network {
                        message: format!("host of {} went away", name),
                    })?;
                Ok(Box::new(client))
            }
        }
    }

    async fn host(&self, name: &HiddenServiceName) -> Result<IncomingStream> {
        let (tx, rx) = mpsc::unbounded();
        self.listeners
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(tx);
        Ok(rx.boxed())
    }
}

/// Shared state of a simulated content-cache swarm.
#[derive(Default)]
pub struct Swarm {
    objects: Mutex<HashMap<String, Resource>>,
    copies: Mutex<HashMap<String, u64>>,
}

impl Swarm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Put `resource` in the swarm as if `copies` peers held it.
    pub fn publish(&self, resource: Resource, copies: u64) {
        self.copies.lock().insert(resource.url().to_string(), copies);
        self.objects.lock().insert(resource.url().to_string(), resource);
    }

    pub fn copies(&self, url: &str) -> u64 {
        self.copies.lock().get(url).copied().unwrap_or(0)
    }
}

/// One peer's view of a [`Swarm`].
pub struct SwarmPeer {
    id: String,
    swarm: Arc<Swarm>,
    accept_seeds: bool,
    seeding: Mutex<HashSet<String>>,
    pub seed_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl SwarmPeer {
    pub fn new(id: &str, swarm: Arc<Swarm>) -> Arc<Self> {
        Self::build(id, swarm, true)
    }

    pub fn rejecting(id: &str, swarm: Arc<Swarm>) -> Arc<Self> {
        Self::build(id, swarm, false)
    }

    fn build(id: &str, swarm: Arc<Swarm>, accept_seeds: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            swarm,
            accept_seeds,
            seeding: Mutex::new(HashSet::new()),
            seed_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        })
    }

    pub fn is_seeding(&self, url: &str) -> bool {
        self.seeding.lock().contains(url)
    }
}

#[async_trait]
impl ContentCacheBackend for SwarmPeer {
    fn id(&self) -> &str {
        &self.id
    }

    fn counts_distinct_copies(&self) -> bool {
        false
    }

    async fn fetch(&self, url: &str) -> Result<Option<Resource>> {
        Ok(self.swarm.objects.lock().get(url).cloned())
    }

    async fn seed(&self, resource: &Resource) -> Result<()> {
        self.seed_calls.fetch_add(1, Ordering::SeqCst);
        if !self.accept_seeds {
            return Err(CenoError::Other("peer refuses new content".into()));
        }
        if self.seeding.lock().insert(resource.url().to_string()) {
            *self
                .swarm
                .copies
                .lock()
                .entry(resource.url().to_string())
                .or_default() += 1;
            self.swarm
                .objects
                .lock()
                .entry(resource.url().to_string())
                .or_insert_with(|| resource.clone());
        }
        Ok(())
    }

    async fn stop_seeding(&self, url: &str) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.seeding.lock().remove(url) {
            if let Some(count) = self.swarm.copies.lock().get_mut(url) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn estimate_availability(&self, url: &str) -> Result<u64> {
        Ok(self.swarm.copies(url))
    }
}

/// Cacheable test resource of `size` bytes.
pub fn resource(url: &str, size: usize) -> Resource {
    Resource::new(
        url,
        200,
        vec![("Cache-Control".into(), "max-age=3600".into())],
        vec![b'x'; size],
    )
}
