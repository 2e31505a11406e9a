//! CENO core - request resolution and cache orchestration for the CENO
//! censorship-circumvention overlay.
//!
//! A request is resolved through increasingly indirect strategies: a direct
//! origin fetch, a proxied fetch through an injector hidden service, and
//! finally a decentralized content cache. Alongside, nodes keep popular
//! resources available by seeding them within disk, bandwidth and energy
//! budgets.
//!
//! Concrete transports (I2P, IPFS, BitTorrent, ...) are plugged in through
//! [`HiddenServiceBackend`] and [`ContentCacheBackend`].
//!
//! # Example
//!
//! ```rust,ignore
//! use ceno_core::{CancellationToken, CenoConfig, CenoNode};
//!
//! #[tokio::main]
//! async fn main() -> ceno_core::Result<()> {
//!     let node = CenoNode::builder(CenoConfig::default())
//!         .hidden_service_backend(my_hidden_service_backend())
//!         .content_cache_backend(my_content_cache_backend())
//!         .build()
//!         .await?;
//!
//!     let resolved = node.resolve("https://example.org/", &CancellationToken::new()).await?;
//!     println!("{} via {}", resolved.resource.url(), resolved.stage);
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache_manager;
pub mod cancel;
pub mod config;
pub mod content_cache;
pub mod dispatcher;
pub mod error;
pub mod hidden_service;
pub mod injector;
pub mod node;
pub mod origin;
pub mod persist;
pub mod protocol;
pub mod race;
pub mod resource;
pub mod retry;
pub mod scheduler;
pub mod seeder;

// Re-export commonly used types
pub use cache_manager::{AdmissionDecision, AdmissionOutcome, CacheEntry, CacheManager, ScoringWeights};
pub use cancel::{CancellationToken, CancelledError};
pub use config::{CenoConfig, SeederConfig};
pub use content_cache::{
    AvailabilityEstimate, ContentCacheBackend, ContentCacheMultiplexer, FanOutReport,
};
pub use dispatcher::{DiagnosticKind, RequestDispatcher, Resolved, Stage, StageDiagnostic};
pub use error::{CenoError, Result, SourceFailure};
pub use hidden_service::{
    ByteStream, Connection, HiddenServiceBackend, HiddenServiceMultiplexer, HiddenServiceName,
};
pub use node::{CenoNode, CenoNodeBuilder};
pub use origin::{HttpOriginClient, OriginClient};
pub use race::{race, Attempt, RaceResult, SuccessCondition, SuccessLock};
pub use resource::{CacheDirectives, Resource};
pub use scheduler::{BudgetKind, Lease, Priority, ResourceScheduler};
pub use seeder::{AltruisticSeeder, AvailabilityBooster, BoostReport};
