//! Centralized configuration for a CENO node.
//!
//! Default values live in unit structs with associated constants; the
//! runtime-tunable surface is [`CenoConfig`], persisted as JSON.

use crate::cache_manager::ScoringWeights;
use crate::hidden_service::ConnectStrategy;
use crate::persist::{atomic_read_json, atomic_write_json};
use crate::{CenoError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Request dispatcher defaults.
pub struct DispatchDefaults;

impl DispatchDefaults {
    pub const STAGE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const ORIGIN_RETRY_ATTEMPTS: u32 = 2;
    pub const ORIGIN_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
    pub const INJECTOR_SERVICE: &'static str = "ceno-injector";
}

/// Multiplexer defaults.
pub struct MultiplexDefaults;

impl MultiplexDefaults {
    pub const CONNECT_GRACE: Duration = Duration::from_millis(500);
    pub const ESTIMATE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 3;
    pub const CIRCUIT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);
}

/// Cache manager defaults.
pub struct CacheDefaults;

impl CacheDefaults {
    pub const DISK_BUDGET_BYTES: u64 = 1_073_741_824; // 1GB
    pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
    pub const INDEX_FILENAME: &'static str = "index.json";
    pub const OBJECTS_DIR_NAME: &'static str = "objects";
    pub const QUEUE_DEPTH: usize = 64;
}

/// Resource scheduler defaults.
pub struct SchedulerDefaults;

impl SchedulerDefaults {
    pub const BANDWIDTH_CAPACITY_BYTES: u64 = 8_388_608; // 8MB burst
    pub const BANDWIDTH_REFILL_BYTES_PER_SEC: u64 = 1_048_576; // 1MB/s
    pub const ALTRUISM_PERCENT: u8 = 20;
    pub const ENERGY_CAPACITY: u64 = 100_000;
    pub const BATTERY_FLOOR_PERCENT: u8 = 30;
    pub const LEASE_DURATION: Duration = Duration::from_secs(600);
    pub const MAX_THROTTLE_WAIT: Duration = Duration::from_millis(250);
}

/// Altruistic seeder defaults.
pub struct SeederDefaults;

impl SeederDefaults {
    pub const MAX_ATTEMPTS: u32 = 5;
    pub const SATISFACTORY_AVAILABILITY: u64 = 3;
    pub const SEED_DURATION: Duration = Duration::from_secs(3_600);
    pub const FETCH_ESTIMATE_BYTES: u64 = 262_144; // 256KB
    /// Bandwidth charged per seeder contact, on top of any supplied copy.
    pub const CONTACT_BYTES: u64 = 4_096;
    pub const SEEDER_SERVICE: &'static str = "ceno-seeder";
}

/// Wire protocol limits.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB
}

/// Altruistic seeder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SeederConfig {
    /// Maximum seeder nodes contacted per boost (`K`).
    pub max_attempts: u32,
    /// Availability at which a boost stops early.
    pub satisfactory_availability: u64,
    /// How long an altruistically admitted resource is leased for seeding.
    pub seed_duration_secs: u64,
    /// Size assumed for a resource before it has been fetched.
    pub fetch_estimate_bytes: u64,
    /// Hidden-service name seeders are hosted under.
    pub service: String,
}

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            max_attempts: SeederDefaults::MAX_ATTEMPTS,
            satisfactory_availability: SeederDefaults::SATISFACTORY_AVAILABILITY,
            seed_duration_secs: SeederDefaults::SEED_DURATION.as_secs(),
            fetch_estimate_bytes: SeederDefaults::FETCH_ESTIMATE_BYTES,
            service: SeederDefaults::SEEDER_SERVICE.to_string(),
        }
    }
}

impl SeederConfig {
    pub fn seed_duration(&self) -> Duration {
        Duration::from_secs(self.seed_duration_secs)
    }
}

/// Node-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CenoConfig {
    /// Directory holding the cache index and resource bodies.
    pub cache_dir: PathBuf,
    /// Upper bound on resident cache bytes.
    pub disk_budget_bytes: u64,
    /// Bandwidth token-bucket capacity.
    pub bandwidth_capacity_bytes: u64,
    /// Bandwidth token-bucket refill rate.
    pub bandwidth_refill_bytes_per_sec: u64,
    /// Share of the bandwidth budget available to altruistic work.
    pub altruism_percent: u8,
    /// Energy budget in abstract units.
    pub energy_capacity: u64,
    /// Energy level (percent of capacity) below which altruistic work stops.
    pub battery_floor_percent: u8,
    /// Timeout applied to each dispatcher stage.
    pub stage_timeout_secs: u64,
    /// Origin attempts before falling through (filtering skips retries).
    pub origin_retry_attempts: u32,
    /// Hidden-service name of the injector.
    pub injector_service: String,
    /// Grace period granted to race losers after cancellation.
    pub connect_grace_ms: u64,
    /// Hidden-service connect strategy.
    pub connect_strategy: ConnectStrategy,
    /// Per-backend timeout for availability estimates.
    pub estimate_timeout_ms: u64,
    /// Interval between cache re-scoring sweeps.
    pub sweep_interval_secs: u64,
    /// TTL assumed when a resource carries no max-age.
    pub default_ttl_secs: u64,
    /// Cache manager scoring weights.
    pub scoring: ScoringWeights,
    /// Altruistic seeder settings.
    pub seeder: SeederConfig,
}

impl Default for CenoConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("ceno-cache"),
            disk_budget_bytes: CacheDefaults::DISK_BUDGET_BYTES,
            bandwidth_capacity_bytes: SchedulerDefaults::BANDWIDTH_CAPACITY_BYTES,
            bandwidth_refill_bytes_per_sec: SchedulerDefaults::BANDWIDTH_REFILL_BYTES_PER_SEC,
            altruism_percent: SchedulerDefaults::ALTRUISM_PERCENT,
            energy_capacity: SchedulerDefaults::ENERGY_CAPACITY,
            battery_floor_percent: SchedulerDefaults::BATTERY_FLOOR_PERCENT,
            stage_timeout_secs: DispatchDefaults::STAGE_TIMEOUT.as_secs(),
            origin_retry_attempts: DispatchDefaults::ORIGIN_RETRY_ATTEMPTS,
            injector_service: DispatchDefaults::INJECTOR_SERVICE.to_string(),
            connect_grace_ms: MultiplexDefaults::CONNECT_GRACE.as_millis() as u64,
            connect_strategy: ConnectStrategy::default(),
            estimate_timeout_ms: MultiplexDefaults::ESTIMATE_TIMEOUT.as_millis() as u64,
            sweep_interval_secs: CacheDefaults::SWEEP_INTERVAL.as_secs(),
            default_ttl_secs: CacheDefaults::DEFAULT_TTL.as_secs(),
            scoring: ScoringWeights::default(),
            seeder: SeederConfig::default(),
        }
    }
}

impl CenoConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = atomic_read_json(path)?.ok_or_else(|| CenoError::Config {
            message: format!("Configuration file not found: {}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let config = atomic_read_json::<Self>(path)?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Persist configuration atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        atomic_write_json(path, self, true)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        fn invalid(message: String) -> Result<()> {
            Err(CenoError::Config { message })
        }

        if self.disk_budget_bytes == 0 {
            return invalid("disk_budget_bytes must be positive".into());
        }
        if self.bandwidth_capacity_bytes == 0 || self.bandwidth_refill_bytes_per_sec == 0 {
            return invalid("bandwidth capacity and refill rate must be positive".into());
        }
        if self.altruism_percent > 100 {
            return invalid(format!(
                "altruism_percent must be within 0..=100, got {}",
                self.altruism_percent
            ));
        }
        if self.battery_floor_percent > 100 {
            return invalid(format!(
                "battery_floor_percent must be within 0..=100, got {}",
                self.battery_floor_percent
            ));
        }
        if self.sweep_interval_secs == 0 {
            return invalid("sweep_interval_secs must be positive".into());
        }
        if self.stage_timeout_secs == 0 {
            return invalid("stage_timeout_secs must be positive".into());
        }
        if self.origin_retry_attempts == 0 {
            return invalid("origin_retry_attempts must be at least 1".into());
        }
        if self.injector_service.trim().is_empty() {
            return invalid("injector_service must not be empty".into());
        }
        if self.seeder.max_attempts == 0 {
            return invalid("seeder.max_attempts must be at least 1".into());
        }
        self.scoring.validate()
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }

    pub fn estimate_timeout(&self) -> Duration {
        Duration::from_millis(self.estimate_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        assert!(CenoConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: CenoConfig =
            serde_json::from_str(r#"{"disk_budget_bytes": 4096, "seeder": {"max_attempts": 2}}"#)
                .unwrap();

        assert_eq!(config.disk_budget_bytes, 4096);
        assert_eq!(config.seeder.max_attempts, 2);
        assert_eq!(
            config.seeder.satisfactory_availability,
            SeederDefaults::SATISFACTORY_AVAILABILITY
        );
        assert_eq!(config.injector_service, DispatchDefaults::INJECTOR_SERVICE);
    }

    #[test]
    fn test_invalid_percentages_rejected() {
        let config = CenoConfig {
            altruism_percent: 120,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CenoError::Config { .. })));

        let config = CenoConfig {
            battery_floor_percent: 101,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = CenoConfig::default();
        config.seeder.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let config = CenoConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CenoError::Config { .. })));

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ceno.json");
        std::fs::write(&path, r#"{"sweep_interval_secs": 0}"#).unwrap();
        assert!(CenoConfig::load(&path).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ceno.json");

        let config = CenoConfig {
            disk_budget_bytes: 10_000,
            injector_service: "test-injector".into(),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = CenoConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.json");

        assert!(CenoConfig::load(&path).is_err());
        assert_eq!(
            CenoConfig::load_or_default(&path).unwrap(),
            CenoConfig::default()
        );
    }

    #[test]
    fn test_duration_accessors() {
        let config = CenoConfig::default();
        assert_eq!(config.stage_timeout(), DispatchDefaults::STAGE_TIMEOUT);
        assert_eq!(config.connect_grace(), MultiplexDefaults::CONNECT_GRACE);
        assert_eq!(config.seeder.seed_duration(), SeederDefaults::SEED_DURATION);
    }
}
