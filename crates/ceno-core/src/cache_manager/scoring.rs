//! Default scoring: scarcer and fresher entries are worth more.
//!
//! `score = w_scarcity / max(availability, 1) + w_freshness * freshness`
//!
//! where `freshness = max(0, 1 - age / ttl)` falls linearly from 1 at fetch
//! time to 0 once the entry's TTL has elapsed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CenoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub scarcity_weight: f64,
    pub freshness_weight: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            scarcity_weight: 1.0,
            freshness_weight: 1.0,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<()> {
        let weights = [self.scarcity_weight, self.freshness_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(CenoError::Config {
                message: "scoring weights must be finite and non-negative".into(),
            });
        }
        if weights.iter().all(|w| *w == 0.0) {
            return Err(CenoError::Config {
                message: "at least one scoring weight must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn score(&self, availability: u64, freshness: f64) -> f64 {
        self.scarcity_weight / availability.max(1) as f64 + self.freshness_weight * freshness
    }
}

/// Linear decay from 1.0 to 0.0 over `ttl`. A zero TTL is always stale.
pub fn freshness(age: Duration, ttl: Duration) -> f64 {
    if ttl.is_zero() {
        return 0.0;
    }
    (1.0 - age.as_secs_f64() / ttl.as_secs_f64()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_decays() {
        let ttl = Duration::from_secs(100);
        assert_eq!(freshness(Duration::ZERO, ttl), 1.0);
        assert!((freshness(Duration::from_secs(25), ttl) - 0.75).abs() < 1e-9);
        assert_eq!(freshness(Duration::from_secs(100), ttl), 0.0);
        assert_eq!(freshness(Duration::from_secs(500), ttl), 0.0);
        assert_eq!(freshness(Duration::ZERO, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_scarce_resources_score_higher() {
        let weights = ScoringWeights::default();
        assert!(weights.score(1, 0.5) > weights.score(10, 0.5));
        // Zero availability is treated as one copy.
        assert_eq!(weights.score(0, 0.0), weights.score(1, 0.0));
    }

    #[test]
    fn test_validate() {
        assert!(ScoringWeights::default().validate().is_ok());
        assert!(ScoringWeights {
            scarcity_weight: -1.0,
            freshness_weight: 1.0
        }
        .validate()
        .is_err());
        assert!(ScoringWeights {
            scarcity_weight: 0.0,
            freshness_weight: 0.0
        }
        .validate()
        .is_err());
    }
}
