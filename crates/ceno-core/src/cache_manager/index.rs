//! Persisted URL → entry index and the admission planner.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scoring::{freshness, ScoringWeights};
use crate::persist::{atomic_read_json, atomic_write_json};
use crate::{CenoError, Result};

const INDEX_VERSION: u32 = 1;

/// Local metadata for one resident resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    /// Object file stem under the objects directory.
    pub object: String,
    pub size_bytes: u64,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
    /// Last known availability estimate.
    pub availability: u64,
    pub score: f64,
}

impl CacheEntry {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn freshness(&self, now: DateTime<Utc>) -> f64 {
        let age = (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO);
        freshness(age, self.ttl())
    }

    pub fn rescore(&mut self, weights: &ScoringWeights, now: DateTime<Utc>) {
        self.score = weights.score(self.availability, self.freshness(now));
    }
}

/// A resource being considered for admission.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub url: String,
    pub size_bytes: u64,
    pub score: f64,
}

/// Outcome of planning an admission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    /// Admit after evicting these URLs (possibly none).
    Admit { evict: Vec<String> },
    Reject { reason: String },
}

impl AdmissionDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, AdmissionDecision::Admit { .. })
    }
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// In-memory view of every resident entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheIndex {
    entries: BTreeMap<String, CacheEntry>,
}

impl CacheIndex {
    /// Load an index file. A missing file is an empty index.
    pub fn load(path: &Path) -> Result<Self> {
        let Some(file) = atomic_read_json::<IndexFile>(path)? else {
            return Ok(Self::default());
        };
        if file.version != INDEX_VERSION {
            return Err(CenoError::Config {
                message: format!(
                    "unsupported cache index version {} in {}",
                    file.version,
                    path.display()
                ),
            });
        }
        Ok(Self {
            entries: file
                .entries
                .into_iter()
                .map(|entry| (entry.url.clone(), entry))
                .collect(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = IndexFile {
            version: INDEX_VERSION,
            entries: self.entries.values().cloned().collect(),
        };
        atomic_write_json(path, &file, false)
    }

    pub fn get(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.url.clone(), entry)
    }

    pub fn remove(&mut self, url: &str) -> Option<CacheEntry> {
        self.entries.remove(url)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn used_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    pub fn rescore(&mut self, weights: &ScoringWeights, now: DateTime<Utc>) {
        for entry in self.entries.values_mut() {
            entry.rescore(weights, now);
        }
    }

    /// URLs whose freshness has decayed to zero.
    pub fn stale(&self, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.freshness(now) <= 0.0)
            .map(|e| e.url.clone())
            .collect()
    }

    /// Bytes that must be freed before `size` more fit in `budget`, counting
    /// every resident entry except `replacing`. Accounts for a cache that is
    /// already over budget.
    fn shortfall(&self, size: u64, replacing: &str, budget: u64) -> u64 {
        let used = self.used_bytes() - self.get(replacing).map_or(0, |e| e.size_bytes);
        (used + size).saturating_sub(budget)
    }

    /// Resident bytes after admitting `size` bytes under `url` and evicting
    /// `evict`.
    pub fn usage_after(&self, url: &str, size: u64, evict: &[String]) -> u64 {
        let freed: u64 = evict
            .iter()
            .filter(|u| u.as_str() != url)
            .filter_map(|u| self.get(u))
            .map(|e| e.size_bytes)
            .sum();
        let replaced = self.get(url).map_or(0, |e| e.size_bytes);
        (self.used_bytes() - freed - replaced) + size
    }

    /// Lowest-scoring URLs to drop so the rest fits in `budget`.
    ///
    /// Entries are expected to be freshly rescored.
    pub fn over_budget(&self, budget: u64) -> Vec<String> {
        let mut excess = self.used_bytes().saturating_sub(budget);
        let mut victims: Vec<&CacheEntry> = self.entries.values().collect();
        victims.sort_by(|a, b| eviction_order(a, b));

        let mut evict = Vec::new();
        for victim in victims {
            if excess == 0 {
                break;
            }
            excess = excess.saturating_sub(victim.size_bytes);
            evict.push(victim.url.clone());
        }
        evict
    }

    /// Decide whether `candidate` may enter a cache of `budget` bytes.
    ///
    /// Entries are expected to be freshly rescored. An existing entry for
    /// the same URL is replaced and never counted as an eviction.
    pub fn plan_admission(&self, candidate: &Candidate, budget: u64) -> AdmissionDecision {
        if candidate.size_bytes > budget {
            return AdmissionDecision::Reject {
                reason: format!(
                    "size {} exceeds disk budget {}",
                    candidate.size_bytes, budget
                ),
            };
        }

        let shortfall = self.shortfall(candidate.size_bytes, &candidate.url, budget);
        if shortfall == 0 {
            return AdmissionDecision::Admit { evict: Vec::new() };
        }

        let mut victims: Vec<&CacheEntry> = self
            .entries
            .values()
            .filter(|e| e.url != candidate.url)
            .collect();
        victims.sort_by(|a, b| eviction_order(a, b));

        let mut freed = 0u64;
        let mut evict = Vec::new();
        let mut lowest = None;
        for victim in victims {
            if freed >= shortfall {
                break;
            }
            lowest.get_or_insert(victim.score);
            freed += victim.size_bytes;
            evict.push(victim.url.clone());
        }

        match lowest {
            Some(lowest) if freed >= shortfall && candidate.score > lowest => {
                AdmissionDecision::Admit { evict }
            }
            Some(lowest) if freed >= shortfall => AdmissionDecision::Reject {
                reason: format!(
                    "score {:.4} does not beat lowest resident score {:.4}",
                    candidate.score, lowest
                ),
            },
            _ => AdmissionDecision::Reject {
                reason: format!("cannot free {} bytes", shortfall),
            },
        }
    }
}

/// Lowest score first; among equal scores the older fetch goes first.
fn eviction_order(a: &CacheEntry, b: &CacheEntry) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| a.fetched_at.cmp(&b.fetched_at))
}
