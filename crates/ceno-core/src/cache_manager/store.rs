//! On-disk layout: `<root>/index.json` plus `<root>/objects/<sha256(url)>.{body,meta.json}`.
//!
//! Only the cache writer mutates a store. Files are written before the index
//! references them and the index is updated before files are deleted, so a
//! crash leaves at worst an orphaned object, never a dangling entry.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::index::{CacheEntry, CacheIndex};
use super::scoring::ScoringWeights;
use crate::config::CacheDefaults;
use crate::persist::{atomic_read_json, atomic_write_bytes, atomic_write_json, read_optional, remove_if_exists};
use crate::resource::Resource;
use crate::Result;

#[derive(Serialize, Deserialize)]
struct ObjectMeta {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    fetched_at: DateTime<Utc>,
}

pub(crate) fn object_stem(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

pub struct DiskStore {
    root: PathBuf,
    objects: PathBuf,
    index: CacheIndex,
}

impl DiskStore {
    /// Open (or create) a store. Entries whose body file is gone are dropped.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let objects = root.join(CacheDefaults::OBJECTS_DIR_NAME);
        std::fs::create_dir_all(&objects).map_err(|e| crate::CenoError::io_with_path(e, &objects))?;

        let mut index = CacheIndex::load(&root.join(CacheDefaults::INDEX_FILENAME))?;
        let missing: Vec<String> = index
            .entries()
            .filter(|e| !objects.join(format!("{}.body", e.object)).exists())
            .map(|e| e.url.clone())
            .collect();
        for url in &missing {
            warn!("Dropping index entry with missing body: {}", url);
            index.remove(url);
        }

        let store = Self {
            root,
            objects,
            index,
        };
        if !missing.is_empty() {
            store.save()?;
        }
        info!(
            "Opened cache at {} ({} entries, {} bytes)",
            store.root.display(),
            store.index.len(),
            store.index.used_bytes()
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut CacheIndex {
        &mut self.index
    }

    pub fn save(&self) -> Result<()> {
        self.index.save(&self.index_path())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(CacheDefaults::INDEX_FILENAME)
    }

    fn body_path(&self, stem: &str) -> PathBuf {
        self.objects.join(format!("{}.body", stem))
    }

    fn meta_path(&self, stem: &str) -> PathBuf {
        self.objects.join(format!("{}.meta.json", stem))
    }

    /// Evict `evict`, then store `resource` under `entry`, persisting the
    /// index once.
    ///
    /// The in-memory index changes only after the object files and the index
    /// file are written; on error the store is left as it was.
    pub fn apply_admission(
        &mut self,
        resource: &Resource,
        entry: CacheEntry,
        evict: &[String],
    ) -> Result<()> {
        let mut next = self.index.clone();
        let removed: Vec<CacheEntry> = evict.iter().filter_map(|url| next.remove(url)).collect();

        atomic_write_bytes(&self.body_path(&entry.object), resource.content())?;
        let meta = ObjectMeta {
            url: resource.url().to_string(),
            status: resource.status(),
            headers: resource.headers().to_vec(),
            fetched_at: resource.fetched_at(),
        };
        atomic_write_json(&self.meta_path(&entry.object), &meta, false)?;

        next.insert(entry);
        next.save(&self.index_path())?;
        self.index = next;

        for old in removed {
            self.delete_object(&old.object);
        }
        Ok(())
    }

    /// Remove entries and their objects, persisting the index once.
    pub fn remove_all(&mut self, urls: &[String]) -> Result<Vec<CacheEntry>> {
        let mut next = self.index.clone();
        let removed: Vec<CacheEntry> = urls.iter().filter_map(|url| next.remove(url)).collect();
        if removed.is_empty() {
            return Ok(removed);
        }
        next.save(&self.index_path())?;
        self.index = next;
        for entry in &removed {
            self.delete_object(&entry.object);
        }
        Ok(removed)
    }

    /// Rescore every entry, evict the stale ones, then drop the lowest
    /// scores until the rest fits in `budget`.
    pub fn sweep(
        &mut self,
        weights: &ScoringWeights,
        now: DateTime<Utc>,
        budget: u64,
    ) -> Result<Vec<String>> {
        self.index.rescore(weights, now);
        let stale = self.index.stale(now);
        let mut evicted: Vec<String> = self.remove_all(&stale)?.into_iter().map(|e| e.url).collect();

        let excess = self.index.over_budget(budget);
        if !excess.is_empty() {
            info!(
                "Cache holds {} bytes over budget {}, trimming {} entries",
                self.index.used_bytes(),
                budget,
                excess.len()
            );
            evicted.extend(self.remove_all(&excess)?.into_iter().map(|e| e.url));
        }

        if evicted.is_empty() {
            self.save()?;
        } else {
            info!("Sweep evicted {} entries", evicted.len());
        }
        Ok(evicted)
    }

    /// Load a resident resource from disk.
    pub fn read(&self, url: &str) -> Result<Option<Resource>> {
        let Some(entry) = self.index.get(url) else {
            return Ok(None);
        };
        let Some(meta) = atomic_read_json::<ObjectMeta>(&self.meta_path(&entry.object))? else {
            return Ok(None);
        };
        let Some(body) = read_optional(&self.body_path(&entry.object))? else {
            return Ok(None);
        };
        Ok(Some(Resource::with_fetched_at(
            meta.url,
            meta.status,
            meta.headers,
            body,
            meta.fetched_at,
        )))
    }

    fn delete_object(&self, stem: &str) {
        for path in [self.body_path(stem), self.meta_path(stem)] {
            if let Err(e) = remove_if_exists(&path) {
                warn!("Failed to delete {}: {}", path.display(), e);
            }
        }
        debug!("Deleted object {}", stem);
    }
}
