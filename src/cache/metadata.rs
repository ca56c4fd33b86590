//! Directory Metadata Cache
//!
//! Flat map from directory path to the last listing fetched for it. A
//! directory's children are referenced by path key, so a subtree can be
//! dropped with a prefix filter without touching anything else.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::path::{self, ROOT};
use crate::sources::RemoteEntry;

/// Provider id of the root directory
pub const ROOT_ID: &str = "root";

/// Metadata for a file inside a cached directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl From<&RemoteEntry> for FileMeta {
    fn from(entry: &RemoteEntry) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            size: entry.size,
            created_at: entry.created_at,
            modified_at: entry.modified_at,
        }
    }
}

/// Identity of a directory as the provider knows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRef {
    pub id: String,
    pub name: String,
}

/// One cached directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Provider id of the directory
    pub id: String,
    /// Directory name (empty for the root)
    pub name: String,
    /// When the listing was fetched, `None` if never fetched
    pub fetched_at: Option<Instant>,
    /// Subdirectory name -> cache path
    pub dirs: BTreeMap<String, String>,
    /// File name -> metadata
    pub files: BTreeMap<String, FileMeta>,
}

impl CacheEntry {
    /// A directory known by id but not listed yet
    pub fn placeholder(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            fetched_at: None,
            dirs: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }

    pub fn is_fresh(&self, now: Instant, max_age: Duration) -> bool {
        match self.fetched_at {
            Some(at) => now.saturating_duration_since(at) <= max_age,
            None => false,
        }
    }

    /// Whether a file or subdirectory already uses `name`
    pub fn name_in_use(&self, name: &str) -> bool {
        self.dirs.contains_key(name) || self.files.contains_key(name)
    }

    pub fn dir_ref(&self) -> DirRef {
        DirRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Path-keyed directory cache with a staleness window
pub struct DirectoryCache {
    entries: HashMap<String, CacheEntry>,
    max_age: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DirectoryCache {
    /// Create a cache holding only the never-fetched root
    pub fn new(max_age: Duration) -> Self {
        let mut entries = HashMap::new();
        entries.insert(ROOT.to_string(), CacheEntry::placeholder(ROOT_ID, ""));
        Self {
            entries,
            max_age,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Raw lookup, fresh or not
    pub fn get(&self, path: &str) -> Option<&CacheEntry> {
        self.entries.get(path)
    }

    /// Return a copy of the entry if it is fresh, counting the hit or miss
    pub fn lookup_fresh(&self, path: &str, now: Instant) -> Option<CacheEntry> {
        match self.entries.get(path) {
            Some(entry) if entry.is_fresh(now, self.max_age) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(path = path, "Cache HIT for directory");
                Some(entry.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(path = path, "Cache MISS for directory");
                None
            }
        }
    }

    /// Replace the entry at `path` (and everything below it) with a fresh listing.
    ///
    /// Every listed subdirectory gets a never-fetched placeholder so it can be
    /// listed later by id.
    pub fn rebuild(
        &mut self,
        path: &str,
        dir: &DirRef,
        listing: &[RemoteEntry],
        now: Instant,
    ) -> CacheEntry {
        let purged = self.purge(path);

        let mut entry = CacheEntry::placeholder(&dir.id, &dir.name);
        entry.fetched_at = Some(now);

        for item in listing {
            if !path::is_valid_name(&item.name) {
                warn!(path = path, name = %item.name, "Skipping entry whose name is not a valid path segment");
                continue;
            }
            if item.is_dir {
                let sub_path = path::child_path(path, &item.name);
                if entry.dirs.insert(item.name.clone(), sub_path.clone()).is_some() {
                    warn!(path = path, name = %item.name, "Duplicate directory name in listing, keeping last");
                }
                self.entries
                    .insert(sub_path, CacheEntry::placeholder(&item.id, &item.name));
            } else {
                if entry.files.contains_key(&item.name) {
                    warn!(path = path, name = %item.name, "Duplicate file name in listing, keeping last");
                }
                entry.files.insert(item.name.clone(), FileMeta::from(item));
            }
        }

        debug!(
            path = path,
            dirs = entry.dirs.len(),
            files = entry.files.len(),
            purged = purged,
            "Cached directory listing"
        );

        self.entries.insert(path.to_string(), entry.clone());
        entry
    }

    /// Remove the entry at `path` and every entry below it.
    ///
    /// The root entry is re-created as a placeholder. Returns the number of
    /// entries removed.
    pub fn purge(&mut self, path: &str) -> usize {
        let root_id = self.entries.get(ROOT).map(|root| root.id.clone());
        let before = self.entries.len();
        self.entries.retain(|key, _| !path::is_within(key, path));
        let removed = before - self.entries.len();

        if path == ROOT {
            let id = root_id.unwrap_or_else(|| ROOT_ID.to_string());
            self.entries
                .insert(ROOT.to_string(), CacheEntry::placeholder(&id, ""));
        }
        removed
    }

    /// Forget the listing of `path` and everything below it.
    ///
    /// `path` stays reachable as a never-fetched placeholder so the next read
    /// lists it again by id.
    pub fn invalidate(&mut self, path: &str) {
        let Some(existing) = self.entries.get(path).map(CacheEntry::dir_ref) else {
            // Not cached, but drop any stray descendants
            self.purge(path);
            return;
        };
        let removed = self.purge(path);
        self.entries.insert(
            path.to_string(),
            CacheEntry::placeholder(&existing.id, &existing.name),
        );
        debug!(path = path, removed = removed, "Invalidated cached directory");
    }

    /// Drop everything except a never-fetched root
    pub fn clear(&mut self) {
        self.purge(ROOT);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        debug!("Cleared directory cache");
    }

    /// Number of cached entries, including placeholders
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached paths, for diagnostics and tests
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.entries.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Get cache statistics
    ///
    /// Returns (hits, misses, hit_rate)
    pub fn stats(&self) -> (u64, u64, f64) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (hits, misses, hit_rate)
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let (hits, misses, hit_rate) = self.stats();
        debug!(
            hits = hits,
            misses = misses,
            hit_rate = format!("{:.1}%", hit_rate),
            entries = self.entries.len(),
            "Cache metrics"
        );
    }
}
