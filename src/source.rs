//! Cached Source
//!
//! Generic CRUD engine over a [`RemoteBackend`]. Every operation follows the
//! same pipeline:
//!
//! ```text
//! ensure token ─► resolve directory (cache, top-down) ─► check names
//!      ─► backend call ─► invalidate affected listing
//! ```
//!
//! Name checks run against the cached listing, so `PathNotFound` and
//! `NameInUse` never cost a network call. Nothing is invalidated when the
//! backend call fails.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{AuthState, AuthWindow, Authenticator};
use crate::cache::path::{self, ROOT};
use crate::cache::{CacheEntry, DirRef, DirectoryCache};
use crate::config::Settings;
use crate::error::{Result, SourceError};
use crate::sources::{RemoteBackend, SourceId};

/// File content returned by [`CachedSource::get_file`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub path: String,
    pub name: String,
    pub data: Vec<u8>,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Outcome of [`CachedSource::put_file`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub name: String,
    pub modified_at: Option<DateTime<Utc>>,
}

/// A directory resolved during a walk from the root
struct Resolved {
    path: String,
    entry: CacheEntry,
    /// Listed during this walk rather than taken from the cache
    fetched: bool,
}

/// One remote file source with its token and directory cache
pub struct CachedSource {
    backend: Arc<dyn RemoteBackend>,
    auth: Authenticator,
    cache: Mutex<DirectoryCache>,
}

impl CachedSource {
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        settings: &Settings,
        window: Arc<dyn AuthWindow>,
        http: reqwest::Client,
    ) -> Self {
        let auth = Authenticator::new(
            backend.kind(),
            backend.auth_config().clone(),
            settings.auth.clone(),
            window,
            http,
        );
        Self {
            backend,
            auth,
            cache: Mutex::new(DirectoryCache::new(settings.cache.max_cache_age)),
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.backend.kind()
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.state()
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    /// Run the authorization flow now if there is no valid token
    pub async fn ensure_authenticated(&self) -> Result<()> {
        self.auth.ensure_authenticated().await.map(|_| ())
    }

    /// Returns (hits, misses, hit_rate)
    pub fn cache_stats(&self) -> (u64, u64, f64) {
        self.cache().stats()
    }

    pub fn log_metrics(&self) {
        self.cache().log_metrics();
    }

    /// Cached directory paths, including never-fetched placeholders
    pub fn cached_paths(&self) -> Vec<String> {
        self.cache().paths()
    }

    /// Forget every cached listing
    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    fn cache(&self) -> MutexGuard<'_, DirectoryCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the token when the backend rejected it
    async fn finish<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_unauthorized() {
                warn!(source = %self.source_id(), "Access token rejected, re-authorization required");
                self.auth.invalidate().await;
            }
        }
        result
    }

    /// Directory listing at `path`, from the cache when fresh.
    ///
    /// `force` refetches `path` itself; its ancestors are only fetched when
    /// missing or stale.
    pub async fn get_directory(&self, path: &str, force: bool) -> Result<CacheEntry> {
        let path = path::normalize(path);
        let result = self.directory(&path, force).await;
        self.finish(result).await
    }

    async fn directory(&self, path: &str, force: bool) -> Result<CacheEntry> {
        let token = self.auth.ensure_authenticated().await?;
        self.resolve(&token, path, force).await
    }

    /// Walk from the root to `path`, listing whatever is not fresh
    async fn resolve(&self, token: &str, path: &str, force: bool) -> Result<CacheEntry> {
        if !force {
            let cached = self.cache().lookup_fresh(path, Instant::now());
            if let Some(entry) = cached {
                return Ok(entry);
            }
        }

        let chain = path::ancestors(path);
        let last = chain.len() - 1;
        let mut parent: Option<Resolved> = None;

        for (depth, current) in chain.into_iter().enumerate() {
            let force_here = force && depth == last;
            let resolved = self
                .resolve_step(token, current, force_here, parent.as_mut())
                .await?;
            parent = Some(resolved);
        }

        parent
            .map(|resolved| resolved.entry)
            .ok_or_else(|| SourceError::PathNotFound(path.to_string()))
    }

    async fn resolve_step(
        &self,
        token: &str,
        path: String,
        force: bool,
        parent: Option<&mut Resolved>,
    ) -> Result<Resolved> {
        if !force {
            let cached = self.cache().lookup_fresh(&path, Instant::now());
            if let Some(entry) = cached {
                return Ok(Resolved {
                    path,
                    entry,
                    fetched: false,
                });
            }
        }

        let mut dir = self.cache().get(&path).map(CacheEntry::dir_ref);

        if dir.is_none() {
            // The parent listing may predate the directory; look once more
            if let Some(parent) = parent {
                if !parent.fetched {
                    debug!(path = %path, parent = %parent.path, "Directory not in cached parent, refetching parent");
                    let parent_ref = parent.entry.dir_ref();
                    parent.entry = self.fetch(token, &parent.path, &parent_ref).await?;
                    parent.fetched = true;
                    dir = self.cache().get(&path).map(CacheEntry::dir_ref);
                }
            }
        }

        let dir = dir.ok_or_else(|| SourceError::PathNotFound(path.clone()))?;
        let entry = self.fetch(token, &path, &dir).await?;
        Ok(Resolved {
            path,
            entry,
            fetched: true,
        })
    }

    /// List `path` through the backend and replace its cached subtree
    async fn fetch(&self, token: &str, path: &str, dir: &DirRef) -> Result<CacheEntry> {
        debug!(source = %self.source_id(), path = path, "Listing directory");
        let listing = self.backend.list_directory(token, path, dir).await?;
        let entry = self.cache().rebuild(path, dir, &listing, Instant::now());
        Ok(entry)
    }

    /// Resolve `path` and the id of its subdirectory `name`
    async fn with_subdirectory(&self, token: &str, path: &str, name: &str) -> Result<(CacheEntry, DirRef)> {
        let dir = self.resolve(token, path, false).await?;
        let not_found = || SourceError::PathNotFound(path::child_path(path, name));
        let sub_path = dir.dirs.get(name).ok_or_else(not_found)?;
        let sub = self
            .cache()
            .get(sub_path)
            .map(CacheEntry::dir_ref)
            .ok_or_else(not_found)?;
        Ok((dir, sub))
    }

    fn invalidate(&self, path: &str) {
        self.cache().invalidate(path);
    }

    /// Download file `name` from directory `path`
    pub async fn get_file(&self, path: &str, name: &str) -> Result<ReadResult> {
        let path = path::normalize(path);
        let result = self.read_file(&path, name).await;
        self.finish(result).await
    }

    async fn read_file(&self, path: &str, name: &str) -> Result<ReadResult> {
        let token = self.auth.ensure_authenticated().await?;
        let dir = self.resolve(&token, path, false).await?;
        let file = dir
            .files
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::PathNotFound(path::child_path(path, name)))?;

        let data = self.backend.download_file(&token, path, &file).await?;
        debug!(path = path, name = name, bytes = data.len(), "Downloaded file");

        Ok(ReadResult {
            path: path.to_string(),
            name: name.to_string(),
            data,
            size: file.size,
            created_at: file.created_at,
            modified_at: file.modified_at,
        })
    }

    /// Create or overwrite file `name` in directory `path`
    pub async fn put_file(&self, path: &str, name: &str, data: &[u8]) -> Result<WriteResult> {
        let path = path::normalize(path);
        let result = self.write_file(&path, name, data).await;
        self.finish(result).await
    }

    async fn write_file(&self, path: &str, name: &str, data: &[u8]) -> Result<WriteResult> {
        let token = self.auth.ensure_authenticated().await?;
        let dir = self.resolve(&token, path, false).await?;
        ensure_valid_name(name)?;
        if dir.dirs.contains_key(name) {
            return Err(SourceError::NameInUse {
                path: path.to_string(),
                name: name.to_string(),
            });
        }
        let existing = dir.files.get(name).cloned();

        let entry = self
            .backend
            .upload_file(&token, path, name, data, &dir.dir_ref(), existing.as_ref())
            .await?;
        self.invalidate(path);

        info!(
            source = %self.source_id(),
            path = path,
            name = name,
            bytes = data.len(),
            overwrite = existing.is_some(),
            "File written"
        );
        Ok(WriteResult {
            name: entry.name,
            modified_at: entry.modified_at,
        })
    }

    /// Create directory `name` inside `path`
    pub async fn create_directory(&self, path: &str, name: &str) -> Result<()> {
        let path = path::normalize(path);
        let result = self.make_directory(&path, name).await;
        self.finish(result).await
    }

    async fn make_directory(&self, path: &str, name: &str) -> Result<()> {
        let token = self.auth.ensure_authenticated().await?;
        let dir = self.resolve(&token, path, false).await?;
        ensure_name_free(&dir, path, name)?;

        self.backend
            .create_directory(&token, path, name, &dir.dir_ref())
            .await?;
        self.invalidate(path);

        info!(source = %self.source_id(), path = path, name = name, "Directory created");
        Ok(())
    }

    /// Rename directory `name` inside `path` to `new_name`
    pub async fn rename_directory(&self, path: &str, name: &str, new_name: &str) -> Result<()> {
        let path = path::normalize(path);
        let result = self.move_directory(&path, name, new_name).await;
        self.finish(result).await
    }

    async fn move_directory(&self, path: &str, name: &str, new_name: &str) -> Result<()> {
        let token = self.auth.ensure_authenticated().await?;
        let (dir, sub) = self.with_subdirectory(&token, path, name).await?;
        ensure_name_free(&dir, path, new_name)?;

        self.backend
            .rename_directory(&token, path, name, new_name, &sub)
            .await?;
        // Covers both the old and the new child path
        self.invalidate(path);

        info!(source = %self.source_id(), path = path, name = name, new_name = new_name, "Directory renamed");
        Ok(())
    }

    /// Move directory `name` inside `path` to the trash
    pub async fn trash_directory(&self, path: &str, name: &str) -> Result<()> {
        let path = path::normalize(path);
        let result = self.remove_directory(&path, name).await;
        self.finish(result).await
    }

    async fn remove_directory(&self, path: &str, name: &str) -> Result<()> {
        let token = self.auth.ensure_authenticated().await?;
        let (_, sub) = self.with_subdirectory(&token, path, name).await?;

        self.backend
            .trash_directory(&token, path, name, &sub)
            .await?;
        self.invalidate(path);

        info!(source = %self.source_id(), path = path, name = name, "Directory trashed");
        Ok(())
    }

    /// Rename file `name` inside `path` to `new_name`
    pub async fn rename_file(&self, path: &str, name: &str, new_name: &str) -> Result<()> {
        let path = path::normalize(path);
        let result = self.move_file(&path, name, new_name).await;
        self.finish(result).await
    }

    async fn move_file(&self, path: &str, name: &str, new_name: &str) -> Result<()> {
        let token = self.auth.ensure_authenticated().await?;
        let dir = self.resolve(&token, path, false).await?;
        let file = dir
            .files
            .get(name)
            .ok_or_else(|| SourceError::PathNotFound(path::child_path(path, name)))?;
        ensure_name_free(&dir, path, new_name)?;

        self.backend.rename_file(&token, path, file, new_name).await?;
        self.invalidate(path);

        info!(source = %self.source_id(), path = path, name = name, new_name = new_name, "File renamed");
        Ok(())
    }

    /// Move file `name` inside `path` to the trash
    pub async fn trash_file(&self, path: &str, name: &str) -> Result<()> {
        let path = path::normalize(path);
        let result = self.remove_file(&path, name).await;
        self.finish(result).await
    }

    async fn remove_file(&self, path: &str, name: &str) -> Result<()> {
        let token = self.auth.ensure_authenticated().await?;
        let dir = self.resolve(&token, path, false).await?;
        let file = dir
            .files
            .get(name)
            .ok_or_else(|| SourceError::PathNotFound(path::child_path(path, name)))?;

        self.backend.trash_file(&token, path, file).await?;
        self.invalidate(path);

        info!(source = %self.source_id(), path = path, name = name, "File trashed");
        Ok(())
    }
}

fn ensure_valid_name(name: &str) -> Result<()> {
    if path::is_valid_name(name) {
        Ok(())
    } else {
        Err(SourceError::InvalidName(name.to_string()))
    }
}

fn ensure_name_free(dir: &CacheEntry, path: &str, name: &str) -> Result<()> {
    ensure_valid_name(name)?;
    if dir.name_in_use(name) {
        return Err(SourceError::NameInUse {
            path: if path == ROOT { "/".to_string() } else { path.to_string() },
            name: name.to_string(),
        });
    }
    Ok(())
}
