//! Source Registry
//!
//! Constructed once per process and handed to whatever needs file access.
//! Maps source identifiers to lazily created [`CachedSource`] singletons, and
//! back from an instance to its identifier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::auth::AuthWindow;
use crate::config::Settings;
use crate::error::{Result, SourceError};
use crate::source::CachedSource;
use crate::sources::{DropboxBackend, GoogleDriveBackend, OneDriveBackend, RemoteBackend, SourceId};

/// Builds the backend for a source identifier
pub type BackendFactory =
    Box<dyn Fn(SourceId, &Settings, &reqwest::Client) -> Arc<dyn RemoteBackend> + Send + Sync>;

fn provider_backend(id: SourceId, settings: &Settings, http: &reqwest::Client) -> Arc<dyn RemoteBackend> {
    match id {
        SourceId::GoogleDrive => Arc::new(GoogleDriveBackend::new(http.clone(), settings)),
        SourceId::Dropbox => Arc::new(DropboxBackend::new(http.clone(), settings)),
        SourceId::OneDrive => Arc::new(OneDriveBackend::new(http.clone(), settings)),
    }
}

pub struct SourceRegistry {
    settings: Settings,
    http: reqwest::Client,
    token_http: reqwest::Client,
    window: Arc<dyn AuthWindow>,
    factory: BackendFactory,
    sources: Mutex<HashMap<SourceId, Arc<CachedSource>>>,
}

impl SourceRegistry {
    /// Registry backed by the real provider APIs
    pub fn new(settings: Settings, window: Arc<dyn AuthWindow>) -> Result<Self> {
        let client_error = |e: reqwest::Error| SourceError::Transport(format!("failed to build HTTP client: {}", e));
        let http = settings.http_client().map_err(client_error)?;
        let token_http = settings.token_client().map_err(client_error)?;
        let mut registry = Self::with_factory(settings, window, http, Box::new(provider_backend));
        registry.token_http = token_http;
        Ok(registry)
    }

    pub fn with_factory(
        settings: Settings,
        window: Arc<dyn AuthWindow>,
        http: reqwest::Client,
        factory: BackendFactory,
    ) -> Self {
        Self {
            settings,
            token_http: http.clone(),
            http,
            window,
            factory,
            sources: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn sources(&self) -> MutexGuard<'_, HashMap<SourceId, Arc<CachedSource>>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The source for `id`, created on first use
    pub fn get(&self, id: SourceId) -> Arc<CachedSource> {
        let mut sources = self.sources();
        sources
            .entry(id)
            .or_insert_with(|| {
                info!(source = %id, "Creating {} source", id.display_name());
                let backend = (self.factory)(id, &self.settings, &self.http);
                Arc::new(CachedSource::new(
                    backend,
                    &self.settings,
                    self.window.clone(),
                    self.token_http.clone(),
                ))
            })
            .clone()
    }

    /// Look up a source by its stored identifier (`gdrive`, `dbx`, `odrive`)
    pub fn resolve(&self, id: &str) -> Result<Arc<CachedSource>> {
        Ok(self.get(id.parse()?))
    }

    /// Identifier under which `source` was created by this registry
    pub fn source_id_of(&self, source: &Arc<CachedSource>) -> Option<SourceId> {
        self.sources()
            .iter()
            .find(|(_, candidate)| Arc::ptr_eq(candidate, source))
            .map(|(id, _)| *id)
    }

    /// Identifiers of the sources created so far
    pub fn active(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self.sources().keys().copied().collect();
        ids.sort();
        ids
    }
}
