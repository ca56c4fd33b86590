//! CloudSync - cached, uniform file access for consumer cloud storage
//!
//! Presents Google Drive, Dropbox and OneDrive behind one path-addressed
//! interface. Each provider gets a [`CachedSource`] that authenticates on
//! demand, caches directory listings for a short window and chunks large
//! uploads.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod registry;
pub mod source;
pub mod sources;

#[cfg(test)]
mod test_support;

pub use auth::{AuthState, AuthWindow, ConsoleWindow};
pub use cache::{CacheEntry, FileMeta};
pub use config::Settings;
pub use error::{Result, SourceError};
pub use registry::SourceRegistry;
pub use source::{CachedSource, ReadResult, WriteResult};
pub use sources::{RemoteBackend, RemoteEntry, SourceId};
