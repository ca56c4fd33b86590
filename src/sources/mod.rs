//! Cloud storage backends
//!
//! Every provider implements [`RemoteBackend`], translating the uniform
//! directory/file operations into its own REST protocol and normalizing its
//! listing format into [`RemoteEntry`].
//!
//! ```text
//!            RemoteBackend
//!       ┌──────────┼──────────┐
//!       ▼          ▼          ▼
//!  GoogleDrive  Dropbox   OneDrive
//! ```

pub mod dropbox;
pub mod gdrive;
pub mod http;
pub mod onedrive;
pub mod upload;

pub use dropbox::DropboxBackend;
pub use gdrive::GoogleDriveBackend;
pub use onedrive::OneDriveBackend;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::auth::AuthConfig;
use crate::cache::{DirRef, FileMeta};
use crate::error::{Result, SourceError};

/// Opaque identifier of a file source, as stored by the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceId {
    GoogleDrive,
    Dropbox,
    OneDrive,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::GoogleDrive, SourceId::Dropbox, SourceId::OneDrive];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::GoogleDrive => "gdrive",
            SourceId::Dropbox => "dbx",
            SourceId::OneDrive => "odrive",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceId::GoogleDrive => "Google Drive",
            SourceId::Dropbox => "Dropbox",
            SourceId::OneDrive => "OneDrive",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gdrive" => Ok(SourceId::GoogleDrive),
            "dbx" => Ok(SourceId::Dropbox),
            "odrive" => Ok(SourceId::OneDrive),
            other => Err(SourceError::UnknownSource(other.to_string())),
        }
    }
}

/// A listing item in provider-independent form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub is_dir: bool,
    pub name: String,
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub size: u64,
}

impl RemoteEntry {
    pub fn directory(id: &str, name: &str) -> Self {
        Self {
            is_dir: true,
            name: name.to_string(),
            id: id.to_string(),
            created_at: None,
            modified_at: None,
            size: 0,
        }
    }

    pub fn file(id: &str, name: &str, size: u64) -> Self {
        Self {
            is_dir: false,
            name: name.to_string(),
            id: id.to_string(),
            created_at: None,
            modified_at: None,
            size,
        }
    }
}

/// Capability contract implemented by each provider.
///
/// `path` is always the directory holding the target; `name` is the target's
/// name inside it. The cached layer has already resolved ids (`DirRef`,
/// `FileMeta`) so providers addressing items by id need no extra lookups.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Which source this backend serves
    fn kind(&self) -> SourceId;

    /// OAuth parameters used to obtain tokens for this backend
    fn auth_config(&self) -> &AuthConfig;

    /// List the directory at `path`
    async fn list_directory(&self, token: &str, path: &str, dir: &DirRef)
        -> Result<Vec<RemoteEntry>>;

    /// Create directory `name` inside `path`
    async fn create_directory(
        &self,
        token: &str,
        path: &str,
        name: &str,
        parent: &DirRef,
    ) -> Result<()>;

    /// Rename directory `name` inside `path` to `new_name`
    async fn rename_directory(
        &self,
        token: &str,
        path: &str,
        name: &str,
        new_name: &str,
        dir: &DirRef,
    ) -> Result<()>;

    /// Move directory `name` inside `path` to the provider's trash
    async fn trash_directory(&self, token: &str, path: &str, name: &str, dir: &DirRef)
        -> Result<()>;

    /// Download the content of a file inside `path`
    async fn download_file(&self, token: &str, path: &str, file: &FileMeta) -> Result<Vec<u8>>;

    /// Upload `data` as `name` inside `path`, overwriting `existing` if given
    async fn upload_file(
        &self,
        token: &str,
        path: &str,
        name: &str,
        data: &[u8],
        parent: &DirRef,
        existing: Option<&FileMeta>,
    ) -> Result<RemoteEntry>;

    /// Rename a file inside `path` to `new_name`
    async fn rename_file(
        &self,
        token: &str,
        path: &str,
        file: &FileMeta,
        new_name: &str,
    ) -> Result<()>;

    /// Move a file inside `path` to the provider's trash
    async fn trash_file(&self, token: &str, path: &str, file: &FileMeta) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_round_trip() {
        for id in SourceId::ALL {
            assert_eq!(id.as_str().parse::<SourceId>().unwrap(), id);
        }
        assert_eq!(
            "local".parse::<SourceId>(),
            Err(SourceError::UnknownSource("local".to_string()))
        );
    }
}
