//! Google Drive backend (Drive API v3)
//!
//! Everything is addressed by file id. Folders are files with the folder mime
//! type; children are found with a `'<id>' in parents` query. New files are
//! created from metadata first, then their content is written with a media
//! upload to the returned id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::{debug, info, trace, warn};

use super::http;
use super::{RemoteBackend, RemoteEntry, SourceId};
use crate::auth::{AuthConfig, AuthFlow};
use crate::cache::{DirRef, FileMeta};
use crate::config::Settings;
use crate::error::Result;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const CLIENT_ID: &str = "1049752786050-72rqerj64c1l1vqk26r28qtcahfd6i3v.apps.googleusercontent.com";
const SCOPE: &str = "https://www.googleapis.com/auth/drive";

const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const OCTET_STREAM: &str = "application/octet-stream";

const PAGE_SIZE: &str = "1000";
const FILE_FIELDS: &str = "id,name,mimeType,createdTime,modifiedTime,size";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,createdTime,modifiedTime,size)";

/// Deserialize a u64 that Drive sends as a decimal string (absent for folders)
fn deserialize_flexible_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct FlexibleU64Visitor;

    impl<'de> de::Visitor<'de> for FlexibleU64Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a u64, a string containing a u64, or null")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<u64, E> {
            Ok(value)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<u64, E> {
            value.parse::<u64>().map_err(de::Error::custom)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<u64, E> {
            Ok(0)
        }
    }

    deserializer.deserialize_any(FlexibleU64Visitor)
}

/// Base URLs of the metadata and upload APIs
#[derive(Debug, Clone)]
pub struct GoogleDriveEndpoints {
    pub files: String,
    pub upload: String,
}

impl Default for GoogleDriveEndpoints {
    fn default() -> Self {
        Self {
            files: FILES_URL.to_string(),
            upload: UPLOAD_URL.to_string(),
        }
    }
}

/// Drive file resource
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    modified_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_flexible_u64")]
    size: u64,
}

impl From<DriveFile> for RemoteEntry {
    fn from(file: DriveFile) -> Self {
        RemoteEntry {
            is_dir: file.mime_type == FOLDER_MIME_TYPE,
            name: file.name,
            id: file.id,
            created_at: file.created_time,
            modified_at: file.modified_time,
            size: file.size,
        }
    }
}

fn normalize_listing(path: &str, files: Vec<DriveFile>) -> Vec<RemoteEntry> {
    trace!(path = path, files = files.len(), "Normalizing Drive files");
    files.into_iter().map(RemoteEntry::from).collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Google Drive implementation of [`RemoteBackend`]
pub struct GoogleDriveBackend {
    http: Client,
    auth: AuthConfig,
    endpoints: GoogleDriveEndpoints,
}

impl GoogleDriveBackend {
    pub fn new(http: Client, settings: &Settings) -> Self {
        Self {
            http,
            auth: AuthConfig {
                flow: AuthFlow::Implicit,
                auth_url: AUTH_URL.to_string(),
                token_url: None,
                client_id: CLIENT_ID.to_string(),
                scope: SCOPE.to_string(),
                redirect_uri: settings.auth.redirect_uri.clone(),
                extra_auth_params: vec![],
            },
            endpoints: GoogleDriveEndpoints::default(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: GoogleDriveEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/{}", self.endpoints.files, urlencoding::encode(id))
    }

    /// PATCH a file's metadata
    async fn update_metadata(&self, token: &str, id: &str, body: serde_json::Value, operation: &str) -> Result<()> {
        let response = self
            .http
            .patch(self.file_url(id))
            .header(AUTHORIZATION, http::bearer(token))
            .json(&body)
            .send()
            .await?;
        http::check(response, operation).await?;
        Ok(())
    }

    /// Create an empty file from metadata and return its id
    async fn create_file(&self, token: &str, name: &str, parent: &DirRef) -> Result<String> {
        let body = json!({
            "name": name,
            "mimeType": OCTET_STREAM,
            "parents": [parent.id],
        });
        let response = self
            .http
            .post(&self.endpoints.files)
            .header(AUTHORIZATION, http::bearer(token))
            .json(&body)
            .send()
            .await?;
        let created: DriveFile = http::json(response, "create file").await?;
        debug!(name = name, id = %created.id, "Created Drive file");
        Ok(created.id)
    }

    /// Permanently delete a file record, bypassing the trash
    async fn delete_file(&self, token: &str, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.file_url(id))
            .header(AUTHORIZATION, http::bearer(token))
            .send()
            .await?;
        http::check(response, "delete file").await?;
        Ok(())
    }

    /// Replace the content of an existing file
    async fn write_media(&self, token: &str, id: &str, data: &[u8]) -> Result<RemoteEntry> {
        let response = self
            .http
            .patch(format!("{}/{}", self.endpoints.upload, urlencoding::encode(id)))
            .header(AUTHORIZATION, http::bearer(token))
            .header(CONTENT_TYPE, OCTET_STREAM)
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .body(data.to_vec())
            .send()
            .await?;
        let file: DriveFile = http::json(response, "upload media").await?;
        Ok(file.into())
    }
}

#[async_trait]
impl RemoteBackend for GoogleDriveBackend {
    fn kind(&self) -> SourceId {
        SourceId::GoogleDrive
    }

    fn auth_config(&self) -> &AuthConfig {
        &self.auth
    }

    async fn list_directory(&self, token: &str, path: &str, dir: &DirRef) -> Result<Vec<RemoteEntry>> {
        let query = format!("'{}' in parents and trashed=false", dir.id);
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(&self.endpoints.files)
                .header(AUTHORIZATION, http::bearer(token))
                .query(&[
                    ("pageSize", PAGE_SIZE),
                    ("spaces", "drive"),
                    ("orderBy", "folder desc,name"),
                    ("fields", LIST_FIELDS),
                    ("q", query.as_str()),
                ]);
            if let Some(page) = page_token.as_deref() {
                request = request.query(&[("pageToken", page)]);
            }

            let list: FileList = http::json(request.send().await?, "list files").await?;
            entries.extend(normalize_listing(path, list.files));

            match list.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!(path = path, entries = entries.len(), "Listed Drive folder");
        Ok(entries)
    }

    async fn create_directory(&self, token: &str, _path: &str, name: &str, parent: &DirRef) -> Result<()> {
        let body = json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent.id],
        });
        let response = self
            .http
            .post(&self.endpoints.files)
            .header(AUTHORIZATION, http::bearer(token))
            .json(&body)
            .send()
            .await?;
        http::check(response, "create folder").await?;
        Ok(())
    }

    async fn rename_directory(
        &self,
        token: &str,
        _path: &str,
        _name: &str,
        new_name: &str,
        dir: &DirRef,
    ) -> Result<()> {
        self.update_metadata(token, &dir.id, json!({"name": new_name}), "rename folder")
            .await
    }

    async fn trash_directory(&self, token: &str, _path: &str, _name: &str, dir: &DirRef) -> Result<()> {
        self.update_metadata(token, &dir.id, json!({"trashed": true}), "trash folder")
            .await
    }

    async fn download_file(&self, token: &str, _path: &str, file: &FileMeta) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.file_url(&file.id))
            .header(AUTHORIZATION, http::bearer(token))
            .query(&[("alt", "media")])
            .send()
            .await?;
        http::bytes(response, "download").await
    }

    async fn upload_file(
        &self,
        token: &str,
        path: &str,
        name: &str,
        data: &[u8],
        parent: &DirRef,
        existing: Option<&FileMeta>,
    ) -> Result<RemoteEntry> {
        let id = match existing {
            Some(file) => file.id.clone(),
            None => self.create_file(token, name, parent).await?,
        };

        info!(path = path, name = name, size = data.len(), "Uploading to Drive");
        match self.write_media(token, &id, data).await {
            Err(err) if existing.is_none() => {
                // Remove the record created above
                warn!(id = %id, error = %err, "Media upload failed, removing new file record");
                if let Err(cleanup) = self.delete_file(token, &id).await {
                    warn!(id = %id, error = %cleanup, "Failed to remove incomplete Drive file");
                }
                Err(err)
            }
            result => result,
        }
    }

    async fn rename_file(&self, token: &str, _path: &str, file: &FileMeta, new_name: &str) -> Result<()> {
        self.update_metadata(token, &file.id, json!({"name": new_name}), "rename file")
            .await
    }

    async fn trash_file(&self, token: &str, _path: &str, file: &FileMeta) -> Result<()> {
        self.update_metadata(token, &file.id, json!({"trashed": true}), "trash file")
            .await
    }
}
