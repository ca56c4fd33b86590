//! OneDrive backend (Microsoft Graph v1.0)
//!
//! Items are addressed by id; the drive root uses the `root` alias. Uploads go
//! through an upload session whose pre-authenticated URL receives the payload
//! in `Content-Range` slices.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, trace};

use super::http;
use super::upload::{send_slices, Slice, SliceSink};
use super::{RemoteBackend, RemoteEntry, SourceId};
use crate::auth::{AuthConfig, AuthFlow};
use crate::cache::{DirRef, FileMeta, ROOT_ID};
use crate::config::Settings;
use crate::error::Result;

const AUTH_URL: &str = "https://login.microsoftonline.com/consumers/oauth2/v2.0/authorize";
const TOKEN_URL: &str = "https://login.microsoftonline.com/consumers/oauth2/v2.0/token";
const CLIENT_ID: &str = "b81faf82-539b-4759-bcc9-8fdac6c7ceba";
const SCOPE: &str = "files.readwrite.all";

const GRAPH_DRIVE_URL: &str = "https://graph.microsoft.com/v1.0/me/drive";

const OCTET_STREAM: &str = "application/octet-stream";

/// Graph driveItem (only the fields we use)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    folder: Option<serde_json::Value>,
}

impl From<DriveItem> for RemoteEntry {
    fn from(item: DriveItem) -> Self {
        let is_dir = item.folder.is_some();
        RemoteEntry {
            is_dir,
            name: item.name,
            id: item.id,
            created_at: item.created_date_time,
            modified_at: item.last_modified_date_time,
            size: if is_dir { 0 } else { item.size },
        }
    }
}

/// Convert a page of children; folders are recognised by their `folder` facet
fn normalize_listing(path: &str, items: Vec<DriveItem>) -> Vec<RemoteEntry> {
    trace!(path = path, items = items.len(), "Normalizing OneDrive children");
    items.into_iter().map(RemoteEntry::from).collect()
}

#[derive(Debug, Deserialize)]
struct ChildrenPage {
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    upload_url: String,
}

/// OneDrive implementation of [`RemoteBackend`]
pub struct OneDriveBackend {
    http: Client,
    auth: AuthConfig,
    drive_url: String,
    slice_size: usize,
}

impl OneDriveBackend {
    pub fn new(http: Client, settings: &Settings) -> Self {
        Self {
            http,
            auth: AuthConfig {
                flow: AuthFlow::AuthorizationCode,
                auth_url: AUTH_URL.to_string(),
                token_url: Some(TOKEN_URL.to_string()),
                client_id: CLIENT_ID.to_string(),
                scope: SCOPE.to_string(),
                redirect_uri: settings.auth.redirect_uri.clone(),
                extra_auth_params: vec![],
            },
            drive_url: GRAPH_DRIVE_URL.to_string(),
            slice_size: settings.upload_slice_size,
        }
    }

    /// Point the backend at a different drive base URL
    pub fn with_drive_url(mut self, drive_url: &str) -> Self {
        self.drive_url = drive_url.trim_end_matches('/').to_string();
        self
    }

    fn item_url(&self, id: &str) -> String {
        if id == ROOT_ID {
            format!("{}/root", self.drive_url)
        } else {
            format!("{}/items/{}", self.drive_url, urlencoding::encode(id))
        }
    }

    /// Path-addressed child of a folder: `{item}:/{name}:`
    fn child_url(&self, parent_id: &str, name: &str) -> String {
        format!("{}:/{}:", self.item_url(parent_id), urlencoding::encode(name))
    }

    async fn rename_item(&self, token: &str, id: &str, new_name: &str) -> Result<()> {
        let response = self
            .http
            .patch(self.item_url(id))
            .header(AUTHORIZATION, http::bearer(token))
            .json(&json!({"name": new_name}))
            .send()
            .await?;
        http::check(response, "rename item").await?;
        Ok(())
    }

    async fn delete_item(&self, token: &str, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.item_url(id))
            .header(AUTHORIZATION, http::bearer(token))
            .send()
            .await?;
        http::check(response, "delete item").await?;
        Ok(())
    }

    /// Small-file upload in a single request
    async fn put_content(&self, token: &str, parent_id: &str, name: &str, data: &[u8]) -> Result<RemoteEntry> {
        let response = self
            .http
            .put(format!("{}/content", self.child_url(parent_id, name)))
            .header(AUTHORIZATION, http::bearer(token))
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(data.to_vec())
            .send()
            .await?;
        let item: DriveItem = http::json(response, "upload content").await?;
        Ok(item.into())
    }
}

/// An open upload session
struct OneDriveUpload<'a> {
    http: &'a Client,
    upload_url: String,
}

impl OneDriveUpload<'_> {
    async fn put_slice(&self, slice: Slice, bytes: &[u8]) -> Result<reqwest::Response> {
        let mut request = self.http.put(&self.upload_url).body(bytes.to_vec());
        if let Some(range) = slice.content_range() {
            request = request.header(CONTENT_RANGE, range);
        }
        let response = request.send().await?;
        http::check(response, "upload slice").await
    }
}

#[async_trait]
impl<'a> SliceSink for OneDriveUpload<'a> {
    type Output = RemoteEntry;

    async fn append(&mut self, slice: Slice, bytes: &[u8]) -> Result<()> {
        self.put_slice(slice, bytes).await?;
        Ok(())
    }

    async fn commit(&mut self, slice: Slice, bytes: &[u8]) -> Result<RemoteEntry> {
        let response = self.put_slice(slice, bytes).await?;
        let item: DriveItem = http::json(response, "upload slice").await?;
        Ok(item.into())
    }
}

#[async_trait]
impl RemoteBackend for OneDriveBackend {
    fn kind(&self) -> SourceId {
        SourceId::OneDrive
    }

    fn auth_config(&self) -> &AuthConfig {
        &self.auth
    }

    async fn list_directory(&self, token: &str, path: &str, dir: &DirRef) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        let mut next = Some(format!("{}/children", self.item_url(&dir.id)));

        while let Some(url) = next {
            let response = self
                .http
                .get(&url)
                .header(AUTHORIZATION, http::bearer(token))
                .send()
                .await?;
            let page: ChildrenPage = http::json(response, "list children").await?;
            entries.extend(normalize_listing(path, page.value));
            next = page.next_link;
        }

        debug!(path = path, entries = entries.len(), "Listed OneDrive folder");
        Ok(entries)
    }

    async fn create_directory(&self, token: &str, _path: &str, name: &str, parent: &DirRef) -> Result<()> {
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
        let response = self
            .http
            .post(format!("{}/children", self.item_url(&parent.id)))
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
        self.rename_item(token, &dir.id, new_name).await
    }

    async fn trash_directory(&self, token: &str, _path: &str, _name: &str, dir: &DirRef) -> Result<()> {
        self.delete_item(token, &dir.id).await
    }

    async fn download_file(&self, token: &str, _path: &str, file: &FileMeta) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(format!("{}/content", self.item_url(&file.id)))
            .header(AUTHORIZATION, http::bearer(token))
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
        _existing: Option<&FileMeta>,
    ) -> Result<RemoteEntry> {
        // Upload sessions reject empty payloads
        if data.is_empty() {
            return self.put_content(token, &parent.id, name, data).await;
        }

        let body = json!({"item": {"@microsoft.graph.conflictBehavior": "replace"}});
        let response = self
            .http
            .post(format!("{}/createUploadSession", self.child_url(&parent.id, name)))
            .header(AUTHORIZATION, http::bearer(token))
            .json(&body)
            .send()
            .await?;
        let session: UploadSession = http::json(response, "create upload session").await?;

        info!(path = path, name = name, size = data.len(), "Uploading to OneDrive");
        let mut upload = OneDriveUpload {
            http: &self.http,
            upload_url: session.upload_url,
        };
        send_slices(&mut upload, data, self.slice_size).await
    }

    async fn rename_file(&self, token: &str, _path: &str, file: &FileMeta, new_name: &str) -> Result<()> {
        self.rename_item(token, &file.id, new_name).await
    }

    async fn trash_file(&self, token: &str, _path: &str, file: &FileMeta) -> Result<()> {
        self.delete_item(token, &file.id).await
    }
}
