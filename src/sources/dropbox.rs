//! Dropbox backend
//!
//! RPC-style API v2: metadata calls POST a JSON body to `api.dropboxapi.com`,
//! content calls go to `content.dropboxapi.com` with their arguments in the
//! `Dropbox-API-Arg` header. Items are addressed by path, except downloads
//! which use the file id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, trace};

use super::http;
use super::upload::{send_slices, Slice, SliceSink};
use super::{RemoteBackend, RemoteEntry, SourceId};
use crate::auth::{AuthConfig, AuthFlow};
use crate::cache::path::child_path;
use crate::cache::{DirRef, FileMeta};
use crate::config::Settings;
use crate::error::Result;

const AUTH_URL: &str = "https://www.dropbox.com/oauth2/authorize";
const TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
const CLIENT_ID: &str = "erqcrdytyixn6h7";
const SCOPE: &str = "files.content.write files.content.read";

const API_URL: &str = "https://api.dropboxapi.com/2/files";
const CONTENT_URL: &str = "https://content.dropboxapi.com/2/files";

const API_ARG_HEADER: &str = "Dropbox-API-Arg";
const OCTET_STREAM: &str = "application/octet-stream";

/// Base URLs of the two Dropbox hosts
#[derive(Debug, Clone)]
pub struct DropboxEndpoints {
    pub api: String,
    pub content: String,
}

impl Default for DropboxEndpoints {
    fn default() -> Self {
        Self {
            api: API_URL.to_string(),
            content: CONTENT_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<DbxEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum DbxEntry {
    Folder(DbxFolder),
    File(DbxFile),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct DbxFolder {
    name: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct DbxFile {
    name: String,
    id: String,
    #[serde(default)]
    client_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    server_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    size: u64,
}

impl From<DbxFile> for RemoteEntry {
    fn from(file: DbxFile) -> Self {
        RemoteEntry {
            is_dir: false,
            name: file.name,
            id: file.id,
            created_at: file.client_modified,
            modified_at: file.server_modified,
            size: file.size,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

/// Convert Dropbox listing entries, dropping deleted items
fn normalize_listing(path: &str, entries: Vec<DbxEntry>) -> Vec<RemoteEntry> {
    entries
        .into_iter()
        .filter_map(|entry| match entry {
            DbxEntry::Folder(folder) => Some(RemoteEntry {
                is_dir: true,
                name: folder.name,
                id: folder.id,
                created_at: None,
                modified_at: None,
                size: 0,
            }),
            DbxEntry::File(file) => Some(file.into()),
            DbxEntry::Other => {
                trace!(path = path, "Skipping deleted entry");
                None
            }
        })
        .collect()
}

/// Serialize a header argument, escaping everything outside ASCII
fn api_arg(value: &Value) -> String {
    let raw = value.to_string();
    let mut escaped = String::with_capacity(raw.len());
    let mut units = [0u16; 2];
    for c in raw.chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    escaped
}

/// Dropbox implementation of [`RemoteBackend`]
pub struct DropboxBackend {
    http: Client,
    auth: AuthConfig,
    endpoints: DropboxEndpoints,
    slice_size: usize,
}

impl DropboxBackend {
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
                extra_auth_params: vec![("token_access_type".to_string(), "online".to_string())],
            },
            endpoints: DropboxEndpoints::default(),
            slice_size: settings.upload_slice_size,
        }
    }

    pub fn with_endpoints(mut self, endpoints: DropboxEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// POST a JSON body to an RPC endpoint and return the checked response
    async fn rpc_call(&self, token: &str, route: &str, body: &Value) -> Result<reqwest::Response> {
        debug!(route = route, "Dropbox RPC");
        let response = self
            .http
            .post(format!("{}/{}", self.endpoints.api, route))
            .header(AUTHORIZATION, http::bearer(token))
            .json(body)
            .send()
            .await?;
        http::check(response, route).await
    }

    async fn rpc<T: DeserializeOwned>(&self, token: &str, route: &str, body: &Value) -> Result<T> {
        let response = self.rpc_call(token, route, body).await?;
        http::json(response, route).await
    }

    /// POST to a content endpoint with the argument in the header
    async fn content_call(
        &self,
        token: &str,
        route: &str,
        arg: &Value,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(format!("{}/{}", self.endpoints.content, route))
            .header(AUTHORIZATION, http::bearer(token))
            .header(CONTENT_TYPE, OCTET_STREAM)
            .header(API_ARG_HEADER, api_arg(arg))
            .body(body)
            .send()
            .await?;
        http::check(response, route).await
    }
}

/// An open upload session
struct DropboxUpload<'a> {
    backend: &'a DropboxBackend,
    token: &'a str,
    session_id: String,
    target: String,
}

#[async_trait]
impl<'a> SliceSink for DropboxUpload<'a> {
    type Output = RemoteEntry;

    async fn append(&mut self, slice: Slice, bytes: &[u8]) -> Result<()> {
        let arg = json!({
            "cursor": {"session_id": self.session_id, "offset": slice.offset},
            "close": false,
        });
        self.backend
            .content_call(self.token, "upload_session/append_v2", &arg, bytes.to_vec())
            .await?;
        Ok(())
    }

    async fn commit(&mut self, slice: Slice, bytes: &[u8]) -> Result<RemoteEntry> {
        let arg = json!({
            "cursor": {"session_id": self.session_id, "offset": slice.offset},
            "commit": {"path": self.target, "mode": "overwrite", "autorename": false},
        });
        let response = self
            .backend
            .content_call(self.token, "upload_session/finish", &arg, bytes.to_vec())
            .await?;
        let file: DbxFile = http::json(response, "upload_session/finish").await?;
        Ok(file.into())
    }
}

#[async_trait]
impl RemoteBackend for DropboxBackend {
    fn kind(&self) -> SourceId {
        SourceId::Dropbox
    }

    fn auth_config(&self) -> &AuthConfig {
        &self.auth
    }

    async fn list_directory(&self, token: &str, path: &str, _dir: &DirRef) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        let mut page: ListFolderResponse = self
            .rpc(token, "list_folder", &json!({"path": path}))
            .await?;
        let mut pages = 1;

        loop {
            entries.extend(normalize_listing(path, page.entries));
            if !page.has_more {
                break;
            }
            page = self
                .rpc(token, "list_folder/continue", &json!({"cursor": page.cursor}))
                .await?;
            pages += 1;
        }

        debug!(path = path, entries = entries.len(), pages = pages, "Listed Dropbox folder");
        Ok(entries)
    }

    async fn create_directory(&self, token: &str, path: &str, name: &str, _parent: &DirRef) -> Result<()> {
        let body = json!({"path": child_path(path, name), "autorename": false});
        self.rpc_call(token, "create_folder_v2", &body).await?;
        Ok(())
    }

    async fn rename_directory(
        &self,
        token: &str,
        path: &str,
        name: &str,
        new_name: &str,
        _dir: &DirRef,
    ) -> Result<()> {
        let body = json!({
            "from_path": child_path(path, name),
            "to_path": child_path(path, new_name),
        });
        self.rpc_call(token, "move_v2", &body).await?;
        Ok(())
    }

    async fn trash_directory(&self, token: &str, path: &str, name: &str, _dir: &DirRef) -> Result<()> {
        let body = json!({"path": child_path(path, name)});
        self.rpc_call(token, "delete_v2", &body).await?;
        Ok(())
    }

    async fn download_file(&self, token: &str, _path: &str, file: &FileMeta) -> Result<Vec<u8>> {
        let response = self
            .content_call(token, "download", &json!({"path": file.id}), Vec::new())
            .await?;
        http::bytes(response, "download").await
    }

    async fn upload_file(
        &self,
        token: &str,
        path: &str,
        name: &str,
        data: &[u8],
        _parent: &DirRef,
        _existing: Option<&FileMeta>,
    ) -> Result<RemoteEntry> {
        let response = self
            .content_call(token, "upload_session/start", &json!({"close": false}), Vec::new())
            .await?;
        let session: SessionStart = http::json(response, "upload_session/start").await?;

        let target = child_path(path, name);
        info!(path = %target, size = data.len(), "Uploading to Dropbox");
        let mut upload = DropboxUpload {
            backend: self,
            token,
            session_id: session.session_id,
            target,
        };
        send_slices(&mut upload, data, self.slice_size).await
    }

    async fn rename_file(&self, token: &str, path: &str, file: &FileMeta, new_name: &str) -> Result<()> {
        let body = json!({
            "from_path": child_path(path, &file.name),
            "to_path": child_path(path, new_name),
        });
        self.rpc_call(token, "move_v2", &body).await?;
        Ok(())
    }

    async fn trash_file(&self, token: &str, path: &str, file: &FileMeta) -> Result<()> {
        let body = json!({"path": child_path(path, &file.name)});
        self.rpc_call(token, "delete_v2", &body).await?;
        Ok(())
    }
}
