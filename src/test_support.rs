//! Test doubles shared by the unit tests: a loopback HTTP server with canned
//! responses, a scripted authorization window and an in-memory backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use url::Url;

use crate::auth::{AuthConfig, AuthFlow, AuthPopup, AuthWindow, PopupGeometry, PopupLocation};
use crate::cache::{DirRef, FileMeta, ROOT_ID};
use crate::error::{Result, SourceError};
use crate::sources::{RemoteBackend, RemoteEntry, SourceId};

// ---------------------------------------------------------------------------
// Loopback HTTP server
// ---------------------------------------------------------------------------

/// A request received by [`MockServer`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Path without the query string
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("request body is not JSON")
    }

    pub fn form(&self) -> HashMap<String, String> {
        url::form_urlencoded::parse(&self.body).into_owned().collect()
    }
}

/// Canned response
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
        }
    }

    pub fn bytes(status: u16, body: &[u8]) -> Self {
        Self {
            status,
            content_type: "application/octet-stream",
            body: body.to_vec(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }
}

struct Route {
    method: String,
    path: String,
    response: MockResponse,
}

#[derive(Default)]
struct ServerState {
    routes: Vec<Route>,
    requests: Vec<RecordedRequest>,
}

/// HTTP/1.1 server on 127.0.0.1 answering from a queue of one-shot routes.
///
/// Each route answers the first request with the same method and path and is
/// then consumed. Unmatched requests get a 404.
pub struct MockServer {
    base: String,
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback listener");
        let addr = listener.local_addr().expect("listener address");
        let state = Arc::new(Mutex::new(ServerState::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, state).await;
                });
            }
        });

        Self {
            base: format!("http://{}", addr),
            state,
        }
    }

    pub fn url(&self) -> &str {
        &self.base
    }

    /// Queue a one-shot response for `method path`
    pub fn on(&self, method: &str, path: &str, response: MockResponse) {
        self.state.lock().unwrap().routes.push(Route {
            method: method.to_string(),
            path: path.to_string(),
            response,
        });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<Mutex<ServerState>>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    let full = Url::parse(&format!("http://mock{}", target)).expect("request target");
    let request = RecordedRequest {
        method: method.clone(),
        path: full.path().to_string(),
        query: full.query_pairs().into_owned().collect(),
        headers,
        body,
    };

    let response = {
        let mut state = state.lock().unwrap();
        let position = state
            .routes
            .iter()
            .position(|r| r.method == request.method && r.path == request.path);
        let response = match position {
            Some(i) => state.routes.remove(i).response,
            None => MockResponse::json(404, serde_json::json!({"error": "no route"})),
        };
        state.requests.push(request);
        response
    };

    let reason = reqwest::StatusCode::from_u16(response.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason,
        response.content_type,
        response.body.len()
    );

    let mut stream = reader.into_inner();
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.shutdown().await
}

// ---------------------------------------------------------------------------
// Scripted authorization window
// ---------------------------------------------------------------------------

/// How a mock popup behaves once opened
#[derive(Debug, Clone)]
pub enum PopupBehavior {
    /// Stays on the provider's pages forever
    Ignore,
    /// The user closes it after a delay
    CloseAfter(Duration),
    /// The user grants access; `token` is the access token or the code
    Approve { after: Duration, token: String },
    /// Redirects back with a state value that was never issued
    ForgeState { after: Duration },
    /// Redirects back with `error=<error>`
    Error { after: Duration, error: String },
}

pub struct MockWindow {
    behavior: PopupBehavior,
    opened: Mutex<Vec<Url>>,
    closes: Arc<AtomicUsize>,
}

impl MockWindow {
    pub fn new(behavior: PopupBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            opened: Mutex::new(Vec::new()),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn opened(&self) -> Vec<Url> {
        self.opened.lock().unwrap().clone()
    }

    /// Popups closed by the authenticator
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl AuthWindow for MockWindow {
    fn open(&self, url: &Url, _geometry: PopupGeometry) -> Result<Box<dyn AuthPopup>> {
        self.opened.lock().unwrap().push(url.clone());
        Ok(Box::new(MockPopup {
            behavior: self.behavior.clone(),
            auth_url: url.clone(),
            opened_at: Instant::now(),
            closed: Mutex::new(false),
            closes: self.closes.clone(),
        }))
    }
}

struct MockPopup {
    behavior: PopupBehavior,
    auth_url: Url,
    opened_at: Instant,
    closed: Mutex<bool>,
    closes: Arc<AtomicUsize>,
}

impl MockPopup {
    fn param(&self, key: &str) -> String {
        self.auth_url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default()
    }

    fn redirect(&self, params: &[(&str, &str)]) -> PopupLocation {
        let mut url = Url::parse(&self.param("redirect_uri")).expect("redirect_uri");
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        if self.param("response_type") == "token" {
            url.set_fragment(Some(&encoded));
        } else {
            url.set_query(Some(&encoded));
        }
        PopupLocation::Redirected(url)
    }
}

impl AuthPopup for MockPopup {
    fn location(&self) -> PopupLocation {
        if *self.closed.lock().unwrap() {
            return PopupLocation::Closed;
        }
        let elapsed = Instant::now().saturating_duration_since(self.opened_at);
        let state = self.param("state");

        match &self.behavior {
            PopupBehavior::Ignore => PopupLocation::CrossOrigin,
            PopupBehavior::CloseAfter(after) if elapsed >= *after => PopupLocation::Closed,
            PopupBehavior::Approve { after, token } if elapsed >= *after => {
                if self.param("response_type") == "token" {
                    self.redirect(&[
                        ("access_token", token.as_str()),
                        ("token_type", "Bearer"),
                        ("expires_in", "3600"),
                        ("state", state.as_str()),
                    ])
                } else {
                    self.redirect(&[("code", token.as_str()), ("state", state.as_str())])
                }
            }
            PopupBehavior::ForgeState { after } if elapsed >= *after => {
                self.redirect(&[("code", "x"), ("access_token", "x"), ("state", "forged")])
            }
            PopupBehavior::Error { after, error } if elapsed >= *after => {
                self.redirect(&[("error", error.as_str()), ("state", state.as_str())])
            }
            _ => PopupLocation::CrossOrigin,
        }
    }

    fn close(&self) {
        let mut closed = self.closed.lock().unwrap();
        if !*closed {
            *closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockTree {
    /// Directory id -> children
    children: HashMap<String, Vec<RemoteEntry>>,
    contents: HashMap<String, Vec<u8>>,
    next_id: usize,
}

impl MockTree {
    fn find_mut(&mut self, id: &str) -> Option<&mut RemoteEntry> {
        self.children
            .values_mut()
            .flat_map(|entries| entries.iter_mut())
            .find(|entry| entry.id == id)
    }

    fn remove(&mut self, id: &str) -> bool {
        let mut found = false;
        for entries in self.children.values_mut() {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            found |= entries.len() != before;
        }
        found
    }

    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("new-{}", self.next_id)
    }
}

/// Backend keeping a directory tree in memory and logging every call
pub struct MockBackend {
    config: AuthConfig,
    tree: Mutex<MockTree>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, SourceError>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        let mut tree = MockTree::default();
        tree.children.insert(ROOT_ID.to_string(), Vec::new());
        Arc::new(Self {
            config: AuthConfig {
                flow: AuthFlow::Implicit,
                auth_url: "https://auth.example.com/authorize".to_string(),
                token_url: None,
                client_id: "mock".to_string(),
                scope: "all".to_string(),
                redirect_uri: "http://localhost:8080/oauth/callback.html".to_string(),
                extra_auth_params: vec![],
            },
            tree: Mutex::new(tree),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_dir(&self, parent_id: &str, id: &str, name: &str) {
        let mut tree = self.tree.lock().unwrap();
        tree.children
            .entry(parent_id.to_string())
            .or_default()
            .push(RemoteEntry::directory(id, name));
        tree.children.entry(id.to_string()).or_default();
    }

    pub fn add_file(&self, parent_id: &str, id: &str, name: &str, data: &[u8]) {
        let mut tree = self.tree.lock().unwrap();
        tree.children
            .entry(parent_id.to_string())
            .or_default()
            .push(RemoteEntry::file(id, name, data.len() as u64));
        tree.contents.insert(id.to_string(), data.to_vec());
    }

    /// Remove an item behind the cache's back
    pub fn remove_remote(&self, id: &str) {
        self.tree.lock().unwrap().remove(id);
    }

    /// Make the next call of `operation` fail with `error`
    pub fn fail_next(&self, operation: &str, error: SourceError) {
        self.failures
            .lock()
            .unwrap()
            .insert(operation.to_string(), error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls whose log line starts with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.tree.lock().unwrap().contents.get(id).cloned()
    }

    fn record(&self, operation: &str, detail: String) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", operation, detail));
        match self.failures.lock().unwrap().remove(operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteBackend for MockBackend {
    fn kind(&self) -> SourceId {
        SourceId::Dropbox
    }

    fn auth_config(&self) -> &AuthConfig {
        &self.config
    }

    async fn list_directory(&self, token: &str, path: &str, dir: &DirRef) -> Result<Vec<RemoteEntry>> {
        self.record("list", format!("{} [{}]", path, token))?;
        self.tree
            .lock()
            .unwrap()
            .children
            .get(&dir.id)
            .cloned()
            .ok_or_else(|| SourceError::from_status("list", 404, "not found"))
    }

    async fn create_directory(&self, _token: &str, path: &str, name: &str, parent: &DirRef) -> Result<()> {
        self.record("mkdir", format!("{}/{}", path, name))?;
        let mut tree = self.tree.lock().unwrap();
        let id = tree.fresh_id();
        tree.children
            .entry(parent.id.clone())
            .or_default()
            .push(RemoteEntry::directory(&id, name));
        tree.children.insert(id, Vec::new());
        Ok(())
    }

    async fn rename_directory(
        &self,
        _token: &str,
        path: &str,
        name: &str,
        new_name: &str,
        dir: &DirRef,
    ) -> Result<()> {
        self.record("mvdir", format!("{}/{} -> {}", path, name, new_name))?;
        let mut tree = self.tree.lock().unwrap();
        let entry = tree
            .find_mut(&dir.id)
            .ok_or_else(|| SourceError::from_status("mvdir", 404, "not found"))?;
        entry.name = new_name.to_string();
        Ok(())
    }

    async fn trash_directory(&self, _token: &str, path: &str, name: &str, dir: &DirRef) -> Result<()> {
        self.record("rmdir", format!("{}/{}", path, name))?;
        self.tree.lock().unwrap().remove(&dir.id);
        Ok(())
    }

    async fn download_file(&self, _token: &str, path: &str, file: &FileMeta) -> Result<Vec<u8>> {
        self.record("get", format!("{}/{}", path, file.name))?;
        self.content(&file.id)
            .ok_or_else(|| SourceError::from_status("get", 404, "not found"))
    }

    async fn upload_file(
        &self,
        _token: &str,
        path: &str,
        name: &str,
        data: &[u8],
        parent: &DirRef,
        existing: Option<&FileMeta>,
    ) -> Result<RemoteEntry> {
        self.record("put", format!("{}/{}", path, name))?;
        let mut tree = self.tree.lock().unwrap();
        let id = match existing {
            Some(file) => file.id.clone(),
            None => tree.fresh_id(),
        };
        let mut entry = RemoteEntry::file(&id, name, data.len() as u64);
        entry.modified_at = Some(chrono::Utc::now());
        match tree.find_mut(&id) {
            Some(current) => *current = entry.clone(),
            None => tree
                .children
                .entry(parent.id.clone())
                .or_default()
                .push(entry.clone()),
        }
        tree.contents.insert(id, data.to_vec());
        Ok(entry)
    }

    async fn rename_file(&self, _token: &str, path: &str, file: &FileMeta, new_name: &str) -> Result<()> {
        self.record("mv", format!("{}/{} -> {}", path, file.name, new_name))?;
        let mut tree = self.tree.lock().unwrap();
        let entry = tree
            .find_mut(&file.id)
            .ok_or_else(|| SourceError::from_status("mv", 404, "not found"))?;
        entry.name = new_name.to_string();
        Ok(())
    }

    async fn trash_file(&self, _token: &str, path: &str, file: &FileMeta) -> Result<()> {
        self.record("rm", format!("{}/{}", path, file.name))?;
        self.tree.lock().unwrap().remove(&file.id);
        Ok(())
    }
}
