//! Token lifecycle for one source
//!
//! Runs the popup flow on demand, keeps the resulting token until it expires
//! or the backend rejects it, and serializes concurrent callers so only one
//! popup is ever open per source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use oauth2::basic::BasicErrorResponse;
use oauth2::{AuthorizationCode, PkceCodeVerifier, RequestTokenError, TokenResponse};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use super::popup::{AuthPopup, AuthWindow, PopupGeometry, PopupGuard, PopupLocation};
use super::{AuthConfig, AuthFlow, AuthToken};
use crate::config::AuthSettings;
use crate::error::{Result, SourceError};
use crate::sources::SourceId;

/// Lifetime assumed when the provider omits `expires_in`
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Observable authentication state of a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authorizing,
    Authenticated,
    Failed(SourceError),
}

/// Result of a completed redirect
#[derive(Debug)]
enum Grant {
    Code(String),
    Token {
        value: String,
        expires_in: Option<u64>,
    },
}

/// Obtains and caches the access token of one source
pub struct Authenticator {
    source: SourceId,
    config: AuthConfig,
    settings: AuthSettings,
    window: Arc<dyn AuthWindow>,
    /// Client for the token endpoint; must not follow redirects
    http: reqwest::Client,
    /// Held for the whole flow so concurrent callers wait for one popup
    token: tokio::sync::Mutex<Option<AuthToken>>,
    state: Mutex<AuthState>,
    flows_started: AtomicU64,
}

impl Authenticator {
    pub fn new(
        source: SourceId,
        config: AuthConfig,
        settings: AuthSettings,
        window: Arc<dyn AuthWindow>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            source,
            config,
            settings,
            window,
            http,
            token: tokio::sync::Mutex::new(None),
            state: Mutex::new(AuthState::Unauthenticated),
            flows_started: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of popup flows started so far
    pub fn flows_started(&self) -> u64 {
        self.flows_started.load(Ordering::Relaxed)
    }

    /// Return a valid access token, running the popup flow if there is none
    pub async fn ensure_authenticated(&self) -> Result<String> {
        let mut slot = self.token.lock().await;

        if let Some(token) = slot.as_ref() {
            if token.is_valid(Instant::now()) {
                return Ok(token.value.clone());
            }
            debug!(source = %self.source, "Access token expired");
        }
        *slot = None;

        self.set_state(AuthState::Authorizing);
        self.flows_started.fetch_add(1, Ordering::Relaxed);

        match self.authorize().await {
            Ok(token) => {
                info!(source = %self.source, "Authorization complete");
                let value = token.value.clone();
                *slot = Some(token);
                self.set_state(AuthState::Authenticated);
                Ok(value)
            }
            Err(e) => {
                if e.is_expected() {
                    info!(source = %self.source, "Authorization cancelled by user");
                } else {
                    warn!(source = %self.source, error = %e, "Authorization failed");
                }
                self.set_state(AuthState::Failed(e.clone()));
                Err(e)
            }
        }
    }

    /// Drop the current token; the next call runs the popup flow again
    pub async fn invalidate(&self) {
        let mut slot = self.token.lock().await;
        if slot.take().is_some() {
            info!(source = %self.source, "Access token invalidated");
        }
        self.set_state(AuthState::Unauthenticated);
    }

    fn set_state(&self, state: AuthState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn authorize(&self) -> Result<AuthToken> {
        let pending = self.config.start_authorization()?;

        info!(source = %self.source, "Opening authorization popup");
        let geometry = PopupGeometry::centered(self.window.frame());
        let popup = self.window.open(&pending.url, geometry)?;

        match self
            .wait_for_redirect(popup, pending.state.secret())
            .await?
        {
            Grant::Token { value, expires_in } => Ok(token_with_lifetime(
                value,
                expires_in.map(Duration::from_secs),
            )),
            Grant::Code(code) => match pending.verifier {
                Some(verifier) => self.exchange_code(code, verifier).await,
                None => Err(SourceError::AuthRejected(
                    "authorization code returned to an implicit flow".to_string(),
                )),
            },
        }
    }

    /// Poll the popup until it redirects back, is closed, or the timeout elapses.
    ///
    /// The popup and the ticker are both owned here, so every exit path stops
    /// polling and closes the popup together.
    async fn wait_for_redirect(&self, popup: Box<dyn AuthPopup>, state: &str) -> Result<Grant> {
        let mut popup = PopupGuard::new(popup);
        let deadline = Instant::now() + self.settings.timeout;
        let mut ticker = time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match popup.location() {
                PopupLocation::Closed => return Err(SourceError::AuthCancelled),
                PopupLocation::Redirected(url) => {
                    if let Some(grant) = interpret_redirect(&url, state, self.config.flow)? {
                        return Ok(grant);
                    }
                }
                PopupLocation::CrossOrigin => {}
            }

            if Instant::now() >= deadline {
                return Err(SourceError::AuthTimeout);
            }
        }
    }

    async fn exchange_code(&self, code: String, verifier: PkceCodeVerifier) -> Result<AuthToken> {
        let client = self.config.client()?;

        debug!(source = %self.source, "Exchanging authorization code");
        let tokens = client
            .exchange_code(AuthorizationCode::new(code))
            .map_err(|e| SourceError::AuthRejected(e.to_string()))?
            .set_pkce_verifier(verifier)
            .request_async(&self.http)
            .await
            .map_err(token_error)?;

        Ok(token_with_lifetime(
            tokens.access_token().secret().clone(),
            tokens.expires_in(),
        ))
    }
}

/// Map a failed token request onto the crate's error kinds
fn token_error<RE: std::error::Error>(err: RequestTokenError<RE, BasicErrorResponse>) -> SourceError {
    match err {
        RequestTokenError::ServerResponse(response) => {
            let detail = match response.error_description() {
                Some(description) => format!("{}: {}", response.error(), description),
                None => response.error().to_string(),
            };
            SourceError::AuthRejected(detail)
        }
        RequestTokenError::Request(e) => SourceError::Transport(e.to_string()),
        RequestTokenError::Parse(e, _) => SourceError::InvalidResponse(format!("token response: {}", e)),
        RequestTokenError::Other(message) => SourceError::InvalidResponse(message),
    }
}

fn token_with_lifetime(value: String, expires_in: Option<Duration>) -> AuthToken {
    let lifetime = expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME);
    AuthToken {
        value,
        expires_at: Instant::now() + lifetime,
    }
}

/// Query and fragment parameters of a redirect URL
fn redirect_params(url: &Url) -> HashMap<String, String> {
    let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    if let Some(fragment) = url.fragment() {
        params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
    }
    params
}

/// Decide what a same-origin popup location means.
///
/// `Ok(None)` when the page carries no OAuth result yet. The state check comes
/// before anything else so a forged redirect is never acted on.
fn interpret_redirect(url: &Url, expected_state: &str, flow: AuthFlow) -> Result<Option<Grant>> {
    let params = redirect_params(url);
    let has_result = ["code", "access_token", "error"]
        .iter()
        .any(|key| params.contains_key(*key));
    if !has_result {
        return Ok(None);
    }

    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Err(SourceError::AuthSecurityMismatch);
    }

    if let Some(error) = params.get("error") {
        if error == "access_denied" {
            return Err(SourceError::AuthCancelled);
        }
        let detail = params
            .get("error_description")
            .map(|d| format!("{}: {}", error, d))
            .unwrap_or_else(|| error.clone());
        return Err(SourceError::AuthRejected(detail));
    }

    let grant = match flow {
        AuthFlow::AuthorizationCode => params.get("code").cloned().map(Grant::Code),
        AuthFlow::Implicit => params.get("access_token").map(|value| Grant::Token {
            value: value.clone(),
            expires_in: params.get("expires_in").and_then(|v| v.parse().ok()),
        }),
    };
    grant
        .map(Some)
        .ok_or_else(|| SourceError::AuthRejected("redirect carried no credential".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockResponse, MockServer, MockWindow, PopupBehavior};
    use oauth2::PkceCodeChallenge;

    fn implicit_config() -> AuthConfig {
        AuthConfig {
            flow: AuthFlow::Implicit,
            auth_url: "https://accounts.example.com/auth".to_string(),
            token_url: None,
            client_id: "client".to_string(),
            scope: "drive".to_string(),
            redirect_uri: "http://localhost:8080/oauth/callback.html".to_string(),
            extra_auth_params: vec![],
        }
    }

    fn authenticator(config: AuthConfig, window: Arc<MockWindow>) -> Authenticator {
        Authenticator::new(
            SourceId::GoogleDrive,
            config,
            AuthSettings::default(),
            window,
            reqwest::Client::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_implicit_flow_reuses_token() {
        let window = MockWindow::new(PopupBehavior::Approve {
            after: Duration::from_secs(3),
            token: "tok-1".to_string(),
        });
        let auth = authenticator(implicit_config(), window.clone());

        assert_eq!(auth.state(), AuthState::Unauthenticated);
        assert_eq!(auth.ensure_authenticated().await.unwrap(), "tok-1");
        assert_eq!(auth.state(), AuthState::Authenticated);
        assert_eq!(window.close_count(), 1);

        assert_eq!(auth.ensure_authenticated().await.unwrap(), "tok-1");
        assert_eq!(auth.flows_started(), 1);
        assert_eq!(window.opened().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_sixty_seconds() {
        let window = MockWindow::new(PopupBehavior::Ignore);
        let auth = authenticator(implicit_config(), window.clone());

        let started = Instant::now();
        let err = auth.ensure_authenticated().await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, SourceError::AuthTimeout);
        assert!(elapsed >= Duration::from_secs(60), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(61), "{:?}", elapsed);
        assert_eq!(window.close_count(), 1);
        assert_eq!(auth.state(), AuthState::Failed(SourceError::AuthTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_closing_popup_cancels() {
        let window = MockWindow::new(PopupBehavior::CloseAfter(Duration::from_secs(5)));
        let auth = authenticator(implicit_config(), window.clone());

        let started = Instant::now();
        let err = auth.ensure_authenticated().await.unwrap_err();

        assert_eq!(err, SourceError::AuthCancelled);
        assert!(err.is_expected());
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(window.close_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forged_state_is_rejected() {
        let window = MockWindow::new(PopupBehavior::ForgeState {
            after: Duration::from_secs(1),
        });
        let auth = authenticator(implicit_config(), window.clone());

        let err = auth.ensure_authenticated().await.unwrap_err();
        assert_eq!(err, SourceError::AuthSecurityMismatch);
        assert!(err.is_fatal());
        assert_eq!(window.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_consent_is_cancellation() {
        let window = MockWindow::new(PopupBehavior::Error {
            after: Duration::from_secs(1),
            error: "access_denied".to_string(),
        });
        let auth = authenticator(implicit_config(), window);
        assert_eq!(
            auth.ensure_authenticated().await.unwrap_err(),
            SourceError::AuthCancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_error_is_rejection() {
        let window = MockWindow::new(PopupBehavior::Error {
            after: Duration::from_secs(1),
            error: "invalid_scope".to_string(),
        });
        let auth = authenticator(implicit_config(), window);
        assert!(matches!(
            auth.ensure_authenticated().await,
            Err(SourceError::AuthRejected(msg)) if msg == "invalid_scope"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_runs_new_flow() {
        let window = MockWindow::new(PopupBehavior::Approve {
            after: Duration::from_secs(1),
            token: "tok".to_string(),
        });
        let auth = authenticator(implicit_config(), window.clone());

        auth.ensure_authenticated().await.unwrap();
        time::advance(Duration::from_secs(3601)).await;
        auth.ensure_authenticated().await.unwrap();

        assert_eq!(auth.flows_started(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_new_flow() {
        let window = MockWindow::new(PopupBehavior::Approve {
            after: Duration::from_secs(1),
            token: "tok".to_string(),
        });
        let auth = authenticator(implicit_config(), window.clone());

        auth.ensure_authenticated().await.unwrap();
        auth.invalidate().await;
        assert_eq!(auth.state(), AuthState::Unauthenticated);
        auth.ensure_authenticated().await.unwrap();

        assert_eq!(window.opened().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_popup() {
        let window = MockWindow::new(PopupBehavior::Approve {
            after: Duration::from_secs(2),
            token: "shared".to_string(),
        });
        let auth = authenticator(implicit_config(), window.clone());

        let (a, b) = tokio::join!(auth.ensure_authenticated(), auth.ensure_authenticated());

        assert_eq!(a.unwrap(), "shared");
        assert_eq!(b.unwrap(), "shared");
        assert_eq!(window.opened().len(), 1);
    }

    #[tokio::test]
    async fn test_code_flow_exchanges_with_verifier() {
        let server = MockServer::start().await;
        server.on(
            "POST",
            "/token",
            MockResponse::json(
                200,
                serde_json::json!({"access_token": "sl.abc", "expires_in": 14400, "token_type": "bearer"}),
            ),
        );

        let config = AuthConfig {
            flow: AuthFlow::AuthorizationCode,
            auth_url: "https://www.example.com/oauth2/authorize".to_string(),
            token_url: Some(format!("{}/token", server.url())),
            client_id: "app-key".to_string(),
            scope: "files.content.read".to_string(),
            redirect_uri: "http://localhost:8080/oauth/callback.html".to_string(),
            extra_auth_params: vec![],
        };
        let window = MockWindow::new(PopupBehavior::Approve {
            after: Duration::ZERO,
            token: "the-code".to_string(),
        });
        let auth = authenticator(config, window.clone());

        assert_eq!(auth.ensure_authenticated().await.unwrap(), "sl.abc");

        let opened = window.opened();
        let challenge = opened[0]
            .query_pairs()
            .find(|(k, _)| k == "code_challenge")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        let form = requests[0].form();
        assert_eq!(form["grant_type"], "authorization_code");
        assert_eq!(form["code"], "the-code");
        assert_eq!(form["client_id"], "app-key");
        assert_eq!(form["redirect_uri"], "http://localhost:8080/oauth/callback.html");
        let verifier = PkceCodeVerifier::new(form["code_verifier"].clone());
        assert_eq!(
            PkceCodeChallenge::from_code_verifier_sha256(&verifier).as_str(),
            challenge
        );
    }

    #[tokio::test]
    async fn test_token_endpoint_error_is_rejection() {
        let server = MockServer::start().await;
        server.on(
            "POST",
            "/token",
            MockResponse::json(
                400,
                serde_json::json!({"error": "invalid_grant", "error_description": "code expired"}),
            ),
        );

        let config = AuthConfig {
            flow: AuthFlow::AuthorizationCode,
            auth_url: "https://www.example.com/oauth2/authorize".to_string(),
            token_url: Some(format!("{}/token", server.url())),
            client_id: "app-key".to_string(),
            scope: "files.content.read".to_string(),
            redirect_uri: "http://localhost:8080/oauth/callback.html".to_string(),
            extra_auth_params: vec![],
        };
        let window = MockWindow::new(PopupBehavior::Approve {
            after: Duration::ZERO,
            token: "stale-code".to_string(),
        });
        let auth = authenticator(config, window);

        assert_eq!(
            auth.ensure_authenticated().await.unwrap_err(),
            SourceError::AuthRejected("invalid_grant: code expired".to_string())
        );
        assert!(matches!(auth.state(), AuthState::Failed(SourceError::AuthRejected(_))));
    }

    #[test]
    fn test_redirect_without_result_keeps_polling() {
        let url = Url::parse("http://localhost:8080/oauth/callback.html").unwrap();
        assert!(interpret_redirect(&url, "s", AuthFlow::Implicit)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_fragment_and_query_params_merge() {
        let url = Url::parse("http://h/cb?state=s#access_token=t&expires_in=60").unwrap();
        match interpret_redirect(&url, "s", AuthFlow::Implicit).unwrap() {
            Some(Grant::Token { value, expires_in }) => {
                assert_eq!(value, "t");
                assert_eq!(expires_in, Some(60));
            }
            other => panic!("unexpected grant: {:?}", other),
        }
    }
}
