//! OAuth2 Authentication Module
//!
//! Obtains access tokens through a popup window that is polled until the
//! provider redirects back to the host application's callback page. Google
//! Drive uses the implicit-token flow; Dropbox and OneDrive use the
//! authorization-code flow with PKCE.

pub mod console;
pub mod manager;
pub mod popup;

pub use console::ConsoleWindow;
pub use manager::{AuthState, Authenticator};
pub use popup::{AuthPopup, AuthWindow, PopupGeometry, PopupLocation, WindowFrame};

use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, ClientId, CsrfToken, EndpointMaybeSet, EndpointNotSet, EndpointSet,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope, TokenUrl,
};
use tokio::time::Instant;
use url::Url;

use crate::error::{Result, SourceError};

/// OAuth2 client with the authorization endpoint set and an optional token endpoint
pub(crate) type OAuthClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointMaybeSet>;

/// Which OAuth2 grant a provider supports for a public client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlow {
    /// Authorization code exchanged at the token endpoint, protected by PKCE
    AuthorizationCode,
    /// Access token returned directly in the redirect
    Implicit,
}

/// OAuth2 configuration for a provider
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub flow: AuthFlow,
    pub auth_url: String,
    /// Required for the authorization code flow
    pub token_url: Option<String>,
    pub client_id: String,
    /// Space-separated scope string
    pub scope: String,
    pub redirect_uri: String,
    /// Extra query parameters for the authorization URL
    pub extra_auth_params: Vec<(String, String)>,
}

/// A started authorization: the popup URL and the secrets needed to finish it
pub struct PendingAuthorization {
    pub url: Url,
    pub state: CsrfToken,
    /// Present for the authorization code flow
    pub verifier: Option<PkceCodeVerifier>,
}

fn invalid_config(what: &str, err: impl std::fmt::Display) -> SourceError {
    SourceError::AuthRejected(format!("invalid {}: {}", what, err))
}

impl AuthConfig {
    pub(crate) fn client(&self) -> Result<OAuthClient> {
        let auth_url =
            AuthUrl::new(self.auth_url.clone()).map_err(|e| invalid_config("authorization URL", e))?;
        let token_url = self
            .token_url
            .clone()
            .map(TokenUrl::new)
            .transpose()
            .map_err(|e| invalid_config("token URL", e))?;
        let redirect_url =
            RedirectUrl::new(self.redirect_uri.clone()).map_err(|e| invalid_config("redirect URI", e))?;

        Ok(BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri_option(token_url)
            .set_redirect_uri(redirect_url))
    }

    /// Build the URL the popup is pointed at, with a fresh state and PKCE pair
    pub fn start_authorization(&self) -> Result<PendingAuthorization> {
        let client = self.client()?;
        let mut request = client.authorize_url(CsrfToken::new_random);

        for scope in self.scope.split_whitespace() {
            request = request.add_scope(Scope::new(scope.to_string()));
        }
        for (key, value) in &self.extra_auth_params {
            request = request.add_extra_param(key.as_str(), value.as_str());
        }

        let verifier = match self.flow {
            AuthFlow::AuthorizationCode => {
                let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
                request = request.set_pkce_challenge(challenge);
                Some(verifier)
            }
            AuthFlow::Implicit => {
                request = request.use_implicit_flow();
                None
            }
        };

        let (url, state) = request.url();
        Ok(PendingAuthorization {
            url,
            state,
            verifier,
        })
    }
}

/// Access token held by an authenticator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub expires_at: Instant,
}

impl AuthToken {
    pub fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}
