//! OAuth2 login core: the [`Authenticator`] drives the authorization-code
//! flow against one provider and delegates session handling to a
//! [`LoginMethod`].
//!
//! Provider discovery self-heals: the cluster-native variant re-discovers on
//! every login-flow call and falls back to the last known good snapshot, the
//! OIDC variant refreshes its provider metadata when a signed session stops
//! verifying (key rotation). Per-request authentication works off the cached
//! snapshot and never contacts the provider.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, header};
use axum_extra::extract::cookie::CookieJar;
use cookie::{Cookie, SameSite};
use eyre::{Result, WrapErr as _};
use oauth2::{AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope};
use oauth2_reqwest::ReqwestClient;
use rand::RngExt as _;
use rand::distr::Alphanumeric;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;
use subtle::ConstantTimeEq as _;
use tokio::sync::RwLock;
use url::Url;

pub mod method;
pub mod oidc;
pub mod openshift;
pub mod registry;

pub use method::{
    LOCAL_CLUSTER, LoginJson, LoginMethod, OAuthClient, SessionCookieConfig, SpecialAuthUrls,
    User, session_cookie_name,
};
pub use registry::AuthRuntime;

/// Cookie holding the anti-CSRF token, readable by frontend scripts.
pub const CSRF_COOKIE_NAME: &str = "csrf-token";
/// Header the frontend echoes the CSRF cookie back in.
pub const CSRF_HEADER: &str = "X-CSRFToken";
const STATE_COOKIE_NAME: &str = "login-state";

const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);
const DEFAULT_MAX_STEPS: u32 = 30;

/// Minimum spacing between provider refreshes triggered by failing session
/// verifications. Caps the discovery traffic a flood of bad cookies can
/// cause.
const KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Authentication failures, each mapped to the error code the frontend's
/// error page understands.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("OAuth provider returned an error: {0}")]
    OAuth(String),
    #[error("error constructing login state: {0}")]
    LoginState(String),
    #[error("cookie error: {0}")]
    Cookie(String),
    #[error("{0}")]
    Internal(String),
    #[error("missing auth code in query param")]
    MissingCode,
    #[error("missing state cookie")]
    MissingState,
    #[error("unable to verify auth code with issuer: {0}")]
    InvalidCode(String),
    #[error("state in url does not match state cookie")]
    InvalidState,
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
    #[error("session token rejected: {0}")]
    TokenVerification(String),
    #[error("invalid request source: {0}")]
    InvalidOrigin(String),
    #[error("invalid CSRF token: {0}")]
    InvalidCsrf(String),
}

impl AuthError {
    /// Error code carried in the redirect to the frontend error page.
    pub fn code(&self) -> &'static str {
        match *self {
            Self::OAuth(_) => "oauth_error",
            Self::LoginState(_) => "login_state_error",
            Self::Cookie(_) => "cookie_error",
            Self::MissingCode => "missing_code",
            Self::MissingState => "missing_state",
            Self::InvalidCode(_) => "invalid_code",
            Self::InvalidState => "invalid_state",
            Self::Internal(_)
            | Self::Unauthenticated(_)
            | Self::TokenVerification(_)
            | Self::InvalidOrigin(_)
            | Self::InvalidCsrf(_) => "internal_error",
        }
    }
}

/// Which provider flavor backs the authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Oidc,
    OpenShift,
}

/// Everything needed to construct an [`Authenticator`].
#[derive(Debug, Clone)]
pub struct Config {
    pub source: SourceKind,
    pub issuer_url: String,
    /// CA bundle for talking to the issuer. `None` uses the ambient roots.
    pub issuer_ca: Option<PathBuf>,
    /// CA bundle for OAuth metadata discovery against the API server, which
    /// may differ from the issuer CA.
    pub k8s_ca: Option<PathBuf>,
    pub client_id: String,
    pub client_secret: Arc<SecretString>,
    pub scopes: Vec<String>,
    pub redirect_url: String,
    /// Frontend page users land on after a failed login.
    pub error_url: String,
    /// Frontend page users land on after a successful login.
    pub success_url: String,
    /// Expected origin of browser requests, used for CSRF origin checks.
    pub referer_url: String,
    pub cookie: SessionCookieConfig,
}

/// One successful discovery result.
#[derive(Debug, Clone)]
struct AuthSource {
    endpoint: method::OAuth2Endpoint,
    method: LoginMethod,
}

/// Non-success outcomes of the OAuth2 callback.
#[derive(Debug)]
pub enum CallbackError {
    /// Neither `code` nor `error` present: a stray redirect, not a failure.
    Benign,
    Auth(AuthError),
}

/// Query parameters of the OAuth2 callback.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

pub struct Authenticator {
    config: Config,
    clients: Arc<crate::client_cache::ClientCache>,
    /// Client built at startup, used when the CA file later becomes
    /// unreadable.
    fallback_client: reqwest::Client,
    redirect_url: RedirectUrl,
    referer: Url,
    source: RwLock<AuthSource>,
    last_key_refresh: tokio::sync::Mutex<Option<Instant>>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("source", &self.config.source)
            .field("issuer_url", &self.config.issuer_url)
            .finish_non_exhaustive()
    }
}

/// Whether a raw Origin/Referer value spells out a path component.
fn has_explicit_path(raw: &str) -> bool {
    raw.split_once("://")
        .is_some_and(|(_, rest)| rest.contains('/'))
}

async fn discover_source(
    config: &Config,
    clients: &crate::client_cache::ClientCache,
    fallback_client: &reqwest::Client,
) -> Result<AuthSource> {
    let oauth_client = match clients.client_for(config.issuer_ca.as_deref(), true) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "failed to get latest http client");
            fallback_client.clone()
        }
    };

    match config.source {
        SourceKind::Oidc => {
            let (endpoint, method) = oidc::discover(oidc::OidcConfig {
                oauth_client: &oauth_client,
                issuer_url: &config.issuer_url,
                client_id: &config.client_id,
                client_secret: &config.client_secret,
                cookie: config.cookie.clone(),
            })
            .await?;
            Ok(AuthSource {
                endpoint,
                method: LoginMethod::Oidc(Arc::new(method)),
            })
        }
        SourceKind::OpenShift => {
            let k8s_client = clients.client_for(config.k8s_ca.as_deref(), true)?;
            let (endpoint, method) = openshift::discover(openshift::OpenShiftConfig {
                k8s_client: &k8s_client,
                oauth_client: &oauth_client,
                issuer_url: &config.issuer_url,
                cookie: config.cookie.clone(),
            })
            .await?;
            Ok(AuthSource {
                endpoint,
                method: LoginMethod::OpenShift(Arc::new(method)),
            })
        }
    }
}

impl Authenticator {
    /// Construct an authenticator, blocking until the provider can be
    /// contacted. Retries every 10 seconds for 5 minutes.
    ///
    /// # Errors
    ///
    /// Fails when the provider stays unreachable past the retry window, the
    /// redirect or referer URL is malformed, or the issuer CA cannot be
    /// loaded.
    pub async fn new(
        config: Config,
        clients: Arc<crate::client_cache::ClientCache>,
    ) -> Result<Self> {
        Self::with_backoff(config, clients, DEFAULT_BACKOFF, DEFAULT_MAX_STEPS).await
    }

    pub async fn with_backoff(
        config: Config,
        clients: Arc<crate::client_cache::ClientCache>,
        backoff: Duration,
        max_steps: u32,
    ) -> Result<Self> {
        let fallback_client = clients.client_for(config.issuer_ca.as_deref(), true)?;
        let redirect_url = RedirectUrl::new(config.redirect_url.clone())
            .map_err(|e| eyre::eyre!("invalid redirect URL: {e}"))?;
        let referer =
            Url::parse(&config.referer_url).wrap_err("invalid referer URL")?;

        let mut steps = 0;
        let source = loop {
            match discover_source(&config, &clients, &fallback_client).await {
                Ok(source) => break source,
                Err(e) => {
                    steps += 1;
                    if steps > max_steps {
                        return Err(e.wrap_err("error contacting auth provider"));
                    }
                    tracing::error!(
                        error = %e,
                        retry_in = ?backoff,
                        "error contacting auth provider"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        };

        Ok(Self {
            config,
            clients,
            fallback_client,
            redirect_url,
            referer,
            source: RwLock::new(source),
            last_key_refresh: tokio::sync::Mutex::new(None),
        })
    }

    /// Latest auth source for the login flow. The OIDC source is stateful
    /// and only replaced on an explicit refresh; the cluster-native source
    /// is re-discovered per login so OAuth server roll-outs are picked up,
    /// keeping the last good snapshot when discovery fails. Per-request
    /// authentication must not go through here; it reads the snapshot
    /// directly.
    async fn current_source(&self) -> AuthSource {
        if self.config.source == SourceKind::Oidc {
            return self.source.read().await.clone();
        }

        match discover_source(&self.config, &self.clients, &self.fallback_client).await {
            Ok(fresh) => {
                *self.source.write().await = fresh.clone();
                fresh
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to get latest auth source data");
                self.source.read().await.clone()
            }
        }
    }

    async fn refresh_source(&self) -> Result<AuthSource> {
        let fresh = discover_source(&self.config, &self.clients, &self.fallback_client).await?;
        *self.source.write().await = fresh.clone();
        Ok(fresh)
    }

    /// Whether a verification-triggered provider refresh is allowed yet,
    /// claiming the slot when it is.
    async fn key_refresh_due(&self) -> bool {
        let mut last = self.last_key_refresh.lock().await;
        match *last {
            Some(at) if at.elapsed() < KEY_REFRESH_INTERVAL => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    // Rebuilt per call so no request can mutate shared endpoint state.
    fn oauth2_client(&self, endpoint: &method::OAuth2Endpoint) -> OAuthClient {
        oauth2::Client::new(ClientId::new(self.config.client_id.clone()))
            .set_client_secret(ClientSecret::new(
                self.config.client_secret.expose_secret().to_string(),
            ))
            .set_auth_uri(endpoint.auth_url.clone())
            .set_token_uri(endpoint.token_url.clone())
            .set_redirect_uri(self.redirect_url.clone())
    }

    fn oauth_http_client(&self) -> reqwest::Client {
        match self
            .clients
            .client_for(self.config.issuer_ca.as_deref(), true)
        {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(error = %e, "failed to get latest http client");
                self.fallback_client.clone()
            }
        }
    }

    /// Start the login flow: bind a random state value to a cookie and
    /// return the provider authorization URL to redirect to.
    pub async fn login_redirect(&self, jar: CookieJar) -> (CookieJar, String) {
        let state = hex::encode(rand::rng().random::<[u8; 4]>());

        let mut builder = Cookie::build((STATE_COOKIE_NAME, state.clone()))
            .http_only(true)
            .secure(self.config.cookie.secure)
            // Must cover the callback paths of all clusters.
            .path("/");
        if let Some(ref domain) = self.config.cookie.domain {
            builder = builder.domain(domain.clone());
        }
        let jar = jar.add(builder.build());

        let source = self.current_source().await;
        let client = self.oauth2_client(&source.endpoint);
        let mut request = client.authorize_url(move || CsrfToken::new(state));
        for scope in &self.config.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (auth_url, _) = request.url();

        (jar, auth_url.to_string())
    }

    /// Complete the login flow: validate state, exchange the code and hand
    /// the token to the login method.
    ///
    /// # Errors
    ///
    /// [`CallbackError::Benign`] when the request carries neither `code` nor
    /// `error`; [`CallbackError::Auth`] for state/code validation and
    /// exchange failures.
    pub async fn callback(
        &self,
        jar: CookieJar,
        params: CallbackParams,
    ) -> Result<(CookieJar, LoginJson), CallbackError> {
        let Some(state_cookie) = jar.get(STATE_COOKIE_NAME) else {
            tracing::error!("failed to get state cookie");
            return Err(CallbackError::Auth(AuthError::MissingState));
        };
        let state_cookie = state_cookie.value().to_string();

        // Lack of both `error` and `code` indicates some stray redirect.
        if params.error.is_none() && params.code.is_none() {
            return Err(CallbackError::Benign);
        }

        let Some(code) = params.code else {
            tracing::error!("missing auth code in query param");
            return Err(CallbackError::Auth(AuthError::MissingCode));
        };

        if params.state.as_deref() != Some(state_cookie.as_str()) {
            tracing::error!("state in url does not match state cookie");
            return Err(CallbackError::Auth(AuthError::InvalidState));
        }

        let source = self.current_source().await;
        let client = self.oauth2_client(&source.endpoint);
        let http = ReqwestClient::from(self.oauth_http_client());
        let token = client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(&http)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "unable to verify auth code with issuer");
                CallbackError::Auth(AuthError::InvalidCode(e.to_string()))
            })?;

        let (jar, login_state) = source.method.login(jar, &token).map_err(|e| {
            tracing::error!(error = %e, "error constructing login state");
            CallbackError::Auth(AuthError::Internal(e.to_string()))
        })?;

        tracing::info!(success_url = %self.config.success_url, "oauth success");
        Ok((jar, login_state.to_login_json()))
    }

    /// Resolve the user for a request from its session cookie.
    ///
    /// Works off the cached discovery snapshot; user extraction only reads
    /// the cookie, so no provider round trip lands on the request path. An
    /// OIDC signature failure of a well-formed token triggers a rate-limited
    /// provider refresh to pick up rotated signing keys; malformed or
    /// expired tokens never do.
    pub async fn authenticate(&self, jar: &CookieJar) -> Result<User, AuthError> {
        let source = self.source.read().await.clone();
        match source.method.authenticate(jar) {
            Ok(user) => Ok(user),
            Err(e) => {
                if !matches!(e, AuthError::TokenVerification(_)) || !self.key_refresh_due().await
                {
                    return Err(e);
                }
                tracing::info!("session verification failed, refreshing provider metadata");
                match self.refresh_source().await {
                    Ok(fresh) => fresh.method.authenticate(jar),
                    Err(refresh_err) => {
                        tracing::error!(error = %refresh_err, "failed to refresh provider metadata");
                        Err(e)
                    }
                }
            }
        }
    }

    pub async fn logout(&self, jar: CookieJar) -> CookieJar {
        self.current_source().await.method.logout(jar)
    }

    pub async fn special_urls(&self) -> SpecialAuthUrls {
        self.current_source().await.method.special_urls()
    }

    pub fn success_url(&self) -> &str {
        &self.config.success_url
    }

    pub fn cookie_path(&self) -> &str {
        &self.config.cookie.path
    }

    /// URL of the frontend error page carrying the auth error code.
    pub fn error_redirect_url(&self, err: &AuthError) -> String {
        let base = self
            .config
            .error_url
            .split('?')
            .next()
            .unwrap_or(&self.config.error_url);
        format!("{base}?error={}&error_type=auth", err.code())
    }

    /// URL of the frontend error page without an error code, for benign
    /// stray redirects.
    pub fn error_url(&self) -> &str {
        &self.config.error_url
    }

    /// Check that the `Origin` header, or failing that the `Referer`
    /// header, matches the expected frontend origin.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidOrigin`] when both headers are absent or
    /// the present one names a different origin.
    pub fn verify_source_origin(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let source = headers
            .get(header::ORIGIN)
            .or_else(|| headers.get(header::REFERER))
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AuthError::InvalidOrigin("no Origin or Referer header in request".to_string())
            })?;

        let url = Url::parse(source)
            .map_err(|e| AuthError::InvalidOrigin(format!("unparsable source {source}: {e}")))?;

        // The Origin header carries no path and the parser normalizes that
        // to "/"; only exempt the truly path-less form. An explicit "/" in a
        // Referer must still match the expected path.
        let path_ok = !has_explicit_path(source) || url.path().starts_with(self.referer.path());
        let valid = self.referer.host_str() == url.host_str()
            && self.referer.port() == url.port()
            && self.referer.scheme() == url.scheme()
            && path_ok;

        if !valid {
            return Err(AuthError::InvalidOrigin(format!(
                "invalid Origin or Referer: {source} expected `{}`",
                self.referer
            )));
        }
        Ok(())
    }

    /// Issue a fresh CSRF token cookie. Not HttpOnly, the frontend reads it
    /// and echoes it back in the `X-CSRFToken` header.
    pub fn set_csrf_cookie(&self, path: &str, jar: CookieJar) -> CookieJar {
        let token: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(64)
            .map(char::from)
            .collect();

        let mut builder = Cookie::build((CSRF_COOKIE_NAME, token))
            .http_only(false)
            .secure(self.config.cookie.secure)
            .same_site(SameSite::Lax)
            .path(path.to_string());
        if let Some(ref domain) = self.config.cookie.domain {
            builder = builder.domain(domain.clone());
        }
        jar.add(builder.build())
    }

    /// Compare the `X-CSRFToken` header against the CSRF cookie in constant
    /// time.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCsrf`] when the cookie is absent or the
    /// values differ.
    pub fn verify_csrf_token(
        &self,
        headers: &HeaderMap,
        jar: &CookieJar,
    ) -> Result<(), AuthError> {
        let token = headers
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let cookie = jar
            .get(CSRF_COOKIE_NAME)
            .ok_or_else(|| AuthError::InvalidCsrf("no CSRF cookie".to_string()))?;

        if bool::from(token.as_bytes().ct_eq(cookie.value().as_bytes())) {
            Ok(())
        } else {
            Err(AuthError::InvalidCsrf(
                "CSRF token does not match CSRF cookie".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Json;
    use axum::Router;
    use axum::http::HeaderValue;
    use axum::routing::{get, head};
    use serde_json::json;

    use crate::client_cache::ClientCache;

    use super::*;

    /// Cluster-native metadata server counting discovery fetches.
    async fn serve_oauth_metadata() -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let fetches = Arc::new(AtomicUsize::new(0));

        let issuer = base.clone();
        let counter = fetches.clone();
        let app = Router::new()
            .route(
                "/.well-known/oauth-authorization-server",
                get(move || {
                    let issuer = issuer.clone();
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Json(json!({
                            "issuer": issuer,
                            "authorization_endpoint": format!("{issuer}/authorize"),
                            "token_endpoint": format!("{issuer}/token"),
                        }))
                    }
                }),
            )
            .route("/", head(|| async { "" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server");
        });

        (base, fetches)
    }

    /// OIDC metadata server counting discovery fetches.
    async fn serve_oidc_metadata() -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let fetches = Arc::new(AtomicUsize::new(0));

        let issuer = base.clone();
        let counter = fetches.clone();
        let app = Router::new()
            .route(
                "/.well-known/openid-configuration",
                get(move || {
                    let issuer = issuer.clone();
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Json(json!({
                            "issuer": issuer,
                            "authorization_endpoint": format!("{issuer}/authorize"),
                            "token_endpoint": format!("{issuer}/token"),
                            "jwks_uri": format!("{issuer}/keys"),
                            "response_types_supported": ["code"],
                            "subject_types_supported": ["public"],
                            "id_token_signing_alg_values_supported": ["RS256"],
                        }))
                    }
                }),
            )
            .route("/keys", get(|| async { Json(json!({"keys": []})) }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server");
        });

        (base, fetches)
    }

    fn test_config(issuer: &str) -> Config {
        Config {
            source: SourceKind::OpenShift,
            issuer_url: issuer.to_string(),
            issuer_ca: None,
            k8s_ca: None,
            client_id: "console".to_string(),
            client_secret: Arc::new(SecretString::from("hunter2")),
            scopes: vec!["user:full".to_string()],
            redirect_url: format!("{issuer}/auth/callback"),
            error_url: "/error".to_string(),
            success_url: "/".to_string(),
            referer_url: format!("{issuer}/"),
            cookie: SessionCookieConfig {
                path: "/api/".to_string(),
                secure: false,
                domain: None,
                cluster: LOCAL_CLUSTER.to_string(),
            },
        }
    }

    async fn test_authenticator() -> (String, Authenticator) {
        let (base, _) = serve_oauth_metadata().await;
        let clients = Arc::new(ClientCache::new().expect("client cache"));
        let auther = Authenticator::with_backoff(
            test_config(&base),
            clients,
            Duration::from_millis(1),
            1,
        )
        .await
        .expect("authenticator construction");
        (base, auther)
    }

    #[tokio::test]
    async fn construction_fails_when_provider_unreachable() {
        let clients = Arc::new(ClientCache::new().expect("client cache"));
        let result = Authenticator::with_backoff(
            test_config("http://127.0.0.1:1"),
            clients,
            Duration::from_millis(1),
            2,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn login_redirect_sets_state_cookie() {
        let (base, auther) = test_authenticator().await;
        let (jar, url) = auther.login_redirect(CookieJar::new()).await;

        let state = jar.get(STATE_COOKIE_NAME).expect("state cookie set");
        assert_eq!(state.value().len(), 8);
        assert!(state.value().chars().all(|c| c.is_ascii_hexdigit()));

        assert!(url.starts_with(&format!("{base}/authorize")));
        assert!(url.contains(&format!("state={}", state.value())));
        assert!(url.contains("client_id=console"));
    }

    #[tokio::test]
    async fn callback_rejects_missing_state_cookie() {
        let (_, auther) = test_authenticator().await;
        let params = CallbackParams {
            code: Some("abc".to_string()),
            state: Some("deadbeef".to_string()),
            error: None,
        };
        let err = auther
            .callback(CookieJar::new(), params)
            .await
            .expect_err("missing state cookie must fail");
        assert!(matches!(
            err,
            CallbackError::Auth(AuthError::MissingState)
        ));
    }

    #[tokio::test]
    async fn callback_without_code_or_error_is_benign() {
        let (_, auther) = test_authenticator().await;
        let jar = CookieJar::new().add(Cookie::new(STATE_COOKIE_NAME, "deadbeef"));
        let params = CallbackParams {
            code: None,
            state: None,
            error: None,
        };
        let err = auther
            .callback(jar, params)
            .await
            .expect_err("no params is a stray redirect");
        assert!(matches!(err, CallbackError::Benign));
    }

    #[tokio::test]
    async fn callback_rejects_state_mismatch() {
        let (_, auther) = test_authenticator().await;
        let jar = CookieJar::new().add(Cookie::new(STATE_COOKIE_NAME, "deadbeef"));
        let params = CallbackParams {
            code: Some("abc".to_string()),
            state: Some("attacker".to_string()),
            error: None,
        };
        let err = auther
            .callback(jar, params)
            .await
            .expect_err("state mismatch must fail");
        assert!(matches!(
            err,
            CallbackError::Auth(AuthError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn authenticate_does_not_contact_the_provider() {
        let (base, fetches) = serve_oauth_metadata().await;
        let clients = Arc::new(ClientCache::new().expect("client cache"));
        let auther = Authenticator::with_backoff(
            test_config(&base),
            clients,
            Duration::from_millis(1),
            1,
        )
        .await
        .expect("authenticator construction");

        let discovered = fetches.load(Ordering::SeqCst);
        let jar = CookieJar::new().add(Cookie::new("console-session-token", "sha256~abc"));
        for _ in 0..5 {
            auther
                .authenticate(&jar)
                .await
                .expect("session cookie resolves");
        }
        assert_eq!(
            fetches.load(Ordering::SeqCst),
            discovered,
            "user resolution must not re-run discovery"
        );
    }

    #[tokio::test]
    async fn garbage_sessions_do_not_trigger_provider_refresh() {
        let (base, fetches) = serve_oidc_metadata().await;
        let clients = Arc::new(ClientCache::new().expect("client cache"));
        let mut config = test_config(&base);
        config.source = SourceKind::Oidc;
        let auther =
            Authenticator::with_backoff(config, clients, Duration::from_millis(1), 1)
                .await
                .expect("authenticator construction");

        let discovered = fetches.load(Ordering::SeqCst);
        let jar = CookieJar::new().add(Cookie::new("console-session-token", "not-a-jwt"));
        for _ in 0..5 {
            assert!(auther.authenticate(&jar).await.is_err());
        }
        assert_eq!(
            fetches.load(Ordering::SeqCst),
            discovered,
            "malformed sessions must not refresh provider metadata"
        );
    }

    #[tokio::test]
    async fn source_origin_matches_exact_origin() {
        let (base, auther) = test_authenticator().await;

        let mut headers = HeaderMap::new();
        assert!(auther.verify_source_origin(&headers).is_err());

        headers.insert(
            header::ORIGIN,
            HeaderValue::from_str(&base).expect("header value"),
        );
        assert!(auther.verify_source_origin(&headers).is_ok());

        headers.insert(
            header::ORIGIN,
            HeaderValue::from_static("https://evil.example"),
        );
        assert!(auther.verify_source_origin(&headers).is_err());
    }

    #[tokio::test]
    async fn source_origin_falls_back_to_referer() {
        let (base, auther) = test_authenticator().await;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::REFERER,
            HeaderValue::from_str(&format!("{base}/some/page")).expect("header value"),
        );
        assert!(auther.verify_source_origin(&headers).is_ok());

        headers.insert(
            header::REFERER,
            HeaderValue::from_static("https://evil.example/some/page"),
        );
        assert!(auther.verify_source_origin(&headers).is_err());
    }

    #[tokio::test]
    async fn source_origin_respects_the_base_path() {
        let (base, _) = serve_oauth_metadata().await;
        let clients = Arc::new(ClientCache::new().expect("client cache"));
        let mut config = test_config(&base);
        config.referer_url = format!("{base}/console/");
        let auther =
            Authenticator::with_backoff(config, clients, Duration::from_millis(1), 1)
                .await
                .expect("authenticator construction");

        // Origin never carries a path.
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ORIGIN,
            HeaderValue::from_str(&base).expect("header value"),
        );
        assert!(auther.verify_source_origin(&headers).is_ok());

        // An explicit "/" is outside the base path.
        let mut headers = HeaderMap::new();
        headers.insert(
            header::REFERER,
            HeaderValue::from_str(&format!("{base}/")).expect("header value"),
        );
        assert!(auther.verify_source_origin(&headers).is_err());

        headers.insert(
            header::REFERER,
            HeaderValue::from_str(&format!("{base}/console/page")).expect("header value"),
        );
        assert!(auther.verify_source_origin(&headers).is_ok());
    }

    #[tokio::test]
    async fn csrf_token_must_match_cookie() {
        let (_, auther) = test_authenticator().await;

        let jar = auther.set_csrf_cookie("/", CookieJar::new());
        let csrf = jar.get(CSRF_COOKIE_NAME).expect("csrf cookie set");
        assert_eq!(csrf.value().len(), 64);
        assert!(!csrf.http_only().unwrap_or(false));

        let mut headers = HeaderMap::new();
        assert!(auther.verify_csrf_token(&headers, &jar).is_err());

        headers.insert(
            CSRF_HEADER,
            HeaderValue::from_str(csrf.value()).expect("header value"),
        );
        assert!(auther.verify_csrf_token(&headers, &jar).is_ok());

        headers.insert(CSRF_HEADER, HeaderValue::from_static("forged"));
        assert!(auther.verify_csrf_token(&headers, &jar).is_err());
    }

    #[tokio::test]
    async fn error_redirect_carries_code_and_type() {
        let (_, auther) = test_authenticator().await;
        assert_eq!(
            auther.error_redirect_url(&AuthError::InvalidState),
            "/error?error=invalid_state&error_type=auth"
        );
        assert_eq!(
            auther.error_redirect_url(&AuthError::MissingCode),
            "/error?error=missing_code&error_type=auth"
        );
    }
}
