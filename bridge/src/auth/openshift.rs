//! Cluster-native OAuth login method with server-metadata discovery.
//!
//! The OAuth server publishes its endpoints under
//! `/.well-known/oauth-authorization-server` on the cluster API server, so
//! discovery deliberately talks to the cluster (k8s CA) while the
//! reachability check and the actual OAuth flow use the issuer client
//! (issuer CA).

use axum_extra::extract::cookie::CookieJar;
use cookie::time::Duration as CookieDuration;
use eyre::{Result, WrapErr as _, bail, eyre};
use oauth2::{AuthUrl, TokenResponse as _, TokenUrl};
use serde::Deserialize;
use url::Url;

use super::AuthError;
use super::method::{
    BridgeTokenResponse, LoginState, OAuth2Endpoint, SessionCookieConfig, SpecialAuthUrls,
    session_cookie_name,
};
use crate::proxy::single_joining_slash;

const DEFAULT_SESSION_MAX_AGE: CookieDuration = CookieDuration::hours(24);

/// Login method for the cluster-integrated OAuth server.
#[derive(Debug)]
pub struct OpenShiftAuth {
    cookie: SessionCookieConfig,
    special_urls: SpecialAuthUrls,
}

/// Inputs for [`discover`].
pub struct OpenShiftConfig<'a> {
    /// Client trusting the cluster CA, used for metadata discovery.
    pub k8s_client: &'a reqwest::Client,
    /// Client trusting the issuer CA, used for the reachability check.
    pub oauth_client: &'a reqwest::Client,
    pub issuer_url: &'a str,
    pub cookie: SessionCookieConfig,
}

#[derive(Debug, Deserialize)]
struct OAuthServerMetadata {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
}

fn validate_abs_url(value: &str) -> Result<Url> {
    let url = Url::parse(value).wrap_err_with(|| format!("invalid URL {value}"))?;
    if url.scheme().is_empty() || !url.has_host() {
        bail!("url is not absolute: {value}");
    }
    Ok(url)
}

/// Determine the OAuth2 token and authorization URLs through metadata
/// discovery and construct the login method.
///
/// # Errors
///
/// Fails when the metadata endpoint is unreachable or non-2xx, when any
/// discovered endpoint is not an absolute URL, or when the issuer endpoint
/// does not answer the reachability check.
pub async fn discover(
    config: OpenShiftConfig<'_>,
) -> Result<(OAuth2Endpoint, OpenShiftAuth)> {
    let well_known_url = format!(
        "{}/.well-known/oauth-authorization-server",
        config.issuer_url.trim_end_matches('/')
    );

    let resp = config
        .k8s_client
        .get(&well_known_url)
        .send()
        .await
        .wrap_err_with(|| format!("discovery through endpoint {well_known_url} failed"))?;

    if !resp.status().is_success() {
        bail!(
            "discovery through endpoint {well_known_url} failed: {}",
            resp.status()
        );
    }

    let metadata: OAuthServerMetadata = resp.json().await.wrap_err_with(|| {
        format!("discovery through endpoint {well_known_url} failed to decode body")
    })?;

    validate_abs_url(&metadata.issuer)?;
    validate_abs_url(&metadata.authorization_endpoint)?;
    validate_abs_url(&metadata.token_endpoint)?;

    // Make sure we can talk to the issuer endpoint.
    config
        .oauth_client
        .head(&metadata.issuer)
        .send()
        .await
        .wrap_err_with(|| {
            format!(
                "request to OAuth issuer endpoint {} failed",
                metadata.issuer
            )
        })?;

    // Special pages on the integrated OAuth server: token request and
    // kube:admin logout.
    let request_token = single_joining_slash(&metadata.token_endpoint, "/request");
    let kube_admin_logout = single_joining_slash(&metadata.issuer, "/logout");

    let endpoint = OAuth2Endpoint {
        auth_url: AuthUrl::new(metadata.authorization_endpoint)
            .map_err(|e| eyre!("invalid authorization endpoint: {e}"))?,
        token_url: TokenUrl::new(metadata.token_endpoint)
            .map_err(|e| eyre!("invalid token endpoint: {e}"))?,
    };

    Ok((
        endpoint,
        OpenShiftAuth {
            cookie: config.cookie,
            special_urls: SpecialAuthUrls {
                request_token,
                kube_admin_logout,
            },
        },
    ))
}

impl OpenShiftAuth {
    /// Associates the raw access token with a session cookie. The OAuth
    /// server does not expose name or email, so the login state carries
    /// only the token.
    pub(crate) fn login(
        &self,
        jar: CookieJar,
        token: &BridgeTokenResponse,
    ) -> Result<(CookieJar, LoginState), AuthError> {
        let raw_token = token.access_token().secret().clone();
        if raw_token.is_empty() {
            return Err(AuthError::LoginState(
                "token response did not contain an access token".to_string(),
            ));
        }

        let max_age = token
            .expires_in()
            .and_then(|d| CookieDuration::try_from(d).ok())
            .unwrap_or(DEFAULT_SESSION_MAX_AGE);

        let jar = jar.add(self.cookie.build_session_cookie(raw_token.clone(), max_age));
        Ok((
            jar,
            LoginState {
                raw_token,
                user_id: String::new(),
                username: String::new(),
                email: String::new(),
            },
        ))
    }

    pub(crate) fn logout(&self, jar: CookieJar) -> CookieJar {
        jar.add(self.cookie.build_clear_cookie())
    }

    pub(crate) fn special_urls(&self) -> SpecialAuthUrls {
        self.special_urls.clone()
    }

    pub(crate) fn authenticate(
        &self,
        jar: &CookieJar,
    ) -> Result<super::method::User, AuthError> {
        user_from_jar(jar, &self.cookie.cluster)
    }
}

/// Reconstruct the user for a cluster from its session cookie.
///
/// The cookie is not validated here; the cluster API server is the authority
/// and rejects forged or expired tokens.
pub fn user_from_jar(jar: &CookieJar, cluster: &str) -> Result<super::method::User, AuthError> {
    let cookie_name = session_cookie_name(cluster);
    let cookie = jar
        .get(&cookie_name)
        .ok_or_else(|| AuthError::Unauthenticated(format!("no cookie {cookie_name}")))?;
    if cookie.value().is_empty() {
        return Err(AuthError::Unauthenticated(format!(
            "no value for cookie {cookie_name}"
        )));
    }

    Ok(super::method::User {
        id: String::new(),
        username: String::new(),
        token: cookie.value().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use axum::Json;
    use axum::Router;
    use axum::routing::{get, head};
    use cookie::Cookie;
    use oauth2::AccessToken;
    use oauth2::basic::BasicTokenType;
    use serde_json::json;

    use super::super::method::{IdTokenField, LOCAL_CLUSTER};
    use super::*;

    fn cookie_config() -> SessionCookieConfig {
        SessionCookieConfig {
            path: "/api/".to_string(),
            secure: true,
            domain: None,
            cluster: LOCAL_CLUSTER.to_string(),
        }
    }

    fn token_response(access_token: &str) -> BridgeTokenResponse {
        BridgeTokenResponse::new(
            AccessToken::new(access_token.to_string()),
            BasicTokenType::Bearer,
            IdTokenField { id_token: None },
        )
    }

    async fn serve_discovery() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));

        let issuer = base.clone();
        let app = Router::new()
            .route(
                "/.well-known/oauth-authorization-server",
                get(move || {
                    let issuer = issuer.clone();
                    async move {
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

        base
    }

    #[tokio::test]
    async fn discovery_derives_endpoints_and_special_urls() {
        let base = serve_discovery().await;
        let client = reqwest::Client::new();

        let (endpoint, method) = discover(OpenShiftConfig {
            k8s_client: &client,
            oauth_client: &client,
            issuer_url: &base,
            cookie: cookie_config(),
        })
        .await
        .expect("discovery succeeds");

        assert_eq!(endpoint.auth_url.as_str(), format!("{base}/authorize"));
        assert_eq!(endpoint.token_url.as_str(), format!("{base}/token"));
        assert_eq!(
            method.special_urls(),
            SpecialAuthUrls {
                request_token: format!("{base}/token/request"),
                kube_admin_logout: format!("{base}/logout"),
            }
        );
    }

    #[tokio::test]
    async fn discovery_fails_when_provider_is_down() {
        let client = reqwest::Client::new();
        let result = discover(OpenShiftConfig {
            k8s_client: &client,
            oauth_client: &client,
            // Port reserved but nothing is listening once the listener drops.
            issuer_url: "http://127.0.0.1:1",
            cookie: cookie_config(),
        })
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn login_requires_access_token() {
        let (_, method) = openshift_auth();
        let err = method
            .login(CookieJar::new(), &token_response(""))
            .expect_err("empty access token must fail");
        assert!(matches!(err, AuthError::LoginState(_)));
    }

    #[test]
    fn login_sets_session_cookie() {
        let (_, method) = openshift_auth();
        let (jar, state) = method
            .login(CookieJar::new(), &token_response("sha256~abc"))
            .expect("login succeeds");
        assert_eq!(state.raw_token, "sha256~abc");
        let cookie = jar.get("console-session-token").expect("cookie set");
        assert_eq!(cookie.value(), "sha256~abc");
    }

    #[test]
    fn logout_then_user_lookup_fails() {
        let (_, method) = openshift_auth();
        let jar = CookieJar::new().add(Cookie::new("console-session-token", "sha256~abc"));
        assert!(user_from_jar(&jar, LOCAL_CLUSTER).is_ok());

        let jar = method.logout(jar);
        // The overwritten cookie has an empty value, which is treated as no
        // session.
        assert!(user_from_jar(&jar, LOCAL_CLUSTER).is_err());
    }

    #[test]
    fn user_from_jar_reads_per_cluster_cookie() {
        let jar = CookieJar::new().add(Cookie::new("console-session-token-east-1", "tok"));
        let user = user_from_jar(&jar, "east-1").expect("cookie resolves");
        assert_eq!(user.token, "tok");
        assert!(user_from_jar(&jar, LOCAL_CLUSTER).is_err());
    }

    fn openshift_auth() -> (OAuth2Endpoint, OpenShiftAuth) {
        let endpoint = OAuth2Endpoint {
            auth_url: AuthUrl::new("https://oauth.example/authorize".to_string())
                .expect("valid url"),
            token_url: TokenUrl::new("https://oauth.example/token".to_string())
                .expect("valid url"),
        };
        let method = OpenShiftAuth {
            cookie: cookie_config(),
            special_urls: SpecialAuthUrls::default(),
        };
        (endpoint, method)
    }
}
