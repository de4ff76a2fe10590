//! Shared login-method types: the polymorphic method dispatch, session
//! state, and the OAuth2 client plumbing both variants exchange codes with.

use std::sync::Arc;

use axum_extra::extract::cookie::CookieJar;
use cookie::time::Duration as CookieDuration;
use cookie::{Cookie, SameSite};
use oauth2::basic::{BasicErrorResponseType, BasicTokenType};
use oauth2::{
    AuthUrl, EndpointNotSet, EndpointSet, ExtraTokenFields, StandardErrorResponse,
    StandardRevocableToken, StandardTokenIntrospectionResponse, StandardTokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};

use super::AuthError;
use super::oidc::OidcAuth;
use super::openshift::OpenShiftAuth;

/// Name of the local/primary cluster in the registries.
pub const LOCAL_CLUSTER: &str = "local-cluster";

const SESSION_COOKIE_BASE: &str = "console-session-token";

/// Session cookie name for a cluster. The local cluster uses the fixed base
/// name; other clusters append their name as a suffix.
pub fn session_cookie_name(cluster: &str) -> String {
    if cluster == LOCAL_CLUSTER || cluster.is_empty() {
        SESSION_COOKIE_BASE.to_string()
    } else {
        format!("{SESSION_COOKIE_BASE}-{cluster}")
    }
}

/// Authorization/token endpoint pair discovered from a provider.
#[derive(Debug, Clone)]
pub struct OAuth2Endpoint {
    pub auth_url: AuthUrl,
    pub token_url: TokenUrl,
}

/// Extra token-response field carrying the ID token for OIDC providers.
/// The cluster-native OAuth variant never returns one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenField {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenField {}

/// Token response shared by both login methods.
pub type BridgeTokenResponse = StandardTokenResponse<IdTokenField, BasicTokenType>;

/// OAuth2 client with auth and token endpoints set, rebuilt fresh per call
/// so no request can mutate shared endpoint state.
pub type OAuthClient = oauth2::Client<
    StandardErrorResponse<BasicErrorResponseType>,
    BridgeTokenResponse,
    StandardTokenIntrospectionResponse<IdTokenField, BasicTokenType>,
    StandardRevocableToken,
    StandardErrorResponse<oauth2::RevocationErrorResponseType>,
    EndpointSet,    // HasAuthUrl
    EndpointNotSet, // HasDeviceAuthUrl
    EndpointNotSet, // HasIntrospectionUrl
    EndpointNotSet, // HasRevocationUrl
    EndpointSet,    // HasTokenUrl
>;

/// Ephemeral result of a successful login: created per OAuth2 callback,
/// serialized into the session cookie and the login JSON, then discarded.
#[derive(Debug)]
pub struct LoginState {
    pub raw_token: String,
    pub user_id: String,
    pub username: String,
    pub email: String,
}

impl LoginState {
    pub fn to_login_json(&self) -> LoginJson {
        LoginJson {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }
}

/// Identity payload handed to the callback continuation for the frontend.
#[derive(Debug, Clone, Serialize)]
pub struct LoginJson {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub username: String,
    pub email: String,
}

/// A user reconstructed per-request from the session cookie. Sessions are
/// stateless; nothing is stored server-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub token: String,
}

/// Provider-specific auxiliary pages surfaced to the frontend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpecialAuthUrls {
    /// Page on the integrated OAuth server for requesting a token.
    #[serde(rename = "requestTokenURL")]
    pub request_token: String,
    /// Logout URL for the special kube:admin user.
    #[serde(rename = "kubeAdminLogoutURL")]
    pub kube_admin_logout: String,
}

/// Session-cookie scoping shared by both login methods.
#[derive(Debug, Clone)]
pub struct SessionCookieConfig {
    pub path: String,
    pub secure: bool,
    pub domain: Option<String>,
    pub cluster: String,
}

impl SessionCookieConfig {
    pub(crate) fn cookie_name(&self) -> String {
        session_cookie_name(&self.cluster)
    }

    pub(crate) fn build_session_cookie(
        &self,
        value: String,
        max_age: CookieDuration,
    ) -> Cookie<'static> {
        let mut builder = Cookie::build((self.cookie_name(), value))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(max_age)
            .path(self.path.clone());
        if let Some(ref domain) = self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }

    /// Overwrites the session cookie with an empty value and zero max-age to
    /// force deletion, keeping the original scoping attributes.
    pub(crate) fn build_clear_cookie(&self) -> Cookie<'static> {
        self.build_session_cookie(String::new(), CookieDuration::ZERO)
    }
}

/// Protocol-specific strategy for turning an OAuth2 token response into a
/// session and back out again.
#[derive(Debug, Clone)]
pub enum LoginMethod {
    Oidc(Arc<OidcAuth>),
    OpenShift(Arc<OpenShiftAuth>),
}

impl LoginMethod {
    /// Turns an OAuth2 token response into a user session, adding the
    /// session cookie to the jar.
    pub fn login(
        &self,
        jar: CookieJar,
        token: &BridgeTokenResponse,
    ) -> Result<(CookieJar, LoginState), AuthError> {
        match *self {
            Self::Oidc(ref method) => method.login(jar, token),
            Self::OpenShift(ref method) => method.login(jar, token),
        }
    }

    /// Deletes the session cookie.
    pub fn logout(&self, jar: CookieJar) -> CookieJar {
        match *self {
            Self::Oidc(ref method) => method.logout(jar),
            Self::OpenShift(ref method) => method.logout(jar),
        }
    }

    /// Reconstructs the user for the current request from the session
    /// cookie.
    pub fn authenticate(&self, jar: &CookieJar) -> Result<User, AuthError> {
        match *self {
            Self::Oidc(ref method) => method.authenticate(jar),
            Self::OpenShift(ref method) => method.authenticate(jar),
        }
    }

    pub fn special_urls(&self) -> SpecialAuthUrls {
        match *self {
            Self::Oidc(_) => SpecialAuthUrls::default(),
            Self::OpenShift(ref method) => method.special_urls(),
        }
    }
}
