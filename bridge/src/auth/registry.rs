//! Per-cluster authenticator registry, built once at startup and immutable
//! afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use axum_extra::extract::cookie::CookieJar;

use super::{AuthError, Authenticator, User};

/// Cluster-name to authenticator mapping plus the static-user escape hatch
/// for deployments with user auth disabled.
pub struct AuthRuntime {
    authers: HashMap<String, Arc<Authenticator>>,
    static_user: Option<User>,
    /// Token sent upstream for every user when the cluster connection uses
    /// a shared credential instead of per-session tokens.
    service_account_token: Option<String>,
}

impl AuthRuntime {
    pub fn new(
        authers: HashMap<String, Arc<Authenticator>>,
        static_user: Option<User>,
        service_account_token: Option<String>,
    ) -> Self {
        Self {
            authers,
            static_user,
            service_account_token,
        }
    }

    /// Whether user login is enabled at all.
    pub fn enabled(&self) -> bool {
        self.static_user.is_none()
    }

    pub fn auther(&self, cluster: &str) -> Option<Arc<Authenticator>> {
        self.authers.get(cluster).cloned()
    }

    /// Resolve the user for a request. With auth disabled every request
    /// acts as the static user, independent of cookies.
    pub async fn authenticate(&self, cluster: &str, jar: &CookieJar) -> Result<User, AuthError> {
        if let Some(ref user) = self.static_user {
            return Ok(user.clone());
        }
        let auther = self.auther(cluster).ok_or_else(|| {
            AuthError::Unauthenticated(format!("no authenticator for cluster {cluster}"))
        })?;
        auther.authenticate(jar).await
    }

    /// Bearer token to attach to proxied cluster API requests for `user`.
    pub fn k8s_bearer_token<'a>(&'a self, user: &'a User) -> &'a str {
        self.service_account_token.as_deref().unwrap_or(&user.token)
    }
}
