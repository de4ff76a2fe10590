//! Per-backend reverse-proxy configuration and the registries that
//! multiplex it across clusters and in-cluster services.
//!
//! Registries are built once at startup and read-only afterwards; an
//! unknown cluster name is a routing failure, never a fallback to the
//! local cluster.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use url::Url;

// Connection-level headers that are meaningless across the proxy hop.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Join two URL fragments with exactly one slash between them.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) if !b.is_empty() => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Reverse-proxy configuration for one named backend.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    endpoint: Url,
    header_blacklist: Vec<HeaderName>,
    client: reqwest::Client,
}

impl ProxyConfig {
    pub fn new(endpoint: Url, client: reqwest::Client) -> Self {
        Self {
            endpoint,
            // The console's own auth material must not leak to backends.
            header_blacklist: vec![header::COOKIE, HeaderName::from_static("x-csrftoken")],
            client,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn is_blocked(&self, name: &HeaderName) -> bool {
        self.header_blacklist.contains(name) || HOP_BY_HOP.contains(name)
    }

    /// Absolute backend URL for a backend-relative path, preserving the
    /// endpoint's own path prefix.
    fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let joined = single_joining_slash(self.endpoint.as_str(), path);
        match query {
            Some(query) if !query.is_empty() => format!("{joined}?{query}"),
            _ => joined,
        }
    }

    /// Forward a request to the backend, streaming both bodies. Blocked and
    /// hop-by-hop headers are stripped; `token` is injected as a bearer
    /// credential. Upstream connection failure yields 502.
    pub async fn forward(&self, path: &str, token: Option<&str>, req: Request) -> Response {
        let (parts, body) = req.into_parts();
        let target = self.target_url(path, parts.uri.query());
        tracing::debug!(method = %parts.method, target = %target, "proxying request");

        let mut builder = self.client.request(parts.method.clone(), &target);
        for (name, value) in &parts.headers {
            // reqwest derives Host and Content-Length itself.
            if self.is_blocked(name) || name == header::HOST || name == header::CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let upstream = match builder
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(error = %e, target = %target, "backend request failed");
                return (StatusCode::BAD_GATEWAY, "backend unreachable").into_response();
            }
        };

        let mut response = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if HOP_BY_HOP.contains(name) {
                continue;
            }
            response = response.header(name, value);
        }
        match response.body(Body::from_stream(upstream.bytes_stream())) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(error = %e, "failed to relay backend response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Logical names of the fixed in-cluster service backends.
pub mod service {
    pub const THANOS: &str = "thanos";
    pub const THANOS_TENANCY: &str = "thanos-tenancy";
    pub const THANOS_TENANCY_RULES: &str = "thanos-tenancy-rules";
    pub const ALERT_MANAGER: &str = "alertmanager";
    pub const ALERT_MANAGER_TENANCY: &str = "alertmanager-tenancy";
    pub const METERING: &str = "metering";
    pub const GITOPS: &str = "gitops";
    pub const CLUSTER_MANAGEMENT: &str = "cluster-management";
}

/// Backend-name to proxy-config mappings: one per cluster API server plus
/// the fixed service backends.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    k8s: HashMap<String, Arc<ProxyConfig>>,
    services: HashMap<&'static str, Arc<ProxyConfig>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_cluster(&mut self, name: impl Into<String>, config: ProxyConfig) {
        self.k8s.insert(name.into(), Arc::new(config));
    }

    pub fn insert_service(&mut self, name: &'static str, config: ProxyConfig) {
        self.services.insert(name, Arc::new(config));
    }

    /// API-server proxy for a cluster. `None` for unknown names; callers
    /// turn that into a 404.
    pub fn cluster(&self, name: &str) -> Option<Arc<ProxyConfig>> {
        self.k8s.get(name).cloned()
    }

    pub fn service(&self, name: &str) -> Option<Arc<ProxyConfig>> {
        self.services.get(name).cloned()
    }

    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.k8s.keys().map(String::as_str)
    }
}
