//! HTTP surface of the bridge: login endpoints, authenticated API proxies
//! and static frontend serving.

pub mod api;
pub mod login;
pub mod middleware;
pub mod router;
pub mod tls;

use axum::http::HeaderMap;

use crate::auth::LOCAL_CLUSTER;

pub const AUTH_LOGIN_ENDPOINT: &str = "/auth/login";
pub const AUTH_CALLBACK_ENDPOINT: &str = "/auth/callback";
pub const AUTH_LOGOUT_ENDPOINT: &str = "/auth/logout";
/// Frontend page users land on after a failed login, relative to the base.
pub const AUTH_ERROR_ENDPOINT: &str = "/error";
/// Frontend page users land on after a successful login, relative to the base.
pub const AUTH_SUCCESS_ENDPOINT: &str = "/";

/// Header the frontend sets to address a specific cluster.
pub const CLUSTER_HEADER: &str = "X-Cluster";

/// Route prefix addressing a cluster by path segment instead of the header.
const CLUSTER_PATH_PREFIX: &str = "/api/proxy/cluster/";

/// Cluster resolved for a request by the auth guard, stashed in the request
/// extensions so proxy handlers address the same cluster the session was
/// checked against.
#[derive(Debug, Clone)]
pub(crate) struct RequestCluster(pub String);

/// Cluster a request addresses: the `X-Cluster` header when present, else
/// the `/api/proxy/cluster/{name}/` path segment, else the local cluster.
/// An unknown name is a routing failure for the caller to surface, never a
/// silent local fallback.
pub(crate) fn resolve_cluster(headers: &HeaderMap, path: &str) -> String {
    headers
        .get(CLUSTER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .or_else(|| cluster_path_segment(path))
        .unwrap_or(LOCAL_CLUSTER)
        .to_string()
}

fn cluster_path_segment(path: &str) -> Option<&str> {
    path.strip_prefix(CLUSTER_PATH_PREFIX)?
        .split('/')
        .next()
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn cluster_header_overrides_the_local_default() {
        let mut headers = HeaderMap::new();
        assert_eq!(resolve_cluster(&headers, "/api/kubernetes/api"), LOCAL_CLUSTER);

        headers.insert(CLUSTER_HEADER, HeaderValue::from_static("east-1"));
        assert_eq!(resolve_cluster(&headers, "/api/kubernetes/api"), "east-1");

        headers.insert(CLUSTER_HEADER, HeaderValue::from_static(""));
        assert_eq!(resolve_cluster(&headers, "/api/kubernetes/api"), LOCAL_CLUSTER);
    }

    #[test]
    fn path_segment_addresses_a_cluster_without_the_header() {
        let headers = HeaderMap::new();
        assert_eq!(
            resolve_cluster(&headers, "/api/proxy/cluster/east-1/api/v1/pods"),
            "east-1"
        );
        assert_eq!(
            resolve_cluster(&headers, "/api/proxy/cluster//api/v1/pods"),
            LOCAL_CLUSTER
        );
    }

    #[test]
    fn cluster_header_wins_over_the_path_segment() {
        let mut headers = HeaderMap::new();
        headers.insert(CLUSTER_HEADER, HeaderValue::from_static("west-2"));
        assert_eq!(
            resolve_cluster(&headers, "/api/proxy/cluster/east-1/api/v1/pods"),
            "west-2"
        );
    }
}
