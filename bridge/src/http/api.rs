//! Authenticated reverse-proxy routes: the per-cluster Kubernetes API plus
//! the named service backends.

use axum::{
    Extension, Router,
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
};

use crate::auth::User;
use crate::proxy::service;
use crate::state::AppState;

use super::RequestCluster;

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/kubernetes/{*path}", any(k8s_proxy))
        .route("/proxy/cluster/{cluster}/{*path}", any(cluster_proxy))
        .route("/prometheus/{*path}", any(thanos_proxy))
        .route("/prometheus-tenancy/{*path}", any(thanos_tenancy_proxy))
        .route("/alertmanager/{*path}", any(alertmanager_proxy))
        .route("/alertmanager-tenancy/{*path}", any(alertmanager_tenancy_proxy))
        .route("/metering/{*path}", any(metering_proxy))
        .route("/gitops/{*path}", any(gitops_proxy))
        .route("/accounts_mgmt/{*path}", any(accounts_mgmt_proxy))
}

async fn k8s_proxy(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Extension(user): Extension<User>,
    Extension(RequestCluster(cluster)): Extension<RequestCluster>,
    req: Request<Body>,
) -> Response {
    forward_to_cluster(&state, &cluster, &path, &user, req).await
}

/// Cluster addressed by path segment instead of the `X-Cluster` header. The
/// auth guard resolved the same segment, so the session checked and the
/// cluster forwarded to always agree.
async fn cluster_proxy(
    State(state): State<AppState>,
    Path((_, path)): Path<(String, String)>,
    Extension(user): Extension<User>,
    Extension(RequestCluster(cluster)): Extension<RequestCluster>,
    req: Request<Body>,
) -> Response {
    forward_to_cluster(&state, &cluster, &path, &user, req).await
}

async fn forward_to_cluster(
    state: &AppState,
    cluster: &str,
    path: &str,
    user: &User,
    req: Request<Body>,
) -> Response {
    let Some(proxy) = state.proxies.cluster(cluster) else {
        tracing::warn!(cluster, "request for unknown cluster");
        return (StatusCode::NOT_FOUND, format!("unknown cluster {cluster}")).into_response();
    };
    let token = state.auth.k8s_bearer_token(user);
    proxy.forward(path, Some(token), req).await
}

async fn forward_to_service(
    state: &AppState,
    name: &str,
    path: &str,
    token: Option<&str>,
    req: Request<Body>,
) -> Response {
    let Some(proxy) = state.proxies.service(name) else {
        return (StatusCode::NOT_FOUND, format!("{name} is not configured")).into_response();
    };
    proxy.forward(path, token, req).await
}

macro_rules! service_proxy {
    ($handler:ident, $service:expr) => {
        async fn $handler(
            State(state): State<AppState>,
            Path(path): Path<String>,
            Extension(user): Extension<User>,
            req: Request<Body>,
        ) -> Response {
            let token = state.auth.k8s_bearer_token(&user).to_string();
            forward_to_service(&state, $service, &path, Some(&token), req).await
        }
    };
}

service_proxy!(thanos_proxy, service::THANOS);
service_proxy!(alertmanager_proxy, service::ALERT_MANAGER);
service_proxy!(alertmanager_tenancy_proxy, service::ALERT_MANAGER_TENANCY);
service_proxy!(metering_proxy, service::METERING);
service_proxy!(gitops_proxy, service::GITOPS);

/// Rule queries ride the tenancy path but are answered by a dedicated
/// rules-scoped backend.
async fn thanos_tenancy_proxy(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Extension(user): Extension<User>,
    req: Request<Body>,
) -> Response {
    let name = if path.trim_end_matches('/') == "api/v1/rules" {
        service::THANOS_TENANCY_RULES
    } else {
        service::THANOS_TENANCY
    };
    let token = state.auth.k8s_bearer_token(&user).to_string();
    forward_to_service(&state, name, &path, Some(&token), req).await
}

/// The cluster management API authenticates with its own credentials; the
/// caller's `Authorization` header passes through untouched.
async fn accounts_mgmt_proxy(
    State(state): State<AppState>,
    Path(path): Path<String>,
    req: Request<Body>,
) -> Response {
    forward_to_service(&state, service::CLUSTER_MANAGEMENT, &path, None, req).await
}
