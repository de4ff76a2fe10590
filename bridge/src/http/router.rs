use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::Request,
    http::header::{AUTHORIZATION, COOKIE},
    middleware as ax_middleware,
    response::Redirect,
    routing::any,
};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt as _,
    request_id::MakeRequestUuid,
    services::{ServeDir, ServeFile},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::state::AppState;

use super::{api, login, middleware};

/// Login endpoints are public; everything under `/api` requires a resolved
/// user plus origin and CSRF checks on mutating requests.
pub(crate) fn create_app_router(state: &AppState) -> Router<AppState> {
    let public = login::routes().route_layer(TimeoutLayer::new(Duration::from_secs(30)));

    let private = Router::new()
        .nest("/api", api::routes())
        .route_layer(ax_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_user,
        ));

    public.merge(private)
}

pub fn create_app(state: AppState) -> Router {
    let middleware_stack = ServiceBuilder::new()
        .sensitive_headers([AUTHORIZATION, COOKIE])
        .set_x_request_id(MakeRequestUuid)
        .propagate_x_request_id()
        .layer(TraceLayer::new_for_http());

    // Unmatched paths fall through to the SPA; client-side routes resolve
    // to index.html.
    let assets = ServeDir::new(&state.settings.public_dir)
        .fallback(ServeFile::new(state.settings.public_dir.join("index.html")));

    let app = create_app_router(&state)
        .fallback_service(assets)
        .with_state(state.clone());

    let app = if state.settings.base_path == "/" {
        app
    } else {
        let prefix = state.settings.base_path.trim_end_matches('/').to_string();
        let base_path = state.settings.base_path.clone();
        Router::new()
            .nest(&prefix, app)
            .fallback(any(move |_req: Request<Body>| {
                let base_path = base_path.clone();
                async move { Redirect::permanent(&base_path) }
            }))
    };

    app.layer(middleware_stack)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Arc;

    use axum::Json;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::{get, head};
    use secrecy::SecretString;
    use serde_json::json;
    use tower::ServiceExt as _;
    use url::Url;

    use crate::auth::{
        AuthRuntime, Authenticator, Config, LOCAL_CLUSTER, SessionCookieConfig, SourceKind, User,
    };
    use crate::client_cache::ClientCache;
    use crate::proxy::ProxyRegistry;
    use crate::state::{AppState, ServerSettings};

    use super::*;

    fn test_settings(base_path: &str) -> Arc<ServerSettings> {
        Arc::new(ServerSettings {
            base_url: Url::parse("http://localhost:9000/").expect("static URL"),
            base_path: base_path.to_string(),
            public_dir: PathBuf::from("./frontend-does-not-exist"),
            logout_redirect: None,
            secure_cookies: false,
            cookie_path: "/api/".to_string(),
        })
    }

    fn disabled_auth_state(base_path: &str) -> AppState {
        AppState {
            auth: Arc::new(AuthRuntime::new(
                HashMap::new(),
                Some(User {
                    id: String::new(),
                    username: String::new(),
                    token: "abc123".to_string(),
                }),
                Some("abc123".to_string()),
            )),
            proxies: Arc::new(ProxyRegistry::new()),
            clients: Arc::new(ClientCache::new().expect("default client builds")),
            settings: test_settings(base_path),
        }
    }

    async fn serve_oauth_metadata() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));

        let issuer = base.clone();
        let app = axum::Router::new()
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

    /// State with login enabled for the local cluster only.
    async fn enabled_auth_state() -> AppState {
        let base = serve_oauth_metadata().await;
        let clients = Arc::new(ClientCache::new().expect("default client builds"));
        let auther = Authenticator::with_backoff(
            Config {
                source: SourceKind::OpenShift,
                issuer_url: base.clone(),
                issuer_ca: None,
                k8s_ca: None,
                client_id: "console".to_string(),
                client_secret: Arc::new(SecretString::from("hunter2")),
                scopes: vec!["user:full".to_string()],
                redirect_url: format!("{base}/auth/callback"),
                error_url: "/error".to_string(),
                success_url: "/".to_string(),
                referer_url: format!("{base}/"),
                cookie: SessionCookieConfig {
                    path: "/api/".to_string(),
                    secure: false,
                    domain: None,
                    cluster: LOCAL_CLUSTER.to_string(),
                },
            },
            clients.clone(),
            Duration::from_millis(1),
            1,
        )
        .await
        .expect("authenticator construction");

        let mut authers = HashMap::new();
        authers.insert(LOCAL_CLUSTER.to_string(), Arc::new(auther));
        AppState {
            auth: Arc::new(AuthRuntime::new(authers, None, None)),
            proxies: Arc::new(ProxyRegistry::new()),
            clients,
            settings: test_settings("/"),
        }
    }

    #[tokio::test]
    async fn requests_for_unknown_clusters_are_a_routing_failure() {
        let app = create_app(disabled_auth_state("/"));
        let response = app
            .oneshot(
                Request::get("/api/kubernetes/api/v1/pods")
                    .header("X-Cluster", "east-1")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn path_addressed_clusters_need_their_own_session() {
        let app = create_app(enabled_auth_state().await);

        // A local session must not satisfy the guard for a managed
        // cluster named in the request path.
        let response = app
            .clone()
            .oneshot(
                Request::get("/api/proxy/cluster/east-1/api/v1/pods")
                    .header("cookie", "console-session-token=local-session-token")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // The same session passes the guard for the local cluster and
        // fails later at routing instead.
        let response = app
            .oneshot(
                Request::get("/api/kubernetes/api/v1/pods")
                    .header("cookie", "console-session-token=local-session-token")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn login_routes_answer_404_when_no_auth_is_configured() {
        let app = create_app(disabled_auth_state("/"));
        let response = app
            .oneshot(
                Request::get("/auth/login")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unconfigured_service_backends_answer_404() {
        let app = create_app(disabled_auth_state("/"));
        let response = app
            .oneshot(
                Request::get("/api/prometheus/api/v1/query")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn requests_outside_the_base_path_redirect_into_it() {
        let app = create_app(disabled_auth_state("/console/"));
        let response = app
            .oneshot(
                Request::get("/somewhere-else")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            response
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok()),
            Some("/console/")
        );
    }
}
