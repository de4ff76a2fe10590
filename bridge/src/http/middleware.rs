//! Request guard for the proxied API: every request must resolve to a user,
//! and mutating requests must pass origin and CSRF checks.

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;

use crate::state::AppState;

use super::{RequestCluster, resolve_cluster};

fn is_safe(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD || method == Method::OPTIONS
}

pub(crate) async fn require_user(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let cluster = resolve_cluster(req.headers(), req.uri().path());

    // Cross-site protections only apply when browsers carry the session;
    // with auth disabled requests are not cookie-authenticated.
    if !is_safe(req.method())
        && let Some(auther) = state.auth.auther(&cluster)
    {
        if let Err(err) = auther.verify_source_origin(req.headers()) {
            tracing::warn!(cluster, error = %err, "rejecting request with untrusted origin");
            return (StatusCode::FORBIDDEN, "invalid request origin").into_response();
        }
        if let Err(err) = auther.verify_csrf_token(req.headers(), &jar) {
            tracing::warn!(cluster, error = %err, "rejecting request with bad CSRF token");
            return (StatusCode::FORBIDDEN, "invalid CSRF token").into_response();
        }
    }

    match state.auth.authenticate(&cluster, &jar).await {
        Ok(user) => {
            req.extensions_mut().insert(user);
            req.extensions_mut().insert(RequestCluster(cluster));
            next.run(req).await
        }
        Err(err) => {
            tracing::debug!(cluster, error = %err, "request not authenticated");
            (StatusCode::UNAUTHORIZED, "not authenticated").into_response()
        }
    }
}
