//! Login, callback and logout endpoints, local cluster and managed cluster
//! variants alike.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;

use crate::auth::{
    Authenticator, CallbackError, CallbackParams, LOCAL_CLUSTER, LoginJson, SpecialAuthUrls,
};
use crate::state::AppState;

use super::{AUTH_CALLBACK_ENDPOINT, AUTH_LOGIN_ENDPOINT, AUTH_LOGOUT_ENDPOINT};

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route(AUTH_LOGIN_ENDPOINT, get(login_local))
        .route("/auth/login/{cluster}", get(login_cluster))
        .route(AUTH_CALLBACK_ENDPOINT, get(callback_local))
        .route("/auth/callback/{cluster}", get(callback_cluster))
        .route(AUTH_LOGOUT_ENDPOINT, post(logout_local))
        .route("/auth/logout/{cluster}", post(logout_cluster))
        .route("/auth/info", get(auth_info))
}

fn auther_or_404(state: &AppState, cluster: &str) -> Result<Arc<Authenticator>, Response> {
    state.auth.auther(cluster).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("no login configured for cluster {cluster}"),
        )
            .into_response()
    })
}

async fn login_local(State(state): State<AppState>, jar: CookieJar) -> Response {
    login(&state, LOCAL_CLUSTER, jar).await
}

async fn login_cluster(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    jar: CookieJar,
) -> Response {
    login(&state, &cluster, jar).await
}

async fn login(state: &AppState, cluster: &str, jar: CookieJar) -> Response {
    let auther = match auther_or_404(state, cluster) {
        Ok(auther) => auther,
        Err(resp) => return resp,
    };
    // The frontend needs the CSRF cookie before it can make any mutating
    // API call after the round trip through the provider.
    let jar = auther.set_csrf_cookie(&state.settings.base_path, jar);
    let (jar, authorize_url) = auther.login_redirect(jar).await;
    (jar, Redirect::to(&authorize_url)).into_response()
}

async fn callback_local(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> Response {
    callback(&state, LOCAL_CLUSTER, params, jar).await
}

async fn callback_cluster(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> Response {
    callback(&state, &cluster, params, jar).await
}

async fn callback(
    state: &AppState,
    cluster: &str,
    params: CallbackParams,
    jar: CookieJar,
) -> Response {
    let auther = match auther_or_404(state, cluster) {
        Ok(auther) => auther,
        Err(resp) => return resp,
    };
    match auther.callback(jar, params).await {
        Ok((jar, login)) => {
            let page = login_complete_page(&login, auther.success_url());
            (jar, Html(page)).into_response()
        }
        Err(CallbackError::Benign) => Redirect::to(auther.error_url()).into_response(),
        Err(CallbackError::Auth(err)) => {
            tracing::warn!(cluster, error = %err, "login callback failed");
            Redirect::to(&auther.error_redirect_url(&err)).into_response()
        }
    }
}

/// Hand the login result to the frontend and move on. The SPA owns the
/// session presentation; the cookie set alongside carries the actual token.
fn login_complete_page(login: &LoginJson, success_url: &str) -> String {
    let login = serde_json::to_string(login)
        .unwrap_or_else(|_| "{}".to_string())
        .replace("</", "<\\/");
    format!(
        "<!DOCTYPE html>\n<html><head><script>\n\
         window.sessionStorage.setItem('login-state', JSON.stringify({login}));\n\
         window.location.replace('{success_url}');\n\
         </script></head><body>Logging in...</body></html>"
    )
}

async fn logout_local(State(state): State<AppState>, jar: CookieJar) -> Response {
    logout(&state, LOCAL_CLUSTER, jar).await
}

async fn logout_cluster(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    jar: CookieJar,
) -> Response {
    logout(&state, &cluster, jar).await
}

async fn logout(state: &AppState, cluster: &str, jar: CookieJar) -> Response {
    let auther = match auther_or_404(state, cluster) {
        Ok(auther) => auther,
        Err(resp) => return resp,
    };
    let jar = auther.logout(jar).await;
    (jar, StatusCode::NO_CONTENT).into_response()
}

#[derive(Serialize)]
struct AuthInfo {
    #[serde(flatten)]
    special_urls: SpecialAuthUrls,
    #[serde(rename = "logoutRedirect", skip_serializing_if = "Option::is_none")]
    logout_redirect: Option<String>,
}

/// Provider-specific URLs the frontend surfaces (token request page, special
/// kubeadmin logout) plus the post-logout redirect, if configured.
async fn auth_info(State(state): State<AppState>, headers: axum::http::HeaderMap) -> Response {
    let cluster = super::resolve_cluster(&headers, "/auth/info");
    let auther = match auther_or_404(&state, &cluster) {
        Ok(auther) => auther,
        Err(resp) => return resp,
    };
    axum::Json(AuthInfo {
        special_urls: auther.special_urls().await,
        logout_redirect: state.settings.logout_redirect.clone(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_page_embeds_the_login_json() {
        let login = LoginJson {
            user_id: "user-1".to_string(),
            username: "jane".to_string(),
            email: "jane@example.com".to_string(),
        };
        let page = login_complete_page(&login, "https://console.example.com/");
        assert!(page.contains(r#""userID":"user-1""#));
        assert!(page.contains("window.location.replace('https://console.example.com/')"));
    }

    #[test]
    fn login_page_defuses_script_breakouts() {
        let login = LoginJson {
            user_id: "user-1".to_string(),
            username: "</script><script>alert(1)".to_string(),
            email: String::new(),
        };
        let page = login_complete_page(&login, "/");
        assert!(!page.contains("</script><script>alert(1)"));
    }
}
