//! Server startup: configuration loading, state construction and the
//! listener loop.

use std::net::SocketAddr;
use std::path::Path;

use eyre::{Result, WrapErr as _, eyre};
use tokio::{net, signal};
use url::Url;

use crate::http::{router, tls};
use crate::{config, state};

/// Creates a future that resolves when a shutdown signal is received.
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to create SIGTERM signal handler");
        let _ = sigterm.recv().await;
    }
    #[cfg(not(unix))]
    {
        drop(signal::ctrl_c().await);
    }
}

fn listen_addr(listen: &Url) -> Result<SocketAddr> {
    let host = listen
        .host_str()
        .ok_or_else(|| eyre!("listen URL has no host"))?;
    let port = listen
        .port_or_known_default()
        .ok_or_else(|| eyre!("listen URL has no port"))?;
    let ip: std::net::IpAddr = host
        .parse()
        .wrap_err("listen host must be an IP address")?;
    Ok(SocketAddr::from((ip, port)))
}

/// Plain HTTP listener that sends every request to the canonical base URL.
/// Covers deployments reachable under a legacy hostname or bare port.
async fn spawn_redirect_listener(ip: std::net::IpAddr, port: u16, base: Url) -> Result<()> {
    let redirect_addr = SocketAddr::from((ip, port));
    let app = axum::Router::new().fallback(axum::routing::any(
        move |_req: axum::extract::Request| {
            let base = base.clone();
            async move { axum::response::Redirect::permanent(base.as_str()) }
        },
    ));
    let listener = net::TcpListener::bind(redirect_addr)
        .await
        .wrap_err("failed to bind redirect listener")?;
    tracing::info!("Redirecting http://{} to the base URL", redirect_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "redirect listener failed");
        }
    });
    Ok(())
}

/// Load configuration, build the application state (blocking on identity
/// provider discovery) and serve until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, state
/// construction fails, TLS setup fails, or a listener cannot bind.
pub async fn start(config_path: &Path, listen_override: Option<&str>) -> Result<()> {
    let config = config::load(config_path)?;
    let app_state = state::initialize_state(config_path, &config).await?;

    let listen_str = listen_override.unwrap_or(&config.server.listen);
    let listen = Url::parse(listen_str).wrap_err("invalid listen URL")?;
    let addr = listen_addr(&listen)?;

    if let Some(port) = config.server.redirect_port {
        spawn_redirect_listener(addr.ip(), port, app_state.settings.base_url.clone()).await?;
    }

    let app = router::create_app(app_state);

    if listen.scheme() == "https" {
        let tls_cfg = config
            .server
            .tls
            .as_ref()
            .ok_or_else(|| eyre!("an https listen URL requires [server.tls]"))?;
        let rustls_cfg = tls::setup_tls_config(tls_cfg, config_path).await?;
        tracing::info!("Listening on https://{}", addr);
        let server = axum_server::bind_rustls(addr, rustls_cfg).serve(app.into_make_service());
        tokio::select! {
            res = server => res?,
            () = shutdown_signal() => {
                tracing::info!("Received shutdown, shutting down");
            }
        }
    } else {
        tracing::info!("Listening on http://{}", addr);
        let listener = net::TcpListener::bind(addr).await?;
        let server = axum::serve(listener, app);
        tokio::select! {
            res = server => res?,
            () = shutdown_signal() => {
                tracing::info!("Received shutdown, shutting down");
            }
        }
    }

    Ok(())
}
