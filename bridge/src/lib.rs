//! Library entry for the console bridge.
//!
//! Exposes `inner_main` so the thin `bridge` binary (and integration tests)
//! can call into the server logic.
//!
//! The bridge authenticates console users against an OAuth2/OIDC identity
//! provider, proxies authenticated requests to the cluster API server and a
//! set of well-known cluster services, and serves the static frontend bundle.

pub mod auth;
pub mod cli;
pub mod client_cache;
pub mod config;
pub mod http;
pub mod proxy;
pub mod run;
pub mod state;

use std::env;
use std::fs;
use std::sync::Once;

use eyre::{Result, WrapErr as _};
use tracing::{Instrument as _, info};
use tracing_subscriber::{EnvFilter, fmt::time::ChronoLocal};

use cli::{Cli, Command, LogFormat};

static INIT_TRACING: Once = Once::new();

/// The bridge's main function; can be called from a shim binary.
///
/// Parses CLI and dispatches server startup.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the server fails to
/// start.
pub async fn inner_main(invocation: Cli) -> Result<()> {
    match invocation.command {
        Command::Serve(args) => {
            let config_path = fs::canonicalize(&args.config)
                .wrap_err(format!("Config file not found at: {}", args.config))?;

            INIT_TRACING.call_once(|| {
                let default_level = if env::var("BRIDGE_INTEGRATION_TEST").is_ok() {
                    "error"
                } else {
                    "info"
                };

                let builder = tracing_subscriber::fmt()
                    .with_env_filter(
                        EnvFilter::try_from_default_env()
                            .unwrap_or_else(|_| EnvFilter::new(default_level)),
                    )
                    .with_timer(ChronoLocal::rfc_3339());

                match args.log_format {
                    LogFormat::Compact => builder.compact().init(),
                    LogFormat::Json => builder.json().init(),
                    LogFormat::Pretty => builder.pretty().init(),
                }
            });

            let startup_span = tracing::info_span!(
                "bridge.startup",
                ?config_path,
                pid = ?std::process::id(),
                version = env!("CARGO_PKG_VERSION"),
            );
            let _startup_enter = startup_span.enter();

            info!("Starting console bridge");

            run::start(&config_path, args.listen.as_deref())
                .in_current_span()
                .await
        }
    }
}
