use std::path::Path;

use axum_server::tls_rustls::RustlsConfig as AxumRustlsConfig;
use eyre::WrapErr as _;

use crate::config::{TlsConfig, resolve_config_relative_paths};

/// Load the serving certificate and key for HTTPS listeners.
pub(crate) async fn setup_tls_config(
    tls_cfg: &TlsConfig,
    config_path: &Path,
) -> eyre::Result<AxumRustlsConfig> {
    let cert_path = resolve_config_relative_paths(config_path, &tls_cfg.cert_path);
    let key_path = resolve_config_relative_paths(config_path, &tls_cfg.key_path);

    AxumRustlsConfig::from_pem_file(&cert_path, &key_path)
        .await
        .wrap_err(format!(
            "Failed to load TLS certificates from cert: {}, key: {}",
            cert_path.display(),
            key_path.display()
        ))
}
