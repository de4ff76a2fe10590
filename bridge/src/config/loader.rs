//! Loading and validation of the bridge configuration file.
//!
//! Misconfiguration that cannot self-heal (malformed URLs, conflicting
//! settings, unreadable secret files) is rejected here, before the server
//! ever binds.

use std::fs;
use std::path::Path;

use eyre::{Result, WrapErr as _, bail, eyre};
use tracing::warn;
use url::Url;

use super::types::{BridgeConfig, K8sAuthMode, K8sMode, ManagedClusterConfig, UserAuthMode};

/// Load and validate the configuration from a TOML file.
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed, or when the
/// configuration fails validation.
pub fn load(config_path: &Path) -> Result<BridgeConfig> {
    let raw = fs::read_to_string(config_path)
        .wrap_err_with(|| format!("failed to read config file {}", config_path.display()))?;
    let config: BridgeConfig = toml::from_str(&raw)
        .wrap_err_with(|| format!("failed to parse config file {}", config_path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &BridgeConfig) -> Result<()> {
    let listen = parse_absolute_url("server.listen", &config.server.listen)?;
    match listen.scheme() {
        "http" => {}
        "https" => {
            if config.server.tls.is_none() {
                bail!("server.listen uses https but [server.tls] is not configured");
            }
        }
        other => bail!("server.listen scheme must be http or https, got {other}"),
    }

    if !config.server.base_path.starts_with('/') || !config.server.base_path.ends_with('/') {
        bail!("server.base_path must start and end with slash");
    }

    validate_user_auth(config)?;
    validate_k8s(config)?;

    if let Some(timeout) = config.auth.inactivity_timeout {
        if timeout < 300 {
            warn!("auth.inactivity_timeout is set to less than 300 seconds and will be ignored");
        } else if !matches!(
            config.cluster.auth,
            K8sAuthMode::Oidc | K8sAuthMode::Openshift
        ) {
            bail!("auth.inactivity_timeout requires cluster.auth to be one of: oidc, openshift");
        }
    }

    Ok(())
}

fn validate_user_auth(config: &BridgeConfig) -> Result<()> {
    let auth = &config.auth;
    match auth.method {
        UserAuthMode::Disabled => Ok(()),
        UserAuthMode::Oidc | UserAuthMode::Openshift => {
            if config.server.base_address.is_empty() {
                bail!("server.base_address is required when user auth is enabled");
            }
            parse_absolute_url("server.base_address", &config.server.base_address)?;

            if auth.client_id.as_deref().unwrap_or_default().is_empty() {
                bail!("auth.client_id is required when user auth is enabled");
            }
            match (&auth.client_secret, &auth.client_secret_file) {
                (None, None) => {
                    bail!("must provide either auth.client_secret or auth.client_secret_file")
                }
                (Some(_), Some(_)) => {
                    bail!("cannot provide both auth.client_secret and auth.client_secret_file")
                }
                _ => {}
            }

            match auth.method {
                UserAuthMode::Openshift => {
                    if auth.issuer_url.is_some() {
                        bail!("auth.issuer_url cannot be used with auth.method = \"openshift\"");
                    }
                }
                _ => {
                    let issuer = auth
                        .issuer_url
                        .as_deref()
                        .ok_or_else(|| eyre!("auth.issuer_url is required for oidc auth"))?;
                    parse_absolute_url("auth.issuer_url", issuer)?;
                }
            }
            Ok(())
        }
    }
}

fn validate_k8s(config: &BridgeConfig) -> Result<()> {
    match config.cluster.mode {
        K8sMode::InCluster => {}
        K8sMode::OffCluster => {
            let endpoint = config
                .cluster
                .endpoint
                .as_deref()
                .ok_or_else(|| eyre!("cluster.endpoint is required for off-cluster mode"))?;
            parse_absolute_url("cluster.endpoint", endpoint)?;
        }
    }

    match config.cluster.auth {
        K8sAuthMode::ServiceAccount => {
            if config.cluster.mode != K8sMode::InCluster {
                bail!("cluster.auth = \"service-account\" requires cluster.mode = \"in-cluster\"");
            }
        }
        K8sAuthMode::BearerToken => {
            if config.cluster.bearer_token.is_none() {
                bail!("cluster.bearer_token is required for cluster.auth = \"bearer-token\"");
            }
        }
        K8sAuthMode::Oidc | K8sAuthMode::Openshift => {
            if config.auth.method == UserAuthMode::Disabled {
                bail!("cluster.auth = \"oidc\"/\"openshift\" requires auth.method to match");
            }
        }
    }

    Ok(())
}

/// Validate a single managed cluster entry. Invalid entries are skipped (with
/// an error log) rather than failing startup, so one broken remote cluster
/// does not take the console down for all others.
pub(crate) fn validate_managed_cluster(cluster: &ManagedClusterConfig) -> Result<()> {
    if cluster.name.is_empty() {
        bail!("managed cluster name must not be empty");
    }
    parse_absolute_url("api_server.url", &cluster.api_server.url)?;
    if cluster.api_server.ca_file.is_empty() {
        bail!("managed cluster {} has no API server CA file", cluster.name);
    }
    if cluster.oauth.client_id.is_empty() {
        bail!("managed cluster {} has no OAuth client ID", cluster.name);
    }
    Ok(())
}

fn parse_absolute_url(flag: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value).wrap_err_with(|| format!("{flag} is not a valid URL: {value}"))?;
    if url.scheme().is_empty() || !url.has_host() {
        bail!("{flag} is not an absolute URL: {value}");
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp config");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn minimal_off_cluster_config_loads() {
        let file = write_config(
            r#"
            [server]
            base_address = "http://localhost:9000"

            [cluster]
            mode = "off-cluster"
            endpoint = "https://k8s.example.com:6443"
            auth = "bearer-token"
            bearer_token = "abc123"
            "#,
        );
        let config = load(file.path()).expect("config should load");
        assert_eq!(config.cluster.mode, K8sMode::OffCluster);
        assert_eq!(config.cluster.auth, K8sAuthMode::BearerToken);
    }

    #[test]
    fn base_path_must_be_slash_delimited() {
        let file = write_config(
            r#"
            [server]
            base_address = "http://localhost:9000"
            base_path = "/console"

            [cluster]
            mode = "off-cluster"
            endpoint = "https://k8s.example.com:6443"
            auth = "bearer-token"
            bearer_token = "abc123"
            "#,
        );
        let err = load(file.path()).expect_err("trailing slash is required");
        assert!(err.to_string().contains("base_path"));
    }

    #[test]
    fn oidc_requires_client_secret() {
        let file = write_config(
            r#"
            [server]
            base_address = "https://console.example.com"

            [auth]
            method = "oidc"
            issuer_url = "https://issuer.example.com"
            client_id = "console"

            [cluster]
            mode = "off-cluster"
            endpoint = "https://k8s.example.com:6443"
            auth = "oidc"
            "#,
        );
        let err = load(file.path()).expect_err("client secret is required");
        assert!(err.to_string().contains("client_secret"));
    }

    #[test]
    fn openshift_forbids_issuer_url() {
        let file = write_config(
            r#"
            [server]
            base_address = "https://console.example.com"

            [auth]
            method = "openshift"
            issuer_url = "https://issuer.example.com"
            client_id = "console"
            client_secret = "hunter2"

            [cluster]
            mode = "off-cluster"
            endpoint = "https://k8s.example.com:6443"
            auth = "openshift"
            "#,
        );
        let err = load(file.path()).expect_err("issuer_url conflicts with openshift mode");
        assert!(err.to_string().contains("issuer_url"));
    }

    #[test]
    fn service_account_auth_requires_in_cluster() {
        let file = write_config(
            r#"
            [server]
            base_address = "http://localhost:9000"

            [cluster]
            mode = "off-cluster"
            endpoint = "https://k8s.example.com:6443"
            auth = "service-account"
            "#,
        );
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn managed_cluster_validation_rejects_relative_url() {
        let cluster: ManagedClusterConfig = toml::from_str(
            r#"
            name = "east-1"
            [api_server]
            url = "not-a-url"
            ca_file = "/etc/ca.crt"
            [oauth]
            client_id = "console"
            client_secret = "hunter2"
            "#,
        )
        .expect("parses");
        assert!(validate_managed_cluster(&cluster).is_err());
    }
}
