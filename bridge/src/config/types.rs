//! Configuration data types for the console bridge.
//!
//! The shapes here mirror the TOML config file: a `[server]` section for the
//! HTTP surface, `[auth]` for user login, `[cluster]` for the local cluster
//! connection, and zero or more `[[managed_clusters]]` entries for remote
//! clusters the console proxies to.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;

/// Well-known in-cluster service account material.
pub const IN_CLUSTER_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
pub const IN_CLUSTER_BEARER_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Root configuration structure.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub managed_clusters: Vec<ManagedClusterConfig>,
}

/// HTTP server binding and frontend configuration.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    /// Listen URL, `http://host:port` or `https://host:port`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// External base address, `<http|https>://domainOrIP[:port]`.
    pub base_address: String,
    /// Base path the console is served under. Must start and end with `/`.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Directory containing the static frontend bundle.
    #[serde(default = "default_public_dir")]
    pub public_dir: String,
    /// Optional extra port answering with a permanent redirect to the base
    /// address, for custom-hostname setups.
    #[serde(default)]
    pub redirect_port: Option<u16>,
    /// TLS material for HTTPS listeners.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            base_address: String::new(),
            base_path: default_base_path(),
            public_dir: default_public_dir(),
            redirect_port: None,
            tls: None,
        }
    }
}

/// TLS configuration for the HTTPS listener.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TlsConfig {
    /// Path to the certificate PEM file (server cert, optionally followed by
    /// the CA chain).
    pub cert_path: String,
    /// Path to the private key PEM file.
    pub key_path: String,
}

/// How console users log in.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserAuthMode {
    /// No login; every request acts as the static user.
    #[default]
    Disabled,
    /// Generic OIDC provider with standard discovery.
    Oidc,
    /// Cluster-native OAuth with metadata discovery.
    Openshift,
}

/// User authentication configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub method: UserAuthMode,
    /// The OIDC/OAuth2 issuer URL. Forbidden for `openshift` (the cluster
    /// endpoint is the issuer there).
    #[serde(default)]
    pub issuer_url: Option<String>,
    /// PEM file for the issuer.
    #[serde(default)]
    pub issuer_ca: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<Arc<SecretString>>,
    /// File containing the client secret; mutually exclusive with
    /// `client_secret`.
    #[serde(default)]
    pub client_secret_file: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Optional redirect URL on logout, needed for some SSO providers.
    #[serde(default)]
    pub logout_redirect: Option<String>,
    /// Domain attribute for cookies. A leading dot makes the cookie valid
    /// for all subdomains.
    #[serde(default)]
    pub cookie_domain: Option<String>,
    /// Seconds of inactivity after which a user is logged out. Ignored below
    /// 300 seconds.
    #[serde(default)]
    pub inactivity_timeout: Option<u64>,
}

impl PartialEq for AuthConfig {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
            && self.issuer_url == other.issuer_url
            && self.issuer_ca == other.issuer_ca
            && self.client_id == other.client_id
            && secret_eq(self.client_secret.as_ref(), other.client_secret.as_ref())
            && self.client_secret_file == other.client_secret_file
            && self.scopes == other.scopes
            && self.logout_redirect == other.logout_redirect
            && self.cookie_domain == other.cookie_domain
            && self.inactivity_timeout == other.inactivity_timeout
    }
}

fn secret_eq(a: Option<&Arc<SecretString>>, b: Option<&Arc<SecretString>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.expose_secret() == b.expose_secret(),
        (None, None) => true,
        _ => false,
    }
}

/// Where the cluster API server lives relative to the bridge.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum K8sMode {
    /// Running inside the cluster; service account material is picked up
    /// from the well-known paths.
    #[default]
    InCluster,
    /// Running outside the cluster against an explicit endpoint.
    OffCluster,
}

/// How proxied cluster API requests are authenticated.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum K8sAuthMode {
    /// The in-cluster service account token is sent for every user.
    #[default]
    ServiceAccount,
    /// A fixed bearer token is sent for every user.
    BearerToken,
    /// The session token of the logged-in user is sent.
    Oidc,
    /// Like `oidc`, for the cluster-native OAuth variant.
    Openshift,
}

/// Local cluster connection configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClusterConfig {
    #[serde(default)]
    pub mode: K8sMode,
    /// URL of the Kubernetes API server (off-cluster only).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// DEV ONLY. Skip verification of certs presented by the API server
    /// (off-cluster only).
    #[serde(default)]
    pub skip_verify_tls: bool,
    #[serde(default)]
    pub auth: K8sAuthMode,
    /// Bearer token for `auth = "bearer-token"`.
    #[serde(default)]
    pub bearer_token: Option<Arc<SecretString>>,
    /// CA bundle for cluster services signed with the service signing
    /// certificates. Enables the monitoring/metering/gitops proxies when
    /// in-cluster.
    #[serde(default)]
    pub service_ca_file: Option<String>,
    /// Namespace of the prometheus monitoring stack.
    #[serde(default = "default_monitoring_namespace")]
    pub monitoring_namespace: String,
    /// DEV ONLY. Off-cluster service endpoints.
    #[serde(default)]
    pub off_cluster: OffClusterEndpoints,
}

impl PartialEq for ClusterConfig {
    fn eq(&self, other: &Self) -> bool {
        self.mode == other.mode
            && self.endpoint == other.endpoint
            && self.skip_verify_tls == other.skip_verify_tls
            && self.auth == other.auth
            && secret_eq(self.bearer_token.as_ref(), other.bearer_token.as_ref())
            && self.service_ca_file == other.service_ca_file
            && self.monitoring_namespace == other.monitoring_namespace
            && self.off_cluster == other.off_cluster
    }
}

/// Service endpoints used instead of the in-cluster well-known hosts when
/// running off-cluster.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct OffClusterEndpoints {
    #[serde(default)]
    pub thanos: Option<String>,
    #[serde(default)]
    pub alertmanager: Option<String>,
    #[serde(default)]
    pub metering: Option<String>,
    #[serde(default)]
    pub gitops: Option<String>,
}

/// One managed (remote) cluster the console proxies to, with independent
/// credentials and trust.
#[derive(Debug, Deserialize, Clone)]
pub struct ManagedClusterConfig {
    pub name: String,
    pub api_server: ManagedClusterAPIServer,
    pub oauth: ManagedClusterOAuth,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ManagedClusterAPIServer {
    pub url: String,
    pub ca_file: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ManagedClusterOAuth {
    pub client_id: String,
    pub client_secret: Arc<SecretString>,
    #[serde(default)]
    pub ca_file: Option<String>,
}

impl PartialEq for ManagedClusterConfig {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.api_server == other.api_server
            && self.oauth.client_id == other.oauth.client_id
            && self.oauth.client_secret.expose_secret() == other.oauth.client_secret.expose_secret()
            && self.oauth.ca_file == other.oauth.ca_file
    }
}

fn default_listen() -> String {
    "http://0.0.0.0:9000".to_string()
}

fn default_base_path() -> String {
    "/".to_string()
}

fn default_public_dir() -> String {
    "./frontend/public/dist".to_string()
}

fn default_monitoring_namespace() -> String {
    "openshift-monitoring".to_string()
}

/// Resolves a path relative to the config file's directory, normalizing
/// redundant components. Absolute paths are returned as-is.
pub fn resolve_config_relative_paths(config_path: &Path, relative_path: &str) -> PathBuf {
    let path = Path::new(relative_path);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_path
            .parent()
            .map_or_else(|| path.to_path_buf(), |d| d.join(path))
    };

    normalize_path(&resolved)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        use Component as C;
        match component {
            C::Normal(c) => {
                result.push(c);
            }
            C::ParentDir => {
                result.pop();
            }
            C::CurDir => {}
            C::RootDir | C::Prefix(_) => {
                result.push(component);
            }
        }
    }
    result
}
