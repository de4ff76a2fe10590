//! Shared application state, assembled once at startup from the validated
//! configuration: the authenticator registry, the proxy registries and the
//! server settings the HTTP layer needs.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr as _, bail, eyre};
use secrecy::{ExposeSecret as _, SecretString};
use tracing::{error, info, warn};
use url::Url;

use crate::auth::{
    self, AuthRuntime, Authenticator, LOCAL_CLUSTER, SessionCookieConfig, SourceKind, User,
};
use crate::client_cache::ClientCache;
use crate::config::{
    BridgeConfig, IN_CLUSTER_BEARER_TOKEN, IN_CLUSTER_CA, K8sAuthMode, K8sMode,
    ManagedClusterConfig, UserAuthMode, resolve_config_relative_paths, validate_managed_cluster,
};
use crate::http::{AUTH_CALLBACK_ENDPOINT, AUTH_ERROR_ENDPOINT, AUTH_SUCCESS_ENDPOINT};
use crate::proxy::{ProxyConfig, ProxyRegistry, service, single_joining_slash};

const IN_CLUSTER_K8S_ENDPOINT: &str = "https://kubernetes.default.svc";
const METERING_HOST: &str = "reporting-operator.openshift-metering.svc:8080";
const GITOPS_HOST: &str = "cluster.openshift-gitops.svc:8080";
const CLUSTER_MANAGEMENT_URL: &str = "https://api.openshift.com/";

/// Server-level settings the HTTP layer reads per request.
pub struct ServerSettings {
    pub base_url: Url,
    pub base_path: String,
    pub public_dir: PathBuf,
    pub logout_redirect: Option<String>,
    pub secure_cookies: bool,
    /// Session cookies are scoped to `<base_path>api/` so browsers only
    /// send the token for proxied API calls.
    pub cookie_path: String,
}

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthRuntime>,
    pub proxies: Arc<ProxyRegistry>,
    pub clients: Arc<ClientCache>,
    pub settings: Arc<ServerSettings>,
}

// Proxy clients are long-lived and must not impose a request timeout; watch
// requests on the cluster API stay open indefinitely.
fn proxy_client(ca_file: Option<&Path>, skip_verify: bool) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().tls_version_min(reqwest::tls::Version::TLS_1_2);
    if skip_verify {
        builder = builder.tls_danger_accept_invalid_certs(true);
    }
    if let Some(ca_file) = ca_file {
        let data = fs::read(ca_file)
            .wrap_err_with(|| format!("failed to read CA file {}", ca_file.display()))?;
        let certs = reqwest::Certificate::from_pem_bundle(&data)
            .map_err(|e| eyre!("unable to parse CA file {}: {e}", ca_file.display()))?;
        if certs.is_empty() {
            bail!("no CA found in {}", ca_file.display());
        }
        builder = builder.tls_certs_only(certs);
    }
    builder.build().wrap_err("failed to build proxy client")
}

struct LocalCluster {
    endpoint: Url,
    /// CA for OAuth metadata discovery against the API server.
    ca_file: Option<PathBuf>,
    service_account_token: Option<String>,
}

fn setup_local_cluster(
    config: &BridgeConfig,
    config_path: &Path,
    proxies: &mut ProxyRegistry,
) -> Result<LocalCluster> {
    match config.cluster.mode {
        K8sMode::InCluster => {
            let endpoint = Url::parse(IN_CLUSTER_K8S_ENDPOINT).wrap_err("in-cluster endpoint")?;
            let ca_file = PathBuf::from(IN_CLUSTER_CA);
            let client = proxy_client(Some(&ca_file), false)
                .wrap_err("error inferring cluster config from environment")?;
            let token = fs::read_to_string(IN_CLUSTER_BEARER_TOKEN)
                .wrap_err("failed to read service account token")?
                .trim()
                .to_string();

            proxies.insert_cluster(LOCAL_CLUSTER, ProxyConfig::new(endpoint.clone(), client));
            setup_in_cluster_services(config, config_path, proxies)?;

            Ok(LocalCluster {
                endpoint,
                ca_file: Some(ca_file),
                service_account_token: Some(token),
            })
        }
        K8sMode::OffCluster => {
            let endpoint = config
                .cluster
                .endpoint
                .as_deref()
                .ok_or_else(|| eyre!("cluster.endpoint is required for off-cluster mode"))?;
            let endpoint = Url::parse(endpoint).wrap_err("cluster.endpoint")?;
            let skip_verify = config.cluster.skip_verify_tls;
            if skip_verify {
                warn!("cluster TLS verification is disabled, never use this in production");
            }

            let client = proxy_client(None, skip_verify)?;
            proxies.insert_cluster(LOCAL_CLUSTER, ProxyConfig::new(endpoint.clone(), client));
            setup_off_cluster_services(config, proxies, skip_verify)?;

            Ok(LocalCluster {
                endpoint,
                ca_file: None,
                service_account_token: None,
            })
        }
    }
}

fn setup_in_cluster_services(
    config: &BridgeConfig,
    config_path: &Path,
    proxies: &mut ProxyRegistry,
) -> Result<()> {
    let Some(ref service_ca) = config.cluster.service_ca_file else {
        return Ok(());
    };
    let service_ca = resolve_config_relative_paths(config_path, service_ca);
    let client = proxy_client(Some(&service_ca), false)
        .wrap_err("no CA found for cluster services")?;

    let ns = &config.cluster.monitoring_namespace;
    let monitoring = [
        (service::THANOS, format!("https://thanos-querier.{ns}.svc:9091/api")),
        (service::THANOS_TENANCY, format!("https://thanos-querier.{ns}.svc:9092/api")),
        (service::THANOS_TENANCY_RULES, format!("https://thanos-querier.{ns}.svc:9093/api")),
        (service::ALERT_MANAGER, format!("https://monitoring-alertmanager.{ns}.svc:9094/api")),
        (service::ALERT_MANAGER_TENANCY, format!("https://monitoring-alertmanager.{ns}.svc:9092/api")),
        (service::METERING, format!("https://{METERING_HOST}/api")),
        (service::GITOPS, format!("https://{GITOPS_HOST}")),
    ];
    for (name, endpoint) in monitoring {
        let endpoint = Url::parse(&endpoint).wrap_err_with(|| format!("{name} endpoint"))?;
        proxies.insert_service(name, ProxyConfig::new(endpoint, client.clone()));
    }
    Ok(())
}

fn setup_off_cluster_services(
    config: &BridgeConfig,
    proxies: &mut ProxyRegistry,
    skip_verify: bool,
) -> Result<()> {
    let client = proxy_client(None, skip_verify)?;
    let off = &config.cluster.off_cluster;

    if let Some(ref thanos) = off.thanos {
        let endpoint = Url::parse(thanos).wrap_err("cluster.off_cluster.thanos")?;
        for name in [
            service::THANOS,
            service::THANOS_TENANCY,
            service::THANOS_TENANCY_RULES,
        ] {
            proxies.insert_service(name, ProxyConfig::new(endpoint.clone(), client.clone()));
        }
    }
    if let Some(ref alertmanager) = off.alertmanager {
        let endpoint = Url::parse(alertmanager).wrap_err("cluster.off_cluster.alertmanager")?;
        for name in [service::ALERT_MANAGER, service::ALERT_MANAGER_TENANCY] {
            proxies.insert_service(name, ProxyConfig::new(endpoint.clone(), client.clone()));
        }
    }
    if let Some(ref metering) = off.metering {
        let endpoint = Url::parse(metering).wrap_err("cluster.off_cluster.metering")?;
        proxies.insert_service(service::METERING, ProxyConfig::new(endpoint, client.clone()));
    }
    if let Some(ref gitops) = off.gitops {
        let endpoint = Url::parse(gitops).wrap_err("cluster.off_cluster.gitops")?;
        proxies.insert_service(service::GITOPS, ProxyConfig::new(endpoint, client.clone()));
    }
    Ok(())
}

/// Managed clusters are skipped with an error log when misconfigured; one
/// broken remote cluster must not take the console down for the rest.
fn setup_managed_clusters(
    config: &BridgeConfig,
    config_path: &Path,
    proxies: &mut ProxyRegistry,
) -> Vec<ManagedClusterConfig> {
    let mut valid = Vec::new();
    for cluster in &config.managed_clusters {
        if let Err(e) = validate_managed_cluster(cluster) {
            error!(cluster = %cluster.name, error = %e, "skipping invalid managed cluster");
            continue;
        }
        let endpoint = match Url::parse(&cluster.api_server.url) {
            Ok(url) => url,
            Err(e) => {
                error!(cluster = %cluster.name, error = %e, "skipping managed cluster with invalid API server URL");
                continue;
            }
        };
        let ca_file = resolve_config_relative_paths(config_path, &cluster.api_server.ca_file);
        let client = match proxy_client(Some(&ca_file), false) {
            Ok(client) => client,
            Err(e) => {
                error!(cluster = %cluster.name, error = %e, "skipping managed cluster with unusable CA");
                continue;
            }
        };

        proxies.insert_cluster(cluster.name.clone(), ProxyConfig::new(endpoint, client));
        valid.push(cluster.clone());
    }
    valid
}

fn client_secret(config: &BridgeConfig, config_path: &Path) -> Result<Arc<SecretString>> {
    if let Some(ref secret) = config.auth.client_secret {
        return Ok(secret.clone());
    }
    let file = config
        .auth
        .client_secret_file
        .as_deref()
        .ok_or_else(|| eyre!("must provide auth.client_secret or auth.client_secret_file"))?;
    let file = resolve_config_relative_paths(config_path, file);
    let secret = fs::read_to_string(&file)
        .wrap_err_with(|| format!("failed to read client secret file {}", file.display()))?;
    Ok(Arc::new(SecretString::from(secret.trim().to_string())))
}

fn auth_scopes(config: &BridgeConfig, source: SourceKind) -> Vec<String> {
    if !config.auth.scopes.is_empty() {
        return config.auth.scopes.clone();
    }
    match source {
        // Scope from the cluster OAuth documentation.
        SourceKind::OpenShift => vec!["user:full".to_string()],
        SourceKind::Oidc => ["openid", "email", "profile", "groups"]
            .map(str::to_string)
            .to_vec(),
    }
}

struct AutherSetup<'a> {
    config: &'a BridgeConfig,
    config_path: &'a Path,
    base_url: &'a Url,
    cookie_path: &'a str,
    secure_cookies: bool,
    local: &'a LocalCluster,
}

async fn setup_authers(
    setup: AutherSetup<'_>,
    managed: &[ManagedClusterConfig],
    clients: &Arc<ClientCache>,
) -> Result<HashMap<String, Arc<Authenticator>>> {
    let source = match setup.config.auth.method {
        UserAuthMode::Oidc => SourceKind::Oidc,
        UserAuthMode::Openshift => SourceKind::OpenShift,
        UserAuthMode::Disabled => return Ok(HashMap::new()),
    };

    let base = setup.base_url.as_str();
    let error_url = single_joining_slash(base, AUTH_ERROR_ENDPOINT);
    let success_url = single_joining_slash(base, AUTH_SUCCESS_ENDPOINT);
    let secret = client_secret(setup.config, setup.config_path)?;
    let scopes = auth_scopes(setup.config, source);
    let cookie = |cluster: &str| SessionCookieConfig {
        path: setup.cookie_path.to_string(),
        secure: setup.secure_cookies,
        domain: setup.config.auth.cookie_domain.clone(),
        cluster: cluster.to_string(),
    };

    let issuer_url = match source {
        // The cluster API server fronts OAuth metadata discovery.
        SourceKind::OpenShift => setup.local.endpoint.as_str().to_string(),
        SourceKind::Oidc => setup
            .config
            .auth
            .issuer_url
            .clone()
            .ok_or_else(|| eyre!("auth.issuer_url is required for oidc auth"))?,
    };

    let mut authers = HashMap::new();
    let local_config = auth::Config {
        source,
        issuer_url,
        issuer_ca: setup
            .config
            .auth
            .issuer_ca
            .as_deref()
            .map(|ca| resolve_config_relative_paths(setup.config_path, ca)),
        k8s_ca: setup.local.ca_file.clone(),
        client_id: setup
            .config
            .auth
            .client_id
            .clone()
            .ok_or_else(|| eyre!("auth.client_id is required"))?,
        client_secret: secret.clone(),
        scopes: scopes.clone(),
        redirect_url: single_joining_slash(base, AUTH_CALLBACK_ENDPOINT),
        error_url: error_url.clone(),
        success_url: success_url.clone(),
        referer_url: base.to_string(),
        cookie: cookie(LOCAL_CLUSTER),
    };
    let auther = Authenticator::new(local_config, clients.clone())
        .await
        .wrap_err("error initializing authenticator")?;
    authers.insert(LOCAL_CLUSTER.to_string(), Arc::new(auther));

    for cluster in managed {
        let managed_config = auth::Config {
            source,
            issuer_url: cluster.api_server.url.clone(),
            issuer_ca: cluster
                .oauth
                .ca_file
                .as_deref()
                .map(|ca| resolve_config_relative_paths(setup.config_path, ca)),
            k8s_ca: Some(resolve_config_relative_paths(
                setup.config_path,
                &cluster.api_server.ca_file,
            )),
            client_id: cluster.oauth.client_id.clone(),
            client_secret: cluster.oauth.client_secret.clone(),
            scopes: scopes.clone(),
            redirect_url: single_joining_slash(
                base,
                &format!("{AUTH_CALLBACK_ENDPOINT}/{}", cluster.name),
            ),
            error_url: error_url.clone(),
            success_url: success_url.clone(),
            referer_url: base.to_string(),
            cookie: cookie(&cluster.name),
        };
        let auther = Authenticator::new(managed_config, clients.clone())
            .await
            .wrap_err_with(|| {
                format!(
                    "error initializing authenticator for managed cluster {}",
                    cluster.name
                )
            })?;
        authers.insert(cluster.name.clone(), Arc::new(auther));
    }

    Ok(authers)
}

/// Build the full application state from a validated configuration.
///
/// Blocks until every configured identity provider has answered discovery
/// (with retries); the console must not serve traffic claiming a login
/// capability it cannot fulfill.
///
/// # Errors
///
/// Fails on unusable local-cluster or service-backend configuration and on
/// identity providers that stay unreachable past the retry window.
pub async fn initialize_state(config_path: &Path, config: &BridgeConfig) -> Result<AppState> {
    let clients = Arc::new(ClientCache::new()?);

    let base_address = if config.server.base_address.is_empty() {
        &config.server.listen
    } else {
        &config.server.base_address
    };
    let base_url = Url::parse(base_address).wrap_err("server.base_address")?;
    let secure_cookies = base_url.scheme() == "https";
    if secure_cookies {
        info!("cookies are secure!");
    } else {
        warn!("cookies are not secure because base_address is not https!");
    }
    let cookie_path = single_joining_slash(&config.server.base_path, "/api/");

    let mut proxies = ProxyRegistry::new();
    let local = setup_local_cluster(config, config_path, &mut proxies)?;
    let managed = setup_managed_clusters(config, config_path, &mut proxies);

    let cluster_management =
        Url::parse(CLUSTER_MANAGEMENT_URL).wrap_err("cluster management endpoint")?;
    proxies.insert_service(
        service::CLUSTER_MANAGEMENT,
        ProxyConfig::new(cluster_management, proxy_client(None, false)?),
    );

    let authers = setup_authers(
        AutherSetup {
            config,
            config_path,
            base_url: &base_url,
            cookie_path: &cookie_path,
            secure_cookies,
            local: &local,
        },
        &managed,
        &clients,
    )
    .await?;

    let (static_user, service_account_token) = match config.cluster.auth {
        K8sAuthMode::ServiceAccount => {
            let token = local
                .service_account_token
                .clone()
                .ok_or_else(|| eyre!("service account token is only available in-cluster"))?;
            (static_user_for(config, &token), Some(token))
        }
        K8sAuthMode::BearerToken => {
            let token = config
                .cluster
                .bearer_token
                .as_ref()
                .ok_or_else(|| eyre!("cluster.bearer_token is required"))?
                .expose_secret()
                .to_string();
            (static_user_for(config, &token), Some(token))
        }
        K8sAuthMode::Oidc | K8sAuthMode::Openshift => (None, None),
    };
    if config.auth.method == UserAuthMode::Disabled {
        warn!("running with AUTHENTICATION DISABLED!");
    }

    Ok(AppState {
        auth: Arc::new(AuthRuntime::new(
            authers,
            static_user,
            service_account_token,
        )),
        proxies: Arc::new(proxies),
        clients,
        settings: Arc::new(ServerSettings {
            base_url,
            base_path: config.server.base_path.clone(),
            public_dir: resolve_config_relative_paths(config_path, &config.server.public_dir),
            logout_redirect: config.auth.logout_redirect.clone(),
            secure_cookies,
            cookie_path,
        }),
    })
}

fn static_user_for(config: &BridgeConfig, token: &str) -> Option<User> {
    (config.auth.method == UserAuthMode::Disabled).then(|| User {
        id: String::new(),
        username: String::new(),
        token: token.to_string(),
    })
}
