//! Configuration handling for the console bridge.

mod loader;
mod types;

pub use loader::load;
pub(crate) use loader::validate_managed_cluster;
pub use types::{
    AuthConfig, BridgeConfig, ClusterConfig, IN_CLUSTER_BEARER_TOKEN, IN_CLUSTER_CA, K8sAuthMode,
    K8sMode, ManagedClusterAPIServer, ManagedClusterConfig, ManagedClusterOAuth,
    OffClusterEndpoints, ServerConfig, TlsConfig, UserAuthMode, resolve_config_relative_paths,
};
