//! Memoized HTTP clients keyed by CA-bundle content.
//!
//! Identity-provider discovery runs on every login, so the bridge would
//! otherwise rebuild a TLS trust store per request. Clients are cached by the
//! raw bytes of the CA file, not its path: path aliasing hits the same entry,
//! and rotating the file content yields a fresh client even when the path is
//! stable. Entries are never evicted; the key space is the small set of
//! configured CA files.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use eyre::{Result, WrapErr as _, eyre};
use reqwest::Client;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-lifetime cache of outbound HTTP clients.
///
/// Two maps are kept: one for clients that layer the CA onto the system
/// trust store and one for clients trusting only the CA. Concurrent reads
/// never block on each other; writes happen at most once per distinct CA
/// content.
pub struct ClientCache {
    default_client: Client,
    with_system_roots: RwLock<HashMap<Vec<u8>, Client>>,
    ca_only: RwLock<HashMap<Vec<u8>, Client>>,
}

impl ClientCache {
    /// # Errors
    ///
    /// Returns an error if the ambient default client cannot be built.
    pub fn new() -> Result<Self> {
        let default_client = base_builder()
            .build()
            .wrap_err("failed to build default HTTP client")?;
        Ok(Self {
            default_client,
            with_system_roots: RwLock::new(HashMap::new()),
            ca_only: RwLock::new(HashMap::new()),
        })
    }

    /// Returns an HTTP client trusting the given CA bundle.
    ///
    /// `None` yields the ambient default client (system trust store). With
    /// `include_system_roots` the CA is layered onto the system roots,
    /// otherwise the CA is the only trust anchor.
    ///
    /// # Errors
    ///
    /// Returns an error when the CA file cannot be read or contains no
    /// parseable CA data.
    pub fn client_for(&self, ca_file: Option<&Path>, include_system_roots: bool) -> Result<Client> {
        let Some(ca_file) = ca_file else {
            return Ok(self.default_client.clone());
        };

        let data = fs::read(ca_file)
            .wrap_err_with(|| format!("load issuer CA file {}", ca_file.display()))?;

        let map = if include_system_roots {
            &self.with_system_roots
        } else {
            &self.ca_only
        };

        {
            let cache = map.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(client) = cache.get(&data) {
                return Ok(client.clone());
            }
        }

        let client = build_ca_client(&data, include_system_roots)
            .wrap_err_with(|| format!("file {} contained no CA data", ca_file.display()))?;

        let mut cache = map
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // A concurrent insert for the same content may have won the race;
        // keep the first entry so repeat callers observe a stable client.
        Ok(cache.entry(data).or_insert(client).clone())
    }
}

fn base_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(CLIENT_TIMEOUT)
        .tls_version_min(reqwest::tls::Version::TLS_1_2)
}

fn build_ca_client(pem: &[u8], include_system_roots: bool) -> Result<Client> {
    let certs = reqwest::Certificate::from_pem_bundle(pem)
        .map_err(|e| eyre!("unable to parse CA data: {e}"))?;
    if certs.is_empty() {
        return Err(eyre!("no CA data"));
    }

    let builder = if include_system_roots {
        base_builder().tls_certs_merge(certs)
    } else {
        base_builder().tls_certs_only(certs)
    };
    builder.build().wrap_err("failed to build HTTP client")
}
