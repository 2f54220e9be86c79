//! Endpoint discovery with pluggable load balancing.
//!
//! `MultiServersDiscovery` holds a static endpoint list; `RegistryDiscovery`
//! wraps it and refreshes the list from the registry's HTTP endpoint on a
//! TTL. Selection is uniform random or round-robin; the round-robin index is
//! randomly seeded so a fleet of fresh clients does not start on the same
//! server.

use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::SERVERS_HEADER;

/// Default TTL between registry refreshes.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Load-balancing mode for [`Discovery::get`].
///
/// A [`Discovery`] implementation that does not support a mode returns
/// [`Error::UnsupportedSelectMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
}

/// Endpoint selection interface used by the cluster client.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-fetches the endpoint list from its source, if it has one.
    async fn refresh(&self) -> Result<()>;

    /// Replaces the endpoint list.
    async fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Selects one endpoint according to the mode.
    async fn get(&self, mode: SelectMode) -> Result<String>;

    /// Returns a copy of every known endpoint.
    async fn get_all(&self) -> Result<Vec<String>>;
}

struct ServerList {
    servers: Vec<String>,
    index: usize,
}

/// Discovery over a manually maintained endpoint list.
pub struct MultiServersDiscovery {
    list: RwLock<ServerList>,
}

impl MultiServersDiscovery {
    /// Creates a discovery over the given endpoints.
    pub fn new(servers: Vec<String>) -> Self {
        let index = rand::thread_rng().gen_range(0..u32::MAX as usize);
        Self {
            list: RwLock::new(ServerList { servers, index }),
        }
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.list.write().unwrap().servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        let mut list = self.list.write().unwrap();
        let n = list.servers.len();
        if n == 0 {
            return Err(Error::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => Ok(list.servers[rand::thread_rng().gen_range(0..n)].clone()),
            SelectMode::RoundRobin => {
                let server = list.servers[list.index % n].clone();
                list.index = (list.index + 1) % n;
                Ok(server)
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        let list = self.list.read().unwrap();
        Ok(list.servers.clone())
    }
}

/// Discovery that polls a registry's HTTP endpoint.
///
/// `get`/`get_all` refresh first; the refresh is a no-op until the TTL since
/// the last successful update has elapsed.
pub struct RegistryDiscovery {
    inner: MultiServersDiscovery,
    registry: String,
    update_timeout: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// Creates a discovery polling `registry`; a zero `update_timeout`
    /// falls back to the 10-second default.
    pub fn new(registry: impl Into<String>, update_timeout: Duration) -> Self {
        let update_timeout = if update_timeout.is_zero() {
            DEFAULT_UPDATE_TIMEOUT
        } else {
            update_timeout
        };
        Self {
            inner: MultiServersDiscovery::new(Vec::new()),
            registry: registry.into(),
            update_timeout,
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        {
            let last_update = self.last_update.lock().unwrap();
            if let Some(at) = *last_update {
                if at + self.update_timeout > Instant::now() {
                    return Ok(());
                }
            }
        }

        debug!(registry = %self.registry, "refresh servers from registry");
        let response = self
            .http
            .get(&self.registry)
            .send()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;
        let servers: Vec<String> = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        self.inner.update(servers).await?;
        *self.last_update.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.inner.update(servers).await?;
        *self.last_update.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.inner.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        self.inner.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_list_errors() {
        let d = MultiServersDiscovery::new(Vec::new());
        for mode in [SelectMode::Random, SelectMode::RoundRobin] {
            assert!(matches!(d.get(mode).await, Err(Error::NoAvailableServers)));
        }
        assert!(d.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let d = MultiServersDiscovery::new(addrs(&["a", "b", "c"]));

        let first = d.get(SelectMode::RoundRobin).await.unwrap();
        let second = d.get(SelectMode::RoundRobin).await.unwrap();
        let third = d.get(SelectMode::RoundRobin).await.unwrap();
        let fourth = d.get(SelectMode::RoundRobin).await.unwrap();

        // Three distinct endpoints, then the cycle repeats.
        let mut seen = vec![first.clone(), second, third];
        seen.sort();
        assert_eq!(seen, addrs(&["a", "b", "c"]));
        assert_eq!(fourth, first);
    }

    #[tokio::test]
    async fn test_random_stays_in_set() {
        let d = MultiServersDiscovery::new(addrs(&["a", "b"]));
        for _ in 0..20 {
            let pick = d.get(SelectMode::Random).await.unwrap();
            assert!(pick == "a" || pick == "b");
        }
    }

    #[tokio::test]
    async fn test_update_replaces_list() {
        let d = MultiServersDiscovery::new(addrs(&["a"]));
        d.update(addrs(&["x", "y"])).await.unwrap();
        assert_eq!(d.get_all().await.unwrap(), addrs(&["x", "y"]));
    }

    #[tokio::test]
    async fn test_get_all_returns_copy() {
        let d = MultiServersDiscovery::new(addrs(&["a"]));
        let mut copy = d.get_all().await.unwrap();
        copy.push("b".to_string());
        assert_eq!(d.get_all().await.unwrap(), addrs(&["a"]));
    }

    #[tokio::test]
    async fn test_zero_update_timeout_coerces_to_default() {
        let d = RegistryDiscovery::new("http://127.0.0.1:9/registry", Duration::ZERO);
        assert_eq!(d.update_timeout, DEFAULT_UPDATE_TIMEOUT);

        // The coerced TTL gates refresh like an explicit one: with a fresh
        // manual update, get never touches the dead registry address.
        d.update(vec!["a".to_string()]).await.unwrap();
        assert_eq!(d.get(SelectMode::RoundRobin).await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_registry_discovery_ttl_skips_refresh() {
        // Points at a dead address; a refresh attempt would error, so a
        // successful get proves the TTL short-circuit.
        let d = RegistryDiscovery::new("http://127.0.0.1:9/registry", Duration::from_secs(60));
        d.update(addrs(&["a"])).await.unwrap();
        assert_eq!(d.get(SelectMode::RoundRobin).await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_registry_discovery_refresh_failure_surfaces() {
        let d = RegistryDiscovery::new("http://127.0.0.1:9/registry", Duration::from_secs(60));
        assert!(matches!(d.get_all().await, Err(Error::Registry(_))));
    }
}
