//! Registry service: tracks live server endpoints over HTTP.
//!
//! Servers POST their address as a heartbeat; clients GET the alive list
//! from a custom response header. Entries expire when their last heartbeat
//! is older than the registry timeout; the GET sweep evicts them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Header carrying the comma-joined alive list on GET responses.
pub const SERVERS_HEADER: &str = "X-Geerpc-Servers";

/// Header carrying the heartbeating server's address on POST requests.
pub const SERVER_HEADER: &str = "X-Geerpc-Server";

/// Default registry path.
pub const DEFAULT_PATH: &str = "/_geerpc_/registry";

/// Default entry lifetime without a heartbeat.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

struct ServerItem {
    addr: String,
    start: Instant,
}

/// In-memory endpoint registry with heartbeat expiry.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, ServerItem>>,
}

impl Registry {
    /// Creates a registry; a zero timeout means entries never expire.
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            servers: Mutex::new(HashMap::new()),
        })
    }

    /// Records a heartbeat: creates the entry or refreshes its start time.
    fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().unwrap();
        match servers.get_mut(addr) {
            Some(item) => item.start = Instant::now(),
            None => {
                servers.insert(
                    addr.to_string(),
                    ServerItem {
                        addr: addr.to_string(),
                        start: Instant::now(),
                    },
                );
            }
        }
    }

    /// Returns the sorted alive list, evicting expired entries on the way.
    fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        let now = Instant::now();
        let mut alive = Vec::with_capacity(servers.len());

        servers.retain(|_, item| {
            if self.timeout.is_zero() || item.start + self.timeout > now {
                alive.push(item.addr.clone());
                true
            } else {
                false
            }
        });
        alive.sort();
        alive
    }

    /// Builds the HTTP router at the default path.
    pub fn router(self: &Arc<Self>) -> Router {
        self.router_at(DEFAULT_PATH)
    }

    /// Builds the HTTP router at a custom path.
    ///
    /// GET answers with the alive list in [`SERVERS_HEADER`]; POST reads the
    /// heartbeat address from [`SERVER_HEADER`] (missing or empty is a 500);
    /// any other method gets a 405 from the method router.
    pub fn router_at(self: &Arc<Self>, path: &str) -> Router {
        info!(%path, "rpc registry path");
        Router::new()
            .route(path, get(get_servers).post(post_server))
            .with_state(self.clone())
    }

    /// Serves the registry on the listener until it fails.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> Result<()> {
        let router = self.router();
        axum::serve(listener, router).await.map_err(Error::Io)
    }
}

async fn get_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let alive = registry.alive_servers().join(",");
    (StatusCode::OK, [(SERVERS_HEADER, alive)])
}

async fn post_server(State(registry): State<Arc<Registry>>, headers: HeaderMap) -> StatusCode {
    let addr = headers
        .get(SERVER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty());
    match addr {
        Some(addr) => {
            registry.put_server(addr);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Sends heartbeats for `addr` to the registry until the task is aborted.
///
/// A zero period defaults to the registry timeout minus a minute, leaving
/// the entry time to be refreshed before it expires. The first heartbeat is
/// sent before this function returns; the rest tick in a background task.
/// Send failures are logged and the loop keeps going.
pub async fn heartbeat(
    registry: &str,
    addr: &str,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    let period = if period.is_zero() {
        DEFAULT_TIMEOUT - Duration::from_secs(60)
    } else {
        period
    };

    let http = reqwest::Client::new();
    send_heartbeat(&http, registry, addr).await;

    let registry = registry.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // the immediate first tick was sent above
        loop {
            ticker.tick().await;
            send_heartbeat(&http, &registry, &addr).await;
        }
    })
}

async fn send_heartbeat(http: &reqwest::Client, registry: &str, addr: &str) {
    debug!(%addr, %registry, "send heartbeat to registry");
    if let Err(e) = http
        .post(registry)
        .header(SERVER_HEADER, addr)
        .send()
        .await
    {
        error!("heartbeat error: {e}");
    }
}
