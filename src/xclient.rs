//! Cluster client: discovery-driven endpoint selection plus a per-endpoint
//! client cache, with single-endpoint calls and first-reply broadcast.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::client::{parse_options, Client};
use crate::codec::CodecType;
use crate::discovery::{Discovery, SelectMode};
use crate::error::{Error, Result};
use crate::options::Options;

/// Combined fan-out state: sticky first error and first committed reply.
struct BroadcastState {
    first_error: Option<Error>,
    reply: Option<Bytes>,
}

/// Client for a fleet of endpoints behind a [`Discovery`].
///
/// Connections are cached per endpoint and reused while available; an
/// unavailable cached client is closed and replaced on the next use.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    opt: Options,
    codec: CodecType,
    clients: tokio::sync::Mutex<HashMap<String, Client>>,
}

impl<D: Discovery> XClient<D> {
    /// Creates a cluster client.
    ///
    /// Options are normalized once here; an unknown codec tag fails
    /// immediately rather than on the first dial.
    pub fn new(discovery: D, mode: SelectMode, opt: Options) -> Result<Self> {
        let opt = parse_options(opt)?;
        let codec = opt.codec()?;
        Ok(Self {
            discovery,
            mode,
            opt,
            codec,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// The discovery backing this client.
    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Returns a cached client for the endpoint, dialing if needed.
    async fn dial(&self, rpc_addr: &str) -> Result<Client> {
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
        }
        // Either absent or cached-but-unavailable; evict before redialing.
        if let Some(stale) = clients.remove(rpc_addr) {
            let _ = stale.close().await;
        }

        let client = Client::x_dial(rpc_addr, self.opt.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr(
        &self,
        rpc_addr: &str,
        cancel: &CancellationToken,
        service_method: &str,
        args: Bytes,
    ) -> Result<Bytes> {
        let client = self.dial(rpc_addr).await?;
        client.call_raw(cancel, service_method, args).await
    }

    /// Calls one endpoint selected by the configured mode.
    pub async fn call<A, R>(
        &self,
        cancel: &CancellationToken,
        service_method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        let body = self
            .call_addr(&rpc_addr, cancel, service_method, self.codec.encode(args)?)
            .await?;
        self.codec
            .decode(&body)
            .map_err(|e| Error::ReadBody(e.to_string()))
    }

    /// Calls every known endpoint concurrently; first reply wins.
    ///
    /// The first error is sticky and cancels the remaining fan-out through a
    /// child token, leaving the caller's token alone. After all calls
    /// settle, the sticky error is returned if one was recorded, otherwise
    /// the first committed reply (`None` when the endpoint list was empty or
    /// no call got as far as a reply).
    pub async fn broadcast<A, R>(
        &self,
        cancel: &CancellationToken,
        service_method: &str,
        args: &A,
    ) -> Result<Option<R>>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let servers = self.discovery.get_all().await?;
        let args = self.codec.encode(args)?;
        let child = cancel.child_token();
        let state = Mutex::new(BroadcastState {
            first_error: None,
            reply: None,
        });

        futures::future::join_all(servers.iter().map(|rpc_addr| {
            let args = args.clone();
            let child = &child;
            let state = &state;
            async move {
                let outcome = self.call_addr(rpc_addr, child, service_method, args).await;
                let mut state = state.lock().unwrap();
                match outcome {
                    Err(e) => {
                        if state.first_error.is_none() {
                            state.first_error = Some(e);
                            child.cancel();
                        }
                    }
                    Ok(body) => {
                        if state.reply.is_none() {
                            state.reply = Some(body);
                        }
                    }
                }
            }
        }))
        .await;

        let state = state.into_inner().unwrap();
        if let Some(e) = state.first_error {
            return Err(e);
        }
        match state.reply {
            Some(body) => self
                .codec
                .decode(&body)
                .map(Some)
                .map_err(|e| Error::ReadBody(e.to_string())),
            None => Ok(None),
        }
    }

    /// Closes and drops every cached client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MultiServersDiscovery;

    #[tokio::test]
    async fn test_new_rejects_unknown_codec() {
        let mut opt = Options::default();
        opt.codec_type = "application/gob".to_string();
        let discovery = MultiServersDiscovery::new(Vec::new());
        assert!(matches!(
            XClient::new(discovery, SelectMode::Random, opt),
            Err(Error::UnknownCodec(_))
        ));
    }

    #[tokio::test]
    async fn test_call_with_no_servers() {
        let discovery = MultiServersDiscovery::new(Vec::new());
        let xc = XClient::new(discovery, SelectMode::Random, Options::default()).unwrap();
        let cancel = CancellationToken::new();
        let result: Result<i32> = xc.call(&cancel, "Foo.Sum", &(1, 2)).await;
        assert!(matches!(result, Err(Error::NoAvailableServers)));
    }

    #[tokio::test]
    async fn test_broadcast_with_no_servers() {
        let discovery = MultiServersDiscovery::new(Vec::new());
        let xc = XClient::new(discovery, SelectMode::Random, Options::default()).unwrap();
        let cancel = CancellationToken::new();
        let result: Result<Option<i32>> = xc.broadcast(&cancel, "Foo.Sum", &(1, 2)).await;
        assert!(matches!(result, Ok(None)));
    }
}
