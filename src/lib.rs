//! Geerpc - Multiplexed RPC over stream transports
//!
//! This crate provides a small RPC framework: concurrent calls multiplexed
//! on a single connection, a per-connection negotiated message codec,
//! per-call and per-connect timeouts, and endpoint resolution through an
//! HTTP registry with heartbeats and pluggable load balancing.
//!
//! # Quick Start
//!
//! ## Server
//!
//! ```rust,ignore
//! use geerpc::{Server, Service};
//! use std::sync::Arc;
//!
//! let server = Arc::new(Server::new());
//! server.register(
//!     Service::new("Foo").method("Sum", |args: (i32, i32)| async move {
//!         Ok::<_, std::convert::Infallible>(args.0 + args.1)
//!     }),
//! )?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! tokio::spawn(server.accept(listener));
//! ```
//!
//! ## Client
//!
//! ```rust,ignore
//! use geerpc::{CancellationToken, Client, Options};
//!
//! let client = Client::dial("127.0.0.1:9999", Options::default()).await?;
//! let sum: i32 = client
//!     .call(&CancellationToken::new(), "Foo.Sum", &(3, 4))
//!     .await?;
//! ```
//!
//! # Wire Format
//!
//! A connection opens with one JSON-line negotiation blob (magic number,
//! codec tag, timeouts). Everything after is framed by the negotiated codec:
//! 4-byte little-endian u32 length prefix + payload, a header frame followed
//! by a body frame per message.

pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod options;
pub mod registry;
pub mod server;
pub mod service;
mod transport;
pub mod xclient;

// Re-exports for convenience.
pub use client::{Call, Client};
pub use codec::{CodecType, Header, MAX_MESSAGE_SIZE};
pub use discovery::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode};
pub use error::{Error, Result};
pub use options::{Options, DEFAULT_CONNECT_TIMEOUT, MAGIC_NUMBER};
pub use registry::{heartbeat, Registry};
pub use server::{Server, DEFAULT_RPC_PATH};
pub use service::{Method, Service};
pub use xclient::XClient;

// Re-export the cancellation token used by `Client::call` and
// `XClient::broadcast`.
pub use tokio_util::sync::CancellationToken;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{Call, Client};
    pub use crate::codec::CodecType;
    pub use crate::discovery::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode};
    pub use crate::error::{Error, Result};
    pub use crate::options::Options;
    pub use crate::registry::Registry;
    pub use crate::server::Server;
    pub use crate::service::Service;
    pub use crate::xclient::XClient;

    pub use tokio_util::sync::CancellationToken;
}
