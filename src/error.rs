//! Error types for geerpc.
//!
//! One enum covers the whole crate: transport failures, codec negotiation,
//! per-call failures, service lookup, discovery, and the registry HTTP
//! surface. Remote errors carry the peer's header error string verbatim.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in geerpc operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The client was closed or torn down by a peer/codec failure.
    #[error("connection is shut down")]
    Shutdown,

    /// The negotiation blob carried the wrong magic number.
    #[error("invalid magic number {0:#x}")]
    InvalidMagic(i32),

    /// The negotiation blob named a codec tag nobody implements.
    #[error("invalid codec type {0}")]
    UnknownCodec(String),

    /// The transport connect or handshake did not finish in time.
    #[error("connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    /// The call's cancellation token fired before a response arrived.
    #[error("context cancelled")]
    Cancelled,

    /// IO error during read/write operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload encode error from the negotiated codec.
    #[error("encode error: {0}")]
    Encode(String),

    /// Payload decode error from the negotiated codec.
    #[error("decode error: {0}")]
    Decode(String),

    /// The response body did not decode into the caller's reply type.
    #[error("reading body {0}")]
    ReadBody(String),

    /// Frame size exceeds the maximum allowed size.
    #[error("message size {0} exceeds maximum {1}")]
    MessageTooLarge(usize, usize),

    /// Remote error from the other end, verbatim from the response header.
    #[error("{0}")]
    Remote(String),

    /// The connection died while calls were pending; carries the cause.
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// A service/method name without a dot separator.
    #[error("service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    /// No service registered under the requested name.
    #[error("can't find service {0}")]
    ServiceNotFound(String),

    /// The service exists but the method does not.
    #[error("can't find method {0}")]
    MethodNotFound(String),

    /// A service with this name is already registered.
    #[error("service already defined: {0}")]
    DuplicateService(String),

    /// Discovery has no endpoints to hand out.
    #[error("no available servers")]
    NoAvailableServers,

    /// Discovery was asked for a selection mode it does not implement.
    #[error("not supported select mode")]
    UnsupportedSelectMode,

    /// An `XDial` address that is not `protocol@addr`.
    #[error("wrong address format {0:?}, expect protocol@addr")]
    InvalidAddress(String),

    /// An `XDial` protocol tag without a transport behind it.
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),

    /// The HTTP CONNECT handshake got something other than the success line.
    #[error("unexpected HTTP response: {0}")]
    HttpHandshake(String),

    /// Registry HTTP request failed (heartbeat or discovery refresh).
    #[error("registry error: {0}")]
    Registry(String),
}

impl Error {
    /// Returns true if this error means the client can no longer be used.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown | Error::Disconnected(_))
    }

    /// Returns true if this error is a connect/handshake timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectTimeout(_))
    }

    /// Returns true if the call was cancelled by its token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Creates a remote error from a string.
    pub fn remote(msg: impl Into<String>) -> Self {
        Error::Remote(msg.into())
    }
}

/// Result type alias using geerpc's Error type.
pub type Result<T> = std::result::Result<T, Error>;
