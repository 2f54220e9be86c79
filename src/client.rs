//! RPC client: multiplexes concurrent calls over one connection.
//!
//! A client owns one stream transport. Callers register a pending entry,
//! write a (header, args) pair under the sending lock, and wait on their
//! call's channel; a single receive task reads responses and routes them by
//! sequence number. Lock order is always `sending` then the state mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{CodecType, Header};
use crate::error::{Error, Result};
use crate::options::{write_options, Options, MAGIC_NUMBER};
use crate::server::{CONNECTED, DEFAULT_RPC_PATH};
use crate::transport::{BoxedRead, BoxedWrite, MessageReader, MessageWriter};

/// An in-flight call handle returned by [`Client::go`].
///
/// The channel behind `recv` fires exactly once, when the call completes or
/// fails. Dropping the handle abandons the call; the response is then
/// discarded on arrival.
pub struct Call {
    pub seq: u64,
    pub service_method: String,
    codec: CodecType,
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl Call {
    /// Waits for completion and decodes the reply into `R`.
    pub async fn recv<R: DeserializeOwned>(self) -> Result<R> {
        let codec = self.codec;
        let body = self.recv_raw().await?;
        codec.decode(&body).map_err(|e| Error::ReadBody(e.to_string()))
    }

    /// Waits for completion and returns the raw encoded reply.
    pub(crate) async fn recv_raw(self) -> Result<Bytes> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// A call that already failed before anything was sent.
    fn failed(service_method: &str, codec: CodecType, err: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self {
            seq: 0,
            service_method: service_method.to_string(),
            codec,
            rx,
        }
    }
}

struct State {
    pending: HashMap<u64, oneshot::Sender<Result<Bytes>>>,
    seq: u64,
    closing: bool,
    shutdown: bool,
}

struct Inner {
    codec: CodecType,
    /// Serializes register+write so frames leave in seq order.
    sending: tokio::sync::Mutex<()>,
    writer: MessageWriter,
    state: Mutex<State>,
}

/// RPC client over a single connection. Cloning shares the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client over an established transport.
    ///
    /// Validates the codec tag, writes the negotiation blob, and starts the
    /// receive task. The transport is consumed either way; on failure it is
    /// simply dropped.
    pub async fn new<T>(transport: T, opt: Options) -> Result<Client>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = opt.codec()?;
        let (read_half, write_half) = tokio::io::split(transport);
        let mut write: BoxedWrite = Box::new(write_half);
        write_options(&mut write, &opt).await?;

        let inner = Arc::new(Inner {
            codec,
            sending: tokio::sync::Mutex::new(()),
            writer: MessageWriter::new(codec, write),
            state: Mutex::new(State {
                pending: HashMap::new(),
                seq: 1,
                closing: false,
                shutdown: false,
            }),
        });

        let reader = MessageReader::new(codec, Box::new(read_half));
        tokio::spawn(receive(inner.clone(), reader));

        Ok(Client { inner })
    }

    /// Dials a TCP endpoint.
    pub async fn dial(address: &str, opt: Options) -> Result<Client> {
        let opt = parse_options(opt)?;
        let timeout = opt.connect_timeout;
        let stream = within(timeout, async { Ok(TcpStream::connect(address).await?) }).await?;
        within(timeout, Client::new(stream, opt)).await
    }

    /// Dials an endpoint reached through an HTTP CONNECT preamble.
    pub async fn dial_http(address: &str, opt: Options) -> Result<Client> {
        let opt = parse_options(opt)?;
        let timeout = opt.connect_timeout;
        let stream = within(timeout, async { Ok(TcpStream::connect(address).await?) }).await?;
        within(timeout, async {
            let mut stream = stream;
            http_connect(&mut stream).await?;
            Client::new(stream, opt).await
        })
        .await
    }

    /// Dials a Unix domain socket endpoint.
    #[cfg(unix)]
    pub async fn dial_unix(path: &str, opt: Options) -> Result<Client> {
        let opt = parse_options(opt)?;
        let timeout = opt.connect_timeout;
        let stream = within(timeout, async {
            Ok(tokio::net::UnixStream::connect(path).await?)
        })
        .await?;
        within(timeout, Client::new(stream, opt)).await
    }

    /// Dials a `"protocol@addr"` endpoint: `http@`, `tcp@`, or `unix@`.
    pub async fn x_dial(rpc_addr: &str, opt: Options) -> Result<Client> {
        let parts: Vec<&str> = rpc_addr.split('@').collect();
        if parts.len() != 2 {
            return Err(Error::InvalidAddress(rpc_addr.to_string()));
        }
        let (protocol, addr) = (parts[0], parts[1]);
        match protocol {
            "http" => Client::dial_http(addr, opt).await,
            "tcp" => Client::dial(addr, opt).await,
            #[cfg(unix)]
            "unix" => Client::dial_unix(addr, opt).await,
            other => Err(Error::UnsupportedProtocol(other.to_string())),
        }
    }

    /// Starts an asynchronous call and returns its handle.
    ///
    /// Failures (shutdown, encode, write) are published through the handle,
    /// not returned here; a single write failure fails only this call.
    pub async fn go<A: Serialize>(&self, service_method: &str, args: &A) -> Call {
        match self.inner.codec.encode(args) {
            Ok(body) => self.go_raw(service_method, body).await,
            Err(e) => Call::failed(service_method, self.inner.codec, e),
        }
    }

    /// `go` with pre-encoded argument bytes.
    pub(crate) async fn go_raw(&self, service_method: &str, args: Bytes) -> Call {
        let (tx, rx) = oneshot::channel();

        let _sending = self.inner.sending.lock().await;
        let seq = match self.register_call(tx) {
            Some(seq) => seq,
            None => {
                // register_call already published the shutdown error.
                return Call {
                    seq: 0,
                    service_method: service_method.to_string(),
                    codec: self.inner.codec,
                    rx,
                };
            }
        };

        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        if let Err(e) = self.inner.writer.write(&header, &args).await {
            if let Some(tx) = self.remove_call(seq) {
                let _ = tx.send(Err(e));
            }
        }

        Call {
            seq,
            service_method: service_method.to_string(),
            codec: self.inner.codec,
            rx,
        }
    }

    /// Performs a call, abandoning it when `cancel` fires.
    ///
    /// On cancellation the pending entry is removed so a late response is
    /// discarded, and the client stays usable.
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
        let codec = self.inner.codec;
        let body = self
            .call_raw(cancel, service_method, codec.encode(args)?)
            .await?;
        codec.decode(&body).map_err(|e| Error::ReadBody(e.to_string()))
    }

    /// `call` with pre-encoded arguments and a raw encoded reply.
    pub(crate) async fn call_raw(
        &self,
        cancel: &CancellationToken,
        service_method: &str,
        args: Bytes,
    ) -> Result<Bytes> {
        let call = self.go_raw(service_method, args).await;
        let seq = call.seq;
        tokio::select! {
            _ = cancel.cancelled() => {
                self.remove_call(seq);
                Err(Error::Cancelled)
            }
            outcome = call.recv_raw() => outcome,
        }
    }

    /// Closes the client; the second call returns `Err(Shutdown)`.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        self.inner.writer.close().await
    }

    /// True until the client is closed or torn down by a transport error.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        !state.closing && !state.shutdown
    }

    fn register_call(&self, tx: oneshot::Sender<Result<Bytes>>) -> Option<u64> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closing || state.shutdown {
            drop(state);
            let _ = tx.send(Err(Error::Shutdown));
            return None;
        }
        let seq = state.seq;
        state.pending.insert(seq, tx);
        state.seq += 1;
        Some(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<Result<Bytes>>> {
        self.inner.state.lock().unwrap().pending.remove(&seq)
    }
}

/// Receive loop: routes responses to pending calls by sequence number.
///
/// Both frames of a pair are always consumed, so an unmatched or cancelled
/// call's body is discarded without desynchronizing the stream. Any read
/// error terminates every pending call and marks the client shut down.
async fn receive(inner: Arc<Inner>, mut reader: MessageReader) {
    let cause = loop {
        let header = match reader.read_header().await {
            Ok(Some(header)) => header,
            Ok(None) => break Error::Shutdown.to_string(),
            Err(e) => break e.to_string(),
        };
        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(e) => break e.to_string(),
        };

        let tx = inner.state.lock().unwrap().pending.remove(&header.seq);
        match tx {
            None => {
                // Cancelled or unknown; body already discarded.
            }
            Some(tx) if !header.error.is_empty() => {
                let _ = tx.send(Err(Error::Remote(header.error)));
            }
            Some(tx) => {
                let _ = tx.send(Ok(body));
            }
        }
    };
    debug!("receive loop exits: {cause}");
    terminate_calls(&inner, cause).await;
}

/// Fails every pending call and marks the client shut down.
///
/// Takes `sending` before the state mutex, the lock order shared with the
/// senders.
async fn terminate_calls(inner: &Inner, cause: String) {
    let _sending = inner.sending.lock().await;
    let mut state = inner.state.lock().unwrap();
    state.shutdown = true;
    for (_, tx) in state.pending.drain() {
        let _ = tx.send(Err(Error::Disconnected(cause.clone())));
    }
}

/// Normalizes caller options: the magic number is always forced and an
/// empty codec tag falls back to the default; unknown tags fail here,
/// before dialing.
pub(crate) fn parse_options(mut opt: Options) -> Result<Options> {
    opt.magic_number = MAGIC_NUMBER;
    if opt.codec_type.is_empty() {
        opt.codec_type = CodecType::Bincode.tag().to_string();
    }
    opt.codec()?;
    Ok(opt)
}

/// Applies the connect timeout to one dial stage; zero disables it.
async fn within<T>(timeout: Duration, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectTimeout(timeout)),
    }
}

/// Client half of the HTTP CONNECT preamble.
async fn http_connect<T>(stream: &mut T) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\n\n");
    stream.write_all(request.as_bytes()).await?;

    // Read the response status block byte-at-a-time; the RPC stream follows
    // immediately after the blank line.
    let mut buf = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\n\n") || buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 1024 {
            return Err(Error::HttpHandshake("response too long".to_string()));
        }
    }

    let status = String::from_utf8_lossy(&buf);
    let status_line = status.lines().next().unwrap_or("").trim_end();
    if status_line == format!("HTTP/1.0 {CONNECTED}") {
        Ok(())
    } else {
        Err(Error::HttpHandshake(status_line.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageWriter as ServerWriter;

    /// Serves one faithful peer over an in-memory duplex: reads the options
    /// line, then echoes `seq * 2` for every request.
    async fn echo_peer(stream: tokio::io::DuplexStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut read: BoxedRead = Box::new(read_half);
        let opt = crate::options::read_options(&mut read).await.unwrap();
        let codec = opt.codec().unwrap();

        let mut reader = MessageReader::new(codec, read);
        let writer = ServerWriter::new(codec, Box::new(write_half));
        while let Ok(Some(header)) = reader.read_header().await {
            let _args = reader.read_body().await.unwrap();
            let body = codec.encode(&(header.seq * 2)).unwrap();
            writer.write(&header, &body).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        tokio::spawn(echo_peer(server_stream));

        let client = Client::new(client_stream, Options::default()).await.unwrap();
        let cancel = CancellationToken::new();
        let reply: u64 = client.call(&cancel, "Echo.Double", &1u8).await.unwrap();
        assert_eq!(reply, 2);
    }

    #[tokio::test]
    async fn test_seq_unique_and_increasing() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        tokio::spawn(echo_peer(server_stream));

        let client = Client::new(client_stream, Options::default()).await.unwrap();
        let mut seqs = Vec::new();
        for _ in 0..5 {
            let call = client.go("Echo.Double", &0u8).await;
            seqs.push(call.seq);
            let reply: u64 = call.recv().await.unwrap();
            assert_eq!(reply, seqs.last().unwrap() * 2);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        tokio::spawn(echo_peer(server_stream));

        let client = Client::new(client_stream, Options::default()).await.unwrap();
        assert!(client.is_available());
        client.close().await.unwrap();
        assert!(!client.is_available());
        assert!(matches!(client.close().await, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_call_after_close_fails_fast() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        tokio::spawn(echo_peer(server_stream));

        let client = Client::new(client_stream, Options::default()).await.unwrap();
        client.close().await.unwrap();

        let cancel = CancellationToken::new();
        let result: Result<u64> = client.call(&cancel, "Echo.Double", &0u8).await;
        assert!(matches!(result, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_peer_disconnect_terminates_pending() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);

        // Peer that reads the options line and hangs up.
        tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(server_stream);
            let mut read: BoxedRead = Box::new(read_half);
            let _ = crate::options::read_options(&mut read).await;
            drop(write_half);
        });

        let client = Client::new(client_stream, Options::default()).await.unwrap();
        let call = client.go("Echo.Double", &0u8).await;
        let result: Result<u64> = call.recv().await;
        assert!(matches!(result, Err(Error::Disconnected(_))));
        assert!(!client.is_available());
    }

    #[tokio::test]
    async fn test_cancelled_call_removes_pending_entry() {
        // Peer that swallows requests without answering.
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (read_half, _write_half) = tokio::io::split(server_stream);
            let mut read: BoxedRead = Box::new(read_half);
            let _ = crate::options::read_options(&mut read).await;
            loop {
                let mut sink = [0u8; 256];
                if read.read(&mut sink).await.unwrap_or(0) == 0 {
                    break;
                }
            }
        });

        let client = Client::new(client_stream, Options::default()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<u64> = client.call(&cancel, "Echo.Double", &0u8).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(client.inner.state.lock().unwrap().pending.is_empty());
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_x_dial_address_format() {
        let result = Client::x_dial("no-at-sign", Options::default()).await;
        assert!(matches!(result, Err(Error::InvalidAddress(_))));

        let result = Client::x_dial("a@b@c", Options::default()).await;
        assert!(matches!(result, Err(Error::InvalidAddress(_))));

        let result = Client::x_dial("carrier@addr", Options::default()).await;
        assert!(matches!(result, Err(Error::UnsupportedProtocol(p)) if p == "carrier"));
    }

    #[test]
    fn test_parse_options_forces_magic() {
        let mut opt = Options::default();
        opt.magic_number = 1;
        opt.codec_type = String::new();
        let opt = parse_options(opt).unwrap();
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec().unwrap(), CodecType::Bincode);

        let mut opt = Options::default();
        opt.codec_type = "application/gob".to_string();
        assert!(matches!(parse_options(opt), Err(Error::UnknownCodec(_))));
    }
}
