//! RPC server: accept loop, per-connection negotiation, and request
//! dispatch.
//!
//! Each connection starts with one JSON-line negotiation blob, then runs a
//! sequential read loop with concurrent request handling. Responses share
//! one writer whose lock keeps (header, body) pairs atomic; frames leave in
//! handler completion order, not arrival order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::codec::{CodecType, Header};
use crate::error::{Error, Result};
use crate::options::{read_options, MAGIC_NUMBER};
use crate::service::{Method, Service};
use crate::transport::{BoxedRead, MessageReader, MessageWriter};

/// Path expected in the HTTP CONNECT preamble.
pub const DEFAULT_RPC_PATH: &str = "/_geerpc_/rpc";

/// Status line body sent after a successful CONNECT.
pub(crate) const CONNECTED: &str = "200 Connected to RPC";

/// Upper bound on the CONNECT preamble.
const MAX_PREAMBLE: usize = 4096;

/// RPC server holding registered services.
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Creates a server with no services.
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a service; a second service with the same name is an error.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write().unwrap();
        if services.contains_key(service.name()) {
            return Err(Error::DuplicateService(service.name().to_string()));
        }
        debug!(service = %service.name(), "register service");
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Resolves `"Service.Method"`, splitting on the last dot.
    ///
    /// `"a.b.c"` resolves to service `"a.b"`, method `"c"`; method names
    /// never contain dots.
    pub(crate) fn find_method(&self, service_method: &str) -> Result<Arc<Method>> {
        let dot = service_method
            .rfind('.')
            .ok_or_else(|| Error::IllFormedServiceMethod(service_method.to_string()))?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);

        let services = self.services.read().unwrap();
        let service = services
            .get(service_name)
            .ok_or_else(|| Error::ServiceNotFound(service_name.to_string()))?;
        service
            .get_method(method_name)
            .ok_or_else(|| Error::MethodNotFound(method_name.to_string()))
    }

    /// Invocation count for a `"Service.Method"` name, if registered.
    pub fn num_calls(&self, service_method: &str) -> Option<u64> {
        let dot = service_method.rfind('.')?;
        let services = self.services.read().unwrap();
        services
            .get(&service_method[..dot])?
            .num_calls(&service_method[dot + 1..])
    }

    /// Accepts connections forever, one task per connection.
    ///
    /// An accept error terminates the loop (fatal to the listener, not the
    /// process).
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let server = self.clone();
                    tokio::spawn(async move { server.serve_conn(stream).await });
                }
                Err(e) => {
                    error!("accept error: {e}");
                    return;
                }
            }
        }
    }

    /// Accepts connections that begin with the HTTP CONNECT preamble.
    pub async fn accept_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted http connection");
                    let server = self.clone();
                    tokio::spawn(async move { server.serve_http_conn(stream).await });
                }
                Err(e) => {
                    error!("accept error: {e}");
                    return;
                }
            }
        }
    }

    /// Serves one connection: negotiation blob, then the request loop.
    pub async fn serve_conn<T>(self: Arc<Self>, transport: T)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let mut read: BoxedRead = Box::new(read_half);

        let opt = match read_options(&mut read).await {
            Ok(opt) => opt,
            Err(e) => {
                error!("options error: {e}");
                return;
            }
        };
        if opt.magic_number != MAGIC_NUMBER {
            error!("{}", Error::InvalidMagic(opt.magic_number));
            return;
        }
        let codec = match opt.codec() {
            Ok(codec) => codec,
            Err(e) => {
                error!("{e}");
                return;
            }
        };

        let reader = MessageReader::new(codec, read);
        let writer = Arc::new(MessageWriter::new(codec, Box::new(write_half)));
        self.serve_codec(reader, writer, opt.handle_timeout).await;
    }

    /// Serves a connection that starts with `CONNECT <path> HTTP/1.0`.
    ///
    /// On the expected path it answers with the connected status line and
    /// hands the raw stream to [`serve_conn`](Self::serve_conn); anything
    /// else gets a 404 and the connection is dropped.
    pub async fn serve_http_conn<T>(self: Arc<Self>, mut transport: T)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let preamble = match read_preamble(&mut transport).await {
            Ok(p) => p,
            Err(e) => {
                error!("connect preamble error: {e}");
                return;
            }
        };

        let request_line = preamble.lines().next().unwrap_or("");
        let mut parts = request_line.split_whitespace();
        let connected = matches!(
            (parts.next(), parts.next()),
            (Some("CONNECT"), Some(path)) if path == DEFAULT_RPC_PATH
        );

        if !connected {
            let _ = transport.write_all(b"HTTP/1.0 404 Not Found\n\n").await;
            return;
        }
        let response = format!("HTTP/1.0 {CONNECTED}\n\n");
        if let Err(e) = transport.write_all(response.as_bytes()).await {
            error!("connect response error: {e}");
            return;
        }
        self.serve_conn(transport).await;
    }

    /// Sequential read loop, concurrent handling.
    ///
    /// The body frame is always consumed, so a failed service lookup never
    /// desynchronizes the stream; the loop answers with a header error and
    /// keeps going. A read error ends the loop, which then waits for
    /// in-flight handlers before closing the writer.
    async fn serve_codec(
        self: Arc<Self>,
        mut reader: MessageReader,
        writer: Arc<MessageWriter>,
        handle_timeout: Duration,
    ) {
        let codec = reader.codec();
        let mut handlers = JoinSet::new();
        loop {
            let mut header = match reader.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    debug!("read header error: {e}");
                    break;
                }
            };
            let args = match reader.read_body().await {
                Ok(args) => args,
                Err(e) => {
                    debug!("read body error: {e}");
                    break;
                }
            };

            match self.find_method(&header.service_method) {
                Ok(method) => {
                    let writer = writer.clone();
                    handlers.spawn(handle_request(
                        codec,
                        method,
                        header,
                        args,
                        writer,
                        handle_timeout,
                    ));
                }
                Err(e) => {
                    header.error = e.to_string();
                    send_response(&writer, &header, placeholder(codec)).await;
                }
            }
        }

        while handlers.join_next().await.is_some() {}
        let _ = writer.close().await;
    }
}

/// Runs one request, racing the method future against the handle timeout.
///
/// A zero timeout waits indefinitely. On timeout the method future is
/// dropped, cancelling the user call, and the caller gets the timeout text
/// in the response header.
async fn handle_request(
    codec: CodecType,
    method: Arc<Method>,
    mut header: Header,
    args: Bytes,
    writer: Arc<MessageWriter>,
    timeout: Duration,
) {
    let fut = method.invoke(codec, args);

    let outcome = if timeout.is_zero() {
        fut.await
    } else {
        tokio::select! {
            outcome = fut => outcome,
            _ = tokio::time::sleep(timeout) => {
                header.error = format!("request handle timeout: expect within {timeout:?}");
                send_response(&writer, &header, placeholder(codec)).await;
                return;
            }
        }
    };

    match outcome {
        Ok(reply) => send_response(&writer, &header, reply).await,
        Err(msg) => {
            header.error = msg;
            send_response(&writer, &header, placeholder(codec)).await;
        }
    }
}

/// Body sent with error responses; the peer discards it without decoding.
fn placeholder(codec: CodecType) -> Bytes {
    codec.encode(&()).unwrap_or_default()
}

async fn send_response(writer: &MessageWriter, header: &Header, body: Bytes) {
    if let Err(e) = writer.write(header, &body).await {
        error!("write response error: {e}");
    }
}

/// Reads the CONNECT block up to the blank line, byte-at-a-time so the RPC
/// stream that follows is untouched.
async fn read_preamble<T>(transport: &mut T) -> Result<String>
where
    T: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    loop {
        let n = transport.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\n\n") || buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_PREAMBLE {
            return Err(Error::HttpHandshake("preamble too long".to_string()));
        }
    }
    String::from_utf8(buf).map_err(|e| Error::HttpHandshake(e.to_string()))
}
