//! Transport plumbing: framed message reads and pair-atomic writes.
//!
//! Both ends exchange (header, body) pairs as two length-prefixed frames.
//! `MessageWriter` encodes the whole pair in memory and pushes it with a
//! single write + flush, so a pair is never interleaved with another as long
//! as callers serialize through the writer (the connection's sending lock).
//! A failed encode therefore leaves nothing on the wire and cannot
//! desynchronize the peer.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{Encoder, FramedRead};

use crate::codec::{CodecType, FrameCodec, Header};
use crate::error::{Error, Result};

/// Boxed read half of a connection.
pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a connection.
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes (header, body) pairs to the connection.
///
/// The internal mutex is the connection's sending lock; acquiring it through
/// `write` keeps response frames pair-atomic.
pub(crate) struct MessageWriter {
    codec: CodecType,
    io: Mutex<BoxedWrite>,
    closed: AtomicBool,
}

impl MessageWriter {
    pub(crate) fn new(codec: CodecType, writer: BoxedWrite) -> Self {
        Self {
            codec,
            io: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    /// Writes one header frame and one body frame in a single flush.
    pub(crate) async fn write(&self, header: &Header, body: &Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let header_bytes = self.codec.encode(header)?;
        let mut buf = BytesMut::new();
        let mut frames = FrameCodec::new();
        frames.encode(header_bytes, &mut buf)?;
        frames.encode(body.clone(), &mut buf)?;

        let mut io = self.io.lock().await;
        io.write_all(&buf).await?;
        io.flush().await?;
        Ok(())
    }

    /// Shuts down the write half; the peer observes EOF.
    pub(crate) async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut io = self.io.lock().await;
        io.shutdown().await?;
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Reads headers and raw body frames from the connection.
///
/// Bodies come back as raw bytes; the caller decodes them into its own type
/// or simply drops them to discard an unwanted body.
pub(crate) struct MessageReader {
    codec: CodecType,
    framed: FramedRead<BoxedRead, FrameCodec>,
}

impl MessageReader {
    pub(crate) fn new(codec: CodecType, reader: BoxedRead) -> Self {
        Self {
            codec,
            framed: FramedRead::new(reader, FrameCodec::new()),
        }
    }

    pub(crate) fn codec(&self) -> CodecType {
        self.codec
    }

    /// Reads the next header frame; `None` on clean EOF between pairs.
    pub(crate) async fn read_header(&mut self) -> Result<Option<Header>> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(frame)) => Ok(Some(self.codec.decode(&frame)?)),
        }
    }

    /// Reads the body frame that follows a header. EOF mid-pair is an error.
    pub(crate) async fn read_body(&mut self) -> Result<Bytes> {
        match self.framed.next().await {
            None => Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
            Some(Err(e)) => Err(e),
            Some(Ok(frame)) => Ok(frame),
        }
    }
}
