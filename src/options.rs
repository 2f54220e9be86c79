//! Per-connection negotiation blob.
//!
//! The client sends one `Options` value as a single JSON object terminated
//! by a newline before any codec-framed traffic. Field names are PascalCase
//! on the wire and durations encode as integer nanoseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::CodecType;
use crate::error::{Error, Result};

/// Marks a connection as a geerpc connection; mismatch is fatal.
pub const MAGIC_NUMBER: i32 = 0x3bef5c;

/// Default transport connect + handshake deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the negotiation line, which is a handful of short fields.
const MAX_OPTIONS_LINE: usize = 4096;

/// Connection options negotiated ahead of codec-framed traffic.
///
/// `handle_timeout` bounds server-side method execution per request; zero
/// means unlimited. `connect_timeout` bounds the dial and handshake; zero
/// disables the handshake deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    pub magic_number: i32,
    pub codec_type: String,
    #[serde(with = "duration_nanos")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::Bincode.tag().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    /// Options with the given payload codec.
    pub fn with_codec(codec: CodecType) -> Self {
        Self {
            codec_type: codec.tag().to_string(),
            ..Self::default()
        }
    }

    /// Sets the connect/handshake deadline; zero disables it.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the server-side per-request handle deadline; zero is unlimited.
    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    /// Resolves the negotiated payload codec, rejecting unknown tags.
    pub fn codec(&self) -> Result<CodecType> {
        CodecType::from_tag(&self.codec_type)
    }
}

/// Serializes a `Duration` as integer nanoseconds, the wire encoding used
/// by the negotiation blob.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(de)?;
        Ok(Duration::from_nanos(nanos))
    }
}

/// Writes the negotiation blob as one JSON line.
pub(crate) async fn write_options<W>(writer: &mut W, opt: &Options) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut line = serde_json::to_vec(opt).map_err(|e| Error::Encode(e.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the negotiation blob: a single JSON line.
///
/// Reads byte-at-a-time so nothing past the delimiter is consumed; the
/// codec-framed traffic follows immediately on the same stream.
pub(crate) async fn read_options<R>(reader: &mut R) -> Result<Options>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut line = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_OPTIONS_LINE {
            return Err(Error::Decode("options line too long".to_string()));
        }
    }
    serde_json::from_slice(&line).map_err(|e| Error::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opt = Options::default();
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec().unwrap(), CodecType::Bincode);
        assert_eq!(opt.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(opt.handle_timeout.is_zero());
    }

    #[test]
    fn test_wire_field_names() {
        let opt = Options::default();
        let json = serde_json::to_string(&opt).unwrap();
        assert!(json.contains("\"MagicNumber\""));
        assert!(json.contains("\"CodecType\""));
        assert!(json.contains("\"ConnectTimeout\""));
        assert!(json.contains("\"HandleTimeout\""));
    }

    #[test]
    fn test_duration_encodes_as_nanos() {
        let opt = Options::default().with_connect_timeout(Duration::from_secs(1));
        let json = serde_json::to_string(&opt).unwrap();
        assert!(json.contains("\"ConnectTimeout\":1000000000"));
    }

    #[tokio::test]
    async fn test_options_line_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let opt = Options::with_codec(CodecType::Json)
            .with_handle_timeout(Duration::from_secs(1));
        write_options(&mut client, &opt).await.unwrap();

        let decoded = read_options(&mut server).await.unwrap();
        assert_eq!(decoded.magic_number, MAGIC_NUMBER);
        assert_eq!(decoded.codec().unwrap(), CodecType::Json);
        assert_eq!(decoded.handle_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_read_options_leaves_stream_intact() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_options(&mut client, &Options::default()).await.unwrap();
        client.write_all(b"after").await.unwrap();

        let _ = read_options(&mut server).await.unwrap();
        let mut rest = [0u8; 5];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"after");
    }

    #[tokio::test]
    async fn test_read_options_garbage() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"not json\n").await.unwrap();
        assert!(matches!(
            read_options(&mut server).await,
            Err(Error::Decode(_))
        ));
    }
}
