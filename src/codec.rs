//! Message codecs and wire framing.
//!
//! Two payload codecs coexist and are chosen per connection by the tag
//! carried in the negotiation blob: a binary-structured codec (bincode) and
//! a JSON-text codec (serde_json). Unknown tags are rejected on both sides,
//! by the client before the dial completes and by the server right after it
//! reads the negotiation blob.
//!
//! After negotiation every message is a length-prefixed frame:
//! 4-byte little-endian u32 length followed by the codec-encoded payload.
//! A request or response is always a Header frame followed by a Body frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Maximum frame payload size (10MB).
pub const MAX_MESSAGE_SIZE: usize = 10_000_000;

/// Length of the size prefix in bytes.
const SIZE_PREFIX_LEN: usize = 4;

/// Per-message header, exchanged in its own frame ahead of the body.
///
/// `seq` is assigned by the client, monotonic per connection starting at 1.
/// `error` is empty on success; on failure it carries the reason and the
/// body frame holds the unit placeholder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    pub service_method: String,
    pub seq: u64,
    pub error: String,
}

/// Payload codec selected by the negotiation blob's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    /// Binary-structured encoding (bincode), the default.
    Bincode,
    /// JSON-text encoding (serde_json).
    Json,
}

impl CodecType {
    /// The wire tag carried in the negotiation blob.
    pub fn tag(&self) -> &'static str {
        match self {
            CodecType::Bincode => "application/bincode",
            CodecType::Json => "application/json",
        }
    }

    /// Resolves a wire tag, rejecting tags nobody implements.
    pub fn from_tag(tag: &str) -> Result<CodecType> {
        match tag {
            "application/bincode" => Ok(CodecType::Bincode),
            "application/json" => Ok(CodecType::Json),
            other => Err(Error::UnknownCodec(other.to_string())),
        }
    }

    /// Encodes a value into payload bytes.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        let buf = match self {
            CodecType::Bincode => {
                bincode::serialize(value).map_err(|e| Error::Encode(e.to_string()))?
            }
            CodecType::Json => {
                serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))?
            }
        };
        Ok(Bytes::from(buf))
    }

    /// Decodes payload bytes into a value.
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            CodecType::Bincode => {
                bincode::deserialize(data).map_err(|e| Error::Decode(e.to_string()))
            }
            CodecType::Json => {
                serde_json::from_slice(data).map_err(|e| Error::Decode(e.to_string()))
            }
        }
    }
}

/// Frame codec: 4-byte little-endian length prefix + raw payload.
///
/// Zero-length payloads are legal; the bincode unit placeholder used for
/// error responses encodes to zero bytes.
#[derive(Debug, Default, Clone)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a new frame codec.
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < SIZE_PREFIX_LEN {
            return Ok(None);
        }

        let mut size_bytes = [0u8; SIZE_PREFIX_LEN];
        size_bytes.copy_from_slice(&src[..SIZE_PREFIX_LEN]);
        let msg_size = u32::from_le_bytes(size_bytes) as usize;

        if msg_size > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(msg_size, MAX_MESSAGE_SIZE));
        }

        let total_size = SIZE_PREFIX_LEN + msg_size;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(SIZE_PREFIX_LEN);
        Ok(Some(src.split_to(msg_size).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        let msg_size = item.len();
        if msg_size > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(msg_size, MAX_MESSAGE_SIZE));
        }

        dst.reserve(SIZE_PREFIX_LEN + msg_size);
        dst.put_u32_le(msg_size as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_tags() {
        assert_eq!(
            CodecType::from_tag("application/bincode").unwrap(),
            CodecType::Bincode
        );
        assert_eq!(
            CodecType::from_tag("application/json").unwrap(),
            CodecType::Json
        );
        assert!(matches!(
            CodecType::from_tag("application/gob"),
            Err(Error::UnknownCodec(t)) if t == "application/gob"
        ));
    }

    #[test]
    fn test_header_roundtrip_both_codecs() {
        let header = Header {
            service_method: "Foo.Sum".into(),
            seq: 7,
            error: String::new(),
        };

        for codec in [CodecType::Bincode, CodecType::Json] {
            let bytes = codec.encode(&header).unwrap();
            let decoded: Header = codec.decode(&bytes).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn test_json_header_field_names() {
        let header = Header {
            service_method: "Foo.Sum".into(),
            seq: 1,
            error: String::new(),
        };
        let bytes = CodecType::Json.encode(&header).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"ServiceMethod\""));
        assert!(text.contains("\"Seq\""));
        assert!(text.contains("\"Error\""));
    }

    #[test]
    fn test_unit_placeholder_encodes() {
        // Error responses carry the unit placeholder as their body.
        let b = CodecType::Bincode.encode(&()).unwrap();
        assert!(b.is_empty());
        let j = CodecType::Json.encode(&()).unwrap();
        assert_eq!(&j[..], b"null");
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Bytes::from_static(b"hello"), &mut buf).unwrap();
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, 5);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_zero_length() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Bytes::new(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_frame_partial_read() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Bytes::from_static(b"partial message"), &mut buf)
            .unwrap();

        let full = buf.clone();
        buf.truncate(3);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[3..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"partial message");
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let oversized = Bytes::from(vec![0u8; MAX_MESSAGE_SIZE + 1]);
        let result = codec.encode(oversized, &mut buf);
        assert!(matches!(result, Err(Error::MessageTooLarge(_, _))));
    }

    #[test]
    fn test_frame_rejects_huge_prefix() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_MESSAGE_SIZE + 1) as u32);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::MessageTooLarge(_, _))
        ));
    }

    #[test]
    fn test_body_roundtrip_both_codecs() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Args {
            a: i32,
            b: i32,
        }

        let args = Args { a: 3, b: 4 };
        for codec in [CodecType::Bincode, CodecType::Json] {
            let bytes = codec.encode(&args).unwrap();
            let decoded: Args = codec.decode(&bytes).unwrap();
            assert_eq!(decoded, args);
        }
    }
}
