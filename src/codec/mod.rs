//! Framing and message (de)serialization.
//!
//! Every frame on a peer connection is a little-endian u16 length, followed by exactly that many
//!  bytes of payload:
//!
//! ```ascii
//! 0: payload length (u16 LE)
//! 2: payload, serialized according to the protocol family
//! ```
//!
//! The payload format is pluggable per protocol family through [MessageCodec]. Each family has
//!  its own closed set of message tags, and each message knows its tag ([Tagged]) - received
//!  messages are routed by tag without the transport knowing anything about the family.

pub mod control;
pub mod generic;

use std::fmt::Debug;
use std::hash::Hash;

use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};

pub const FRAME_HEADER_LEN: usize = size_of::<u16>();

/// Compile-time mapping from a message to the discriminant it is routed by.
pub trait Tagged {
    type Tag: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn tag(&self) -> Self::Tag;
}

/// the tag type of a codec's messages
pub type TagOf<C> = <<C as MessageCodec>::Message as Tagged>::Tag;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame of {len} bytes is shorter than the minimum of {min} bytes")]
    TooShort { len: usize, min: usize },
    #[error("frame declares {declared} payload bytes, but {actual} bytes are present")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(u32),
    #[error("malformed {tag} message: {reason}")]
    Malformed { tag: String, reason: String },
}

impl DecodeError {
    pub fn malformed(tag: impl Debug, reason: impl ToString) -> DecodeError {
        DecodeError::Malformed {
            tag: format!("{:?}", tag),
            reason: reason.to_string(),
        }
    }
}

/// A [MessageCodec] takes care of serializing and deserializing the messages of one protocol
///  family. The framing (length prefix) is common to all families and handled here.
pub trait MessageCodec: Send + Sync + 'static {
    type Message: Tagged + Clone + Debug + Send + Sync + 'static;

    /// human-readable name of the protocol family, for logging
    const FAMILY: &'static str;

    fn encode_payload(&self, msg: &Self::Message, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// Deserializes a frame's payload, i.e. the frame without its length prefix.
    ///
    /// `Ok(None)` means the frame is well-formed but should be ignored without complaint; this is
    ///  how families treat messages they tolerate for forward compatibility.
    fn decode_payload(&self, payload: &[u8]) -> Result<Option<Self::Message>, DecodeError>;

    /// Encodes a message into a complete frame, including the length prefix.
    fn encode(&self, msg: &Self::Message) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u16_le(0);
        self.encode_payload(msg, &mut buf)?;

        // patch the actual length after serialization
        let payload_len = buf.len() - FRAME_HEADER_LEN;
        let payload_len = u16::try_from(payload_len)
            .map_err(|_| anyhow!("{} message {:?} has {} bytes and does not fit into a frame", Self::FAMILY, msg.tag(), payload_len))?;
        buf[..FRAME_HEADER_LEN].copy_from_slice(&payload_len.to_le_bytes());
        Ok(buf.freeze())
    }

    fn decode(&self, payload: &[u8]) -> Result<Option<(<Self::Message as Tagged>::Tag, Self::Message)>, DecodeError> {
        Ok(self.decode_payload(payload)?
            .map(|msg| (msg.tag(), msg)))
    }

    /// Decodes a complete frame, validating the length prefix against the actual data
    fn decode_frame(&self, frame: &[u8]) -> Result<Option<(<Self::Message as Tagged>::Tag, Self::Message)>, DecodeError> {
        self.decode(split_frame(frame)?)
    }
}

pub fn split_frame(frame: &[u8]) -> Result<&[u8], DecodeError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(DecodeError::TooShort { len: frame.len(), min: FRAME_HEADER_LEN });
    }
    let declared = u16::from_le_bytes([frame[0], frame[1]]) as usize;
    let payload = &frame[FRAME_HEADER_LEN..];
    if declared != payload.len() {
        return Err(DecodeError::LengthMismatch { declared, actual: payload.len() });
    }
    Ok(payload)
}
