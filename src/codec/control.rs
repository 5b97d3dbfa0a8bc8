//! The robot control protocol: a compact binary format, all numbers little-endian.
//!
//! ```ascii
//! 0: tag (u8)
//! 1: message body, depending on the tag
//! ```
//!
//! Tags this gateway does not know are skipped without complaint - the control process is
//!  updated independently and may send messages that are newer than the gateway.

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;

use crate::codec::{DecodeError, MessageCodec, Tagged};
use crate::util::buf::BufExt;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ControlTag {
    AudioChunk = 0x10,
    EnableAudioStreaming = 0x11,
    ControlRequest = 0x20,
    ControlRelease = 0x21,
    ControlResponse = 0x22,
}

/// Priority at which an external client asks for control of the robot's behaviors
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ControlPriority {
    OverrideBehaviors = 10,
    Default = 20,
    ReserveControl = 30,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ControlEvent {
    Granted = 1,
    Lost = 2,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AudioChunk {
    pub group_id: u32,
    pub chunk_id: u16,
    pub audio_chunk_count: u16,
    pub signal_power: u16,
    pub data: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlMessage {
    AudioChunk(AudioChunk),
    EnableAudioStreaming { enable: bool },
    ControlRequest { priority: ControlPriority },
    ControlRelease,
    ControlResponse { event: ControlEvent },
}

impl Tagged for ControlMessage {
    type Tag = ControlTag;

    fn tag(&self) -> ControlTag {
        match self {
            ControlMessage::AudioChunk(_) => ControlTag::AudioChunk,
            ControlMessage::EnableAudioStreaming { .. } => ControlTag::EnableAudioStreaming,
            ControlMessage::ControlRequest { .. } => ControlTag::ControlRequest,
            ControlMessage::ControlRelease => ControlTag::ControlRelease,
            ControlMessage::ControlResponse { .. } => ControlTag::ControlResponse,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl MessageCodec for ControlCodec {
    type Message = ControlMessage;

    const FAMILY: &'static str = "control";

    fn encode_payload(&self, msg: &ControlMessage, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u8(msg.tag().into());
        match msg {
            ControlMessage::AudioChunk(chunk) => {
                let data_len = u16::try_from(chunk.data.len())?;
                buf.put_u32_le(chunk.group_id);
                buf.put_u16_le(chunk.chunk_id);
                buf.put_u16_le(chunk.audio_chunk_count);
                buf.put_u16_le(chunk.signal_power);
                buf.put_u16_le(data_len);
                buf.put_slice(&chunk.data);
            }
            ControlMessage::EnableAudioStreaming { enable } => {
                buf.put_u8(*enable as u8);
            }
            ControlMessage::ControlRequest { priority } => {
                buf.put_u8((*priority).into());
            }
            ControlMessage::ControlRelease => {}
            ControlMessage::ControlResponse { event } => {
                buf.put_u8((*event).into());
            }
        }
        Ok(())
    }

    fn decode_payload(&self, payload: &[u8]) -> Result<Option<ControlMessage>, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::TooShort { len: 0, min: 1 });
        }

        let raw_tag = payload[0];
        let tag = match ControlTag::try_from(raw_tag) {
            Ok(tag) => tag,
            Err(_) => {
                trace!("skipping control message with unknown tag {:#04x}", raw_tag);
                return Ok(None);
            }
        };

        Self::decode_body(tag, &payload[1..])
            .map(Some)
            .map_err(|e| DecodeError::malformed(tag, e))
    }
}

impl ControlCodec {
    fn decode_body(tag: ControlTag, mut buf: &[u8]) -> anyhow::Result<ControlMessage> {
        let msg = match tag {
            ControlTag::AudioChunk => {
                let group_id = buf.checked_u32_le()?;
                let chunk_id = buf.checked_u16_le()?;
                let audio_chunk_count = buf.checked_u16_le()?;
                let signal_power = buf.checked_u16_le()?;
                let data = buf.checked_len_prefixed_bytes()?;
                ControlMessage::AudioChunk(AudioChunk {
                    group_id,
                    chunk_id,
                    audio_chunk_count,
                    signal_power,
                    data,
                })
            }
            ControlTag::EnableAudioStreaming => {
                ControlMessage::EnableAudioStreaming { enable: buf.checked_bool()? }
            }
            ControlTag::ControlRequest => {
                let priority = ControlPriority::try_from(buf.checked_u8()?)?;
                ControlMessage::ControlRequest { priority }
            }
            ControlTag::ControlRelease => ControlMessage::ControlRelease,
            ControlTag::ControlResponse => {
                let event = ControlEvent::try_from(buf.checked_u8()?)?;
                ControlMessage::ControlResponse { event }
            }
        };
        Ok(msg)
    }
}
