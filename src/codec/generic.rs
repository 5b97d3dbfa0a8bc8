//! The generic protocol family: messages are serde types, serialized with bincode.
//!
//! bincode writes an enum's variant index as a little-endian u32 before the variant's data, so
//!  the first four bytes of every payload are the message tag. [GatewayTag] mirrors the variant
//!  order of [GatewayMessage] - keep them in sync when adding messages.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::codec::{DecodeError, MessageCodec, Tagged};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum GatewayTag {
    PlayAnimationRequest = 0,
    PlayAnimationResponse = 1,
    ListAnimationsRequest = 2,
    AnimationAvailable = 3,
    EndOfListAnimations = 4,
    UpdateSettingsRequest = 5,
    UpdateSettingsResponse = 6,
    EnableImageStreaming = 7,
    ImageChunk = 8,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum AnimationResult {
    Completed,
    Interrupted,
    NotFound,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum SettingsResult {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageChunk {
    pub image_id: u32,
    pub frame_time_stamp: u32,
    pub chunk_id: u32,
    pub image_chunk_count: u32,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum GatewayMessage {
    PlayAnimationRequest { name: String, loops: u32 },
    PlayAnimationResponse { name: String, result: AnimationResult },
    ListAnimationsRequest,
    AnimationAvailable { name: String },
    EndOfListAnimations,
    UpdateSettingsRequest { settings: BTreeMap<String, String> },
    UpdateSettingsResponse { result: SettingsResult, version: u64 },
    EnableImageStreaming { enable: bool },
    ImageChunk(ImageChunk),
}

impl Tagged for GatewayMessage {
    type Tag = GatewayTag;

    fn tag(&self) -> GatewayTag {
        match self {
            GatewayMessage::PlayAnimationRequest { .. } => GatewayTag::PlayAnimationRequest,
            GatewayMessage::PlayAnimationResponse { .. } => GatewayTag::PlayAnimationResponse,
            GatewayMessage::ListAnimationsRequest => GatewayTag::ListAnimationsRequest,
            GatewayMessage::AnimationAvailable { .. } => GatewayTag::AnimationAvailable,
            GatewayMessage::EndOfListAnimations => GatewayTag::EndOfListAnimations,
            GatewayMessage::UpdateSettingsRequest { .. } => GatewayTag::UpdateSettingsRequest,
            GatewayMessage::UpdateSettingsResponse { .. } => GatewayTag::UpdateSettingsResponse,
            GatewayMessage::EnableImageStreaming { .. } => GatewayTag::EnableImageStreaming,
            GatewayMessage::ImageChunk(_) => GatewayTag::ImageChunk,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GenericCodec;

impl GenericCodec {
    const TAG_LEN: usize = size_of::<u32>();
}

impl MessageCodec for GenericCodec {
    type Message = GatewayMessage;

    const FAMILY: &'static str = "generic";

    fn encode_payload(&self, msg: &GatewayMessage, buf: &mut BytesMut) -> anyhow::Result<()> {
        let serialized = bincode::serialize(msg)?;
        buf.extend_from_slice(&serialized);
        Ok(())
    }

    /// Unlike the control family, an unknown tag is an error here: both sides of the generic
    ///  protocol are built from the same message definitions.
    fn decode_payload(&self, payload: &[u8]) -> Result<Option<GatewayMessage>, DecodeError> {
        if payload.len() < Self::TAG_LEN {
            return Err(DecodeError::TooShort { len: payload.len(), min: Self::TAG_LEN });
        }

        let raw_tag = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let tag = GatewayTag::try_from(raw_tag)
            .map_err(|_| DecodeError::UnknownTag(raw_tag))?;

        bincode::deserialize(payload)
            .map(Some)
            .map_err(|e| DecodeError::malformed(tag, e))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    fn settings() -> BTreeMap<String, String> {
        let mut settings = BTreeMap::new();
        settings.insert("locale".to_string(), "en-US".to_string());
        settings.insert("volume".to_string(), "3".to_string());
        settings
    }

    /// the tag enum must mirror the variant order, since the tag is read from bincode's variant index
    #[rstest]
    #[case(GatewayMessage::PlayAnimationRequest { name: "anim_wave".to_string(), loops: 1 })]
    #[case(GatewayMessage::PlayAnimationResponse { name: "anim_wave".to_string(), result: AnimationResult::Completed })]
    #[case(GatewayMessage::ListAnimationsRequest)]
    #[case(GatewayMessage::AnimationAvailable { name: "anim_blink".to_string() })]
    #[case(GatewayMessage::EndOfListAnimations)]
    #[case(GatewayMessage::UpdateSettingsRequest { settings: settings() })]
    #[case(GatewayMessage::UpdateSettingsResponse { result: SettingsResult::Accepted, version: 12 })]
    #[case(GatewayMessage::EnableImageStreaming { enable: true })]
    #[case(GatewayMessage::ImageChunk(ImageChunk { image_id: 3, frame_time_stamp: 1000, chunk_id: 0, image_chunk_count: 2, width: 2, height: 1, data: Bytes::from_static(b"abc") }))]
    fn test_wire_tag_matches_message_tag(#[case] msg: GatewayMessage) {
        let frame = GenericCodec.encode(&msg).unwrap();
        let payload = &frame[2..];
        let wire_tag = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_eq!(wire_tag, u32::from(msg.tag()));

        let (tag, decoded) = GenericCodec.decode_frame(&frame).unwrap().unwrap();
        assert_eq!(tag, msg.tag());
        assert_eq!(decoded, msg);
    }

    #[rstest]
    #[case::empty(b"", DecodeError::TooShort { len: 0, min: 4 })]
    #[case::short(b"\x01\0\0", DecodeError::TooShort { len: 3, min: 4 })]
    #[case::unknown_tag(b"\x63\0\0\0", DecodeError::UnknownTag(99))]
    fn test_decode_errors(#[case] payload: &[u8], #[case] expected: DecodeError) {
        assert_eq!(GenericCodec.decode(payload), Err(expected));
    }

    #[test]
    fn test_decode_truncated_body() {
        // PlayAnimationRequest, string length announced but missing
        let payload = b"\0\0\0\0\x05\0\0\0\0\0\0\0ab";
        assert!(matches!(GenericCodec.decode(payload), Err(DecodeError::Malformed { .. })));
    }
}
