//! Length-delimited codecs for the peer stream.
//!
//! Handshake: 4-byte big-endian length prefix + serde JSON.
//! Frames: 8-byte big-endian code + 4-byte big-endian length + payload.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{HandshakeMessage, Msg};
use crate::ProtocolError;

/// Maximum payload size for either codec: 16 MB.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Handshake length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Frame header: code + length.
const FRAME_HEADER_SIZE: usize = 8 + 4;

/// Codec for handshake messages.
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = HandshakeMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let msg_bytes = src.split_to(length);

        let message: HandshakeMessage = serde_json::from_slice(&msg_bytes)?;
        Ok(Some(message))
    }
}

impl Encoder<HandshakeMessage> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: HandshakeMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

/// Codec for application frames. Code-range checks belong to the peer,
/// which knows the negotiated protocol offsets.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Msg;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..FRAME_HEADER_SIZE];
        let code = header.get_u64();
        let length = header.get_u32() as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total = FRAME_HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(length).freeze();
        Ok(Some(Msg { code, payload }))
    }
}

impl Encoder<Msg> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Msg, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: item.payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(FRAME_HEADER_SIZE + item.payload.len());
        dst.put_u64(item.code);
        dst.put_u32(item.payload.len() as u32);
        dst.extend_from_slice(&item.payload);

        Ok(())
    }
}
