//! Codec for encoding/decoding control channel frames

use crate::messages::Frame;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed bincode framing for [`Frame`].
///
/// Format: `[length: u32 big-endian][payload: bincode serialized frame]`.
/// A decode failure is fatal for the owning control channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Maximum frame size (16MB)
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a single frame to bytes
    pub fn encode_frame(frame: &Frame) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(frame)?;

        if payload.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one frame from the buffer
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, `Err` on error.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        // Need the length header first
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        buf.advance(4);
        let frame_bytes = buf.split_to(length);

        let frame: Frame = bincode::deserialize(&frame_bytes)?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = Self::encode_frame(&frame)?;
        dst.extend_from_slice(&encoded);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        Self::decode_frame(src)
    }
}
