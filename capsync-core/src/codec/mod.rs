//! Stream framing for TCP.
//!
//! TCP delivers a byte stream, so each encoded [`Message`] is wrapped in an
//! outer frame `[length: u32 BE][message bytes]`. The decoder yields one
//! frame per message regardless of how reads split or merge on the socket.
//! Whether the inner bytes form a valid message is decided later by
//! [`wire::decode`](crate::protocol::wire::decode), so a bad message does
//! not poison the stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CapsyncError;
use crate::protocol::{Message, wire};

/// Length of the outer frame prefix.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Largest message body accepted in one frame.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = CapsyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        prefix.copy_from_slice(&src[..FRAME_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(CapsyncError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if src.len() < FRAME_PREFIX_LEN + len {
            src.reserve(FRAME_PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_PREFIX_LEN);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<&Message> for FrameCodec {
    type Error = CapsyncError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = wire::encoded_len(item);
        if len > MAX_FRAME_SIZE {
            return Err(CapsyncError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        dst.reserve(FRAME_PREFIX_LEN + len);
        dst.put_u32(len as u32);
        wire::encode_into(item, dst);
        Ok(())
    }
}
