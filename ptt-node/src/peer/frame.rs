/// Wire framing for peer links.
///
/// ```text
/// [length: u32 BE][entity_id: 32][msg_type: 1][payload: length - 33]
/// ```
///
/// `entity_id` is all zero on the peer-management channel. The payload is
/// the bincode encoding of the message body named by `msg_type`.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use ptt_protocol::PttID;

use super::PeerError;

/// Upper bound on one frame (a full `OplogPush` batch fits well below it).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 32 + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub entity_id: PttID,
    pub msg_type: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn management(msg_type: u8, payload: impl Into<Bytes>) -> Self {
        Frame {
            entity_id: PttID::ZERO,
            msg_type,
            payload: payload.into(),
        }
    }

    pub fn is_management(&self) -> bool {
        self.entity_id.is_zero()
    }

    pub fn len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// `LengthDelimitedCodec` (u32 BE) plus the entity/type header.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, PeerError> {
        let Some(mut body) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if body.len() < HEADER_LEN {
            return Err(PeerError::Malformed(format!("frame of {} bytes", body.len())));
        }
        let mut id = [0u8; 32];
        body.copy_to_slice(&mut id);
        let msg_type = body.get_u8();
        Ok(Some(Frame {
            entity_id: PttID::from_bytes(id),
            msg_type,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PeerError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), PeerError> {
        let mut body = BytesMut::with_capacity(frame.len());
        body.put_slice(frame.entity_id.as_bytes());
        body.put_u8(frame.msg_type);
        body.put_slice(&frame.payload);
        self.inner.encode(body.freeze(), dst)?;
        Ok(())
    }
}
