//! Frame type and the corresponding encoder and decoder
//!
//! The 0-9-1 frame layout is a 7 byte header (type octet, channel, payload
//! size), the payload, and the 0xCE end octet. Unlike a plain
//! length-delimited codec the end octet must be verified: anything else is a
//! framing error and terminates the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::{
    FRAME_BODY, FRAME_END, FRAME_HEADER, FRAME_HEARTBEAT, FRAME_METHOD, FRAME_MIN_SIZE,
    FRAME_OVERHEAD,
};
use crate::content::ContentHeader;
use crate::method::Method;
use crate::Error;

/// An AMQP 0-9-1 frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Channel the frame belongs to; 0 is the connection channel
    pub channel: u16,
    /// Decoded frame payload
    pub payload: FramePayload,
}

impl Frame {
    /// Creates a method frame
    pub fn method(channel: u16, method: Method) -> Self {
        Self {
            channel,
            payload: FramePayload::Method(method),
        }
    }

    /// Creates a content header frame
    pub fn header(channel: u16, header: ContentHeader) -> Self {
        Self {
            channel,
            payload: FramePayload::Header(header),
        }
    }

    /// Creates a content body frame
    pub fn body(channel: u16, body: Bytes) -> Self {
        Self {
            channel,
            payload: FramePayload::Body(body),
        }
    }

    /// Creates a heartbeat frame. Heartbeats only travel on channel 0
    pub fn heartbeat() -> Self {
        Self {
            channel: 0,
            payload: FramePayload::Heartbeat,
        }
    }
}

/// Decoded payload of a frame, tagged by the frame type octet
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    /// A method frame (type 1)
    Method(Method),
    /// A content header frame (type 2)
    Header(ContentHeader),
    /// A content body frame (type 3)
    Body(Bytes),
    /// A heartbeat frame (type 8)
    Heartbeat,
}

/// Encoder and decoder of AMQP 0-9-1 frames
///
/// The decoder enforces the negotiated frame-max; until tuning completes
/// the protocol minimum of 4096 applies. The encoder trusts its callers to
/// fragment bodies with [`content_frames`].
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: FRAME_MIN_SIZE as usize,
        }
    }
}

impl FrameCodec {
    /// Creates a codec bounded by `max_frame_size` (0 meaning unlimited)
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Updates the frame-max after tuning
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /// The currently enforced frame-max
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (frame_type, payload) = match item.payload {
            FramePayload::Method(method) => {
                let mut buf = BytesMut::new();
                method.encode(&mut buf);
                (FRAME_METHOD, buf.freeze())
            }
            FramePayload::Header(header) => {
                let mut buf = BytesMut::new();
                header.encode(&mut buf);
                (FRAME_HEADER, buf.freeze())
            }
            FramePayload::Body(body) => (FRAME_BODY, body),
            FramePayload::Heartbeat => (FRAME_HEARTBEAT, Bytes::new()),
        };

        dst.reserve(payload.len() + FRAME_OVERHEAD);
        dst.put_u8(frame_type);
        dst.put_u16(item.channel);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 7 {
            return Ok(None);
        }

        let payload_size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
        if self.max_frame_size > 0 && payload_size + FRAME_OVERHEAD > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: payload_size + FRAME_OVERHEAD,
                max: self.max_frame_size,
            });
        }

        let total = 7 + payload_size + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame_type = src.get_u8();
        let channel = src.get_u16();
        let _size = src.get_u32();
        let mut payload = src.split_to(payload_size).freeze();
        let end = src.get_u8();
        if end != FRAME_END {
            return Err(Error::InvalidFrameEnd(end));
        }

        let payload = match frame_type {
            FRAME_METHOD => FramePayload::Method(Method::decode(&mut payload)?),
            FRAME_HEADER => FramePayload::Header(ContentHeader::decode(&mut payload)?),
            FRAME_BODY => FramePayload::Body(payload),
            FRAME_HEARTBEAT => FramePayload::Heartbeat,
            other => return Err(Error::UnknownFrameType(other)),
        };

        Ok(Some(Frame { channel, payload }))
    }
}

/// Fragments a content header and body into HEADER and BODY frames
///
/// Each BODY frame carries at most `frame_max - 8` octets so the whole
/// frame, overhead included, stays within the negotiated frame-max. A
/// `frame_max` of 0 means unlimited and produces a single BODY frame.
pub fn content_frames(
    channel: u16,
    header: ContentHeader,
    body: Bytes,
    frame_max: usize,
) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(2);
    frames.push(Frame::header(channel, header));

    if body.is_empty() {
        return frames;
    }

    let chunk = if frame_max == 0 {
        body.len()
    } else {
        frame_max - FRAME_OVERHEAD
    };
    let mut rest = body;
    while !rest.is_empty() {
        let take = chunk.min(rest.len());
        frames.push(Frame::body(channel, rest.split_to(take)));
    }
    frames
}
