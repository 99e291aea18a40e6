//! AMQP frame type and its codec

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ferrox_amqp_types::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
};
use serde::{Deserialize, Serialize};
use serde_amqp::{de::Deserializer, read::IoReader, ser::Serializer};
use tokio_util::codec::{Decoder, Encoder};

use crate::Payload;

use super::{Error, FRAME_HEADER_SIZE, FRAME_TYPE_AMQP, MIN_DOFF};

/// An AMQP frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Channel number of the frame
    pub channel: u16,

    /// Frame body
    pub body: FrameBody,
}

impl Frame {
    /// Creates a new frame
    pub fn new(channel: impl Into<u16>, body: FrameBody) -> Self {
        Self {
            channel: channel.into(),
            body,
        }
    }

    /// Channel number of the frame
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Frame body
    pub fn body(&self) -> &FrameBody {
        &self.body
    }

    /// Consumes the frame and takes the body
    pub fn into_body(self) -> FrameBody {
        self.body
    }

    /// An empty frame, used as heartbeat
    pub fn empty() -> Self {
        Self {
            channel: 0,
            body: FrameBody::Empty,
        }
    }
}

/// Body of an AMQP frame
#[derive(Clone, PartialEq)]
pub enum FrameBody {
    /// Handled by connection
    Open(Open),

    /// Handled by session
    Begin(Begin),

    /// Handled by link
    Attach(Attach),

    /// Handled by session, and by link if a handle is present
    Flow(Flow),

    /// Handled by link, after the session has done its bookkeeping
    Transfer {
        /// The transfer performative
        performative: Transfer,

        /// The message bytes following the performative
        payload: Payload,
    },

    /// Handled by session
    Disposition(Disposition),

    /// Handled by link
    Detach(Detach),

    /// Handled by session
    End(End),

    /// Handled by connection
    Close(Close),

    /// A frame without body
    Empty,
}

impl FrameBody {
    /// Wraps a performative, with the payload only kept for a Transfer
    pub fn from_performative(performative: Performative, payload: Option<Payload>) -> Self {
        match performative {
            Performative::Open(p) => FrameBody::Open(p),
            Performative::Begin(p) => FrameBody::Begin(p),
            Performative::Attach(p) => FrameBody::Attach(p),
            Performative::Flow(p) => FrameBody::Flow(p),
            Performative::Transfer(performative) => FrameBody::Transfer {
                performative,
                payload: payload.unwrap_or_default(),
            },
            Performative::Disposition(p) => FrameBody::Disposition(p),
            Performative::Detach(p) => FrameBody::Detach(p),
            Performative::End(p) => FrameBody::End(p),
            Performative::Close(p) => FrameBody::Close(p),
        }
    }

    /// Splits the body into its performative and payload
    pub fn into_parts(self) -> Option<(Performative, Option<Payload>)> {
        let parts = match self {
            FrameBody::Open(p) => (Performative::Open(p), None),
            FrameBody::Begin(p) => (Performative::Begin(p), None),
            FrameBody::Attach(p) => (Performative::Attach(p), None),
            FrameBody::Flow(p) => (Performative::Flow(p), None),
            FrameBody::Transfer {
                performative,
                payload,
            } => (Performative::Transfer(performative), Some(payload)),
            FrameBody::Disposition(p) => (Performative::Disposition(p), None),
            FrameBody::Detach(p) => (Performative::Detach(p), None),
            FrameBody::End(p) => (Performative::End(p), None),
            FrameBody::Close(p) => (Performative::Close(p), None),
            FrameBody::Empty => return None,
        };
        Some(parts)
    }

    fn serialize_performative(&self, dst: &mut BytesMut) -> Result<(), serde_amqp::Error> {
        let mut serializer = Serializer::from(dst.writer());
        match self {
            FrameBody::Open(p) => p.serialize(&mut serializer),
            FrameBody::Begin(p) => p.serialize(&mut serializer),
            FrameBody::Attach(p) => p.serialize(&mut serializer),
            FrameBody::Flow(p) => p.serialize(&mut serializer),
            FrameBody::Transfer { performative, .. } => performative.serialize(&mut serializer),
            FrameBody::Disposition(p) => p.serialize(&mut serializer),
            FrameBody::Detach(p) => p.serialize(&mut serializer),
            FrameBody::End(p) => p.serialize(&mut serializer),
            FrameBody::Close(p) => p.serialize(&mut serializer),
            FrameBody::Empty => Ok(()),
        }
    }
}

impl std::fmt::Debug for FrameBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(p) => f.debug_tuple("Open").field(p).finish(),
            Self::Begin(p) => f.debug_tuple("Begin").field(p).finish(),
            Self::Attach(p) => f.debug_tuple("Attach").field(p).finish(),
            Self::Flow(p) => f.debug_tuple("Flow").field(p).finish(),
            Self::Transfer {
                performative,
                payload,
            } => f
                .debug_struct("Transfer")
                .field("performative", performative)
                .field("payload.len", &payload.len())
                .finish(),
            Self::Disposition(p) => f.debug_tuple("Disposition").field(p).finish(),
            Self::Detach(p) => f.debug_tuple("Detach").field(p).finish(),
            Self::End(p) => f.debug_tuple("End").field(p).finish(),
            Self::Close(p) => f.debug_tuple("Close").field(p).finish(),
            Self::Empty => write!(f, "Empty"),
        }
    }
}

/// Appends one complete frame, header included, to `dst`
///
/// No size limit is applied here, see [`FrameCodec`] for that.
pub fn encode(frame: &Frame, dst: &mut BytesMut) -> Result<(), Error> {
    let start = dst.len();
    dst.put_u32(0); // patched below
    dst.put_u8(MIN_DOFF);
    dst.put_u8(FRAME_TYPE_AMQP);
    dst.put_u16(frame.channel);

    frame
        .body
        .serialize_performative(dst)
        .map_err(Error::EncodeError)?;
    if let FrameBody::Transfer { payload, .. } = &frame.body {
        dst.put_slice(payload);
    }

    let size = dst.len() - start;
    let size = u32::try_from(size).map_err(|_| Error::FramingError {
        size,
        max_frame_size: u32::MAX as usize,
    })?;
    dst[start..start + 4].copy_from_slice(&size.to_be_bytes());
    Ok(())
}

/// Decodes exactly one frame, header included, from `src`
pub fn decode(mut src: Bytes) -> Result<Frame, Error> {
    if src.len() < FRAME_HEADER_SIZE {
        return Err(Error::MalformedFrame("buffer shorter than the frame header"));
    }
    let size = src.get_u32() as usize;
    if size != src.len() + 4 {
        return Err(Error::MalformedFrame("size field does not match the frame length"));
    }
    let doff = src.get_u8();
    let ftype = src.get_u8();
    let channel = src.get_u16();

    if doff < MIN_DOFF {
        return Err(Error::MalformedFrame("data offset below the frame header size"));
    }
    if ftype != FRAME_TYPE_AMQP {
        return Err(Error::MalformedFrame("unknown frame type"));
    }
    let extended_header = doff as usize * 4 - FRAME_HEADER_SIZE;
    if extended_header > src.len() {
        return Err(Error::MalformedFrame("data offset beyond the end of the frame"));
    }
    src.advance(extended_header);

    if src.is_empty() {
        return Ok(Frame::new(channel, FrameBody::Empty));
    }

    let performative = {
        let reader = IoReader::new((&mut src).reader());
        let mut deserializer = Deserializer::new(reader);
        Performative::deserialize(&mut deserializer).map_err(Error::DecodeError)?
    };

    let body = match performative {
        Performative::Transfer(performative) => FrameBody::Transfer {
            performative,
            payload: src,
        },
        performative if src.is_empty() => FrameBody::from_performative(performative, None),
        _ => {
            return Err(Error::MalformedFrame(
                "payload following a performative other than transfer",
            ))
        }
    };
    Ok(Frame::new(channel, body))
}

/// Stream codec for AMQP frames with per-direction size limits
#[derive(Debug)]
pub struct FrameCodec {
    max_decode_frame_size: usize,
    max_encode_frame_size: usize,
}

impl FrameCodec {
    /// Creates a codec with separate inbound and outbound limits
    pub fn new(max_decode_frame_size: usize, max_encode_frame_size: usize) -> Self {
        Self {
            max_decode_frame_size,
            max_encode_frame_size,
        }
    }

    /// Largest frame accepted from the peer
    pub fn max_decode_frame_size(&self) -> usize {
        self.max_decode_frame_size
    }

    /// Largest frame the peer accepts from us
    pub fn max_encode_frame_size(&self) -> usize {
        self.max_encode_frame_size
    }

    /// Sets the inbound limit
    pub fn set_max_decode_frame_size(&mut self, size: usize) {
        self.max_decode_frame_size = size;
    }

    /// Sets the outbound limit
    pub fn set_max_encode_frame_size(&mut self, size: usize) {
        self.max_encode_frame_size = size;
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        encode(&item, dst)?;
        let size = dst.len() - start;
        if size > self.max_encode_frame_size {
            dst.truncate(start);
            return Err(Error::FramingError {
                size,
                max_frame_size: self.max_encode_frame_size,
            });
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&src[..4]);
        let size = u32::from_be_bytes(size_bytes) as usize;

        if size < FRAME_HEADER_SIZE {
            return Err(Error::MalformedFrame("size field below the frame header size"));
        }
        if size > self.max_decode_frame_size {
            return Err(Error::FramingError {
                size,
                max_frame_size: self.max_decode_frame_size,
            });
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let frame = src.split_to(size).freeze();
        decode(frame).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use ferrox_amqp_types::{
        definitions::{Error as AmqpErrorValue, Handle, LinkError},
        performatives::{Close, Detach, Transfer},
    };
    use serde_bytes::ByteBuf;
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;

    fn transfer(payload: &'static [u8]) -> Frame {
        Frame::new(
            3u16,
            FrameBody::Transfer {
                performative: Transfer {
                    handle: Handle(1),
                    delivery_id: Some(u32::MAX),
                    delivery_tag: Some(ByteBuf::from(vec![0, 0, 0, 7])),
                    message_format: Some(0),
                    settled: Some(false),
                    more: false,
                    rcv_settle_mode: None,
                    state: None,
                    resume: false,
                    aborted: false,
                    batchable: false,
                },
                payload: Bytes::from_static(payload),
            },
        )
    }

    #[test]
    fn empty_frame_is_a_bare_header() {
        let mut dst = BytesMut::new();
        encode(&Frame::empty(), &mut dst).unwrap();
        assert_eq!(&dst[..], &[0x00, 0x00, 0x00, 0x08, 0x02, 0x00, 0x00, 0x00]);

        let frame = decode(dst.freeze()).unwrap();
        assert_eq!(frame, Frame::empty());
    }

    #[test]
    fn transfer_round_trip_keeps_payload() {
        let frame = transfer(b"hello amqp");
        let mut dst = BytesMut::new();
        encode(&frame, &mut dst).unwrap();
        assert_eq!(u32::from_be_bytes([dst[0], dst[1], dst[2], dst[3]]) as usize, dst.len());

        let decoded = decode(dst.freeze()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn performative_round_trip_on_nonzero_channel() {
        let frame = Frame::new(
            42u16,
            FrameBody::Detach(Detach {
                handle: Handle(9),
                closed: true,
                error: Some(AmqpErrorValue::new(LinkError::DetachForced, None)),
            }),
        );
        let mut dst = BytesMut::new();
        encode(&frame, &mut dst).unwrap();
        assert_eq!(decode(dst.freeze()).unwrap(), frame);
    }

    #[test]
    fn size_inconsistent_with_buffer_is_malformed() {
        let mut dst = BytesMut::new();
        encode(&Frame::new(0u16, FrameBody::Close(Close { error: None })), &mut dst).unwrap();
        dst.put_u8(0xff);
        assert!(matches!(decode(dst.freeze()), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn small_data_offset_is_malformed() {
        let buf = Bytes::from_static(&[0x00, 0x00, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00]);
        assert!(matches!(decode(buf), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn unknown_frame_type_is_malformed() {
        // SASL frames are not valid once the AMQP layer runs
        let buf = Bytes::from_static(&[0x00, 0x00, 0x00, 0x08, 0x02, 0x01, 0x00, 0x00]);
        assert!(matches!(decode(buf), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn extended_header_is_skipped() {
        let buf = Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x0c, 0x03, 0x00, 0x00, 0x05, 0xde, 0xad, 0xbe, 0xef,
        ]);
        let frame = decode(buf).unwrap();
        assert_eq!(frame.channel, 5);
        assert_eq!(frame.body, FrameBody::Empty);
    }

    #[test]
    fn codec_waits_for_a_complete_frame() {
        let mut whole = BytesMut::new();
        encode(&transfer(b"partial"), &mut whole).unwrap();

        let mut codec = FrameCodec::new(512, 512);
        let mut src = BytesMut::from(&whole[..whole.len() - 3]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&whole[whole.len() - 3..]);
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame, transfer(b"partial"));
        assert!(src.is_empty());
    }

    #[test]
    fn codec_rejects_oversized_frame_before_buffering_it() {
        let mut codec = FrameCodec::new(1024, 1024);
        let mut src = BytesMut::from(&[0x00, 0x00, 0x08, 0x00, 0x02, 0x00, 0x00, 0x00][..]);
        match codec.decode(&mut src) {
            Err(Error::FramingError {
                size,
                max_frame_size,
            }) => {
                assert_eq!(size, 2048);
                assert_eq!(max_frame_size, 1024);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn codec_refuses_to_encode_oversized_frame() {
        let mut codec = FrameCodec::new(512, 512);
        let mut dst = BytesMut::new();
        let result = codec.encode(transfer(&[0u8; 600]), &mut dst);
        assert!(matches!(result, Err(Error::FramingError { .. })));
        assert!(dst.is_empty());
    }
}
