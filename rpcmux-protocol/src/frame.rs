//! Binary frame format.
//!
//! Frame layout (12 bytes header + payload, network byte order):
//!
//! ```text
//! +-----------+--------+--------+----------+-------------+
//! | stream_id |  kind  | flags  | reserved | payload_len |
//! |  4 bytes  | 1 byte | 1 byte | 2 bytes  |   4 bytes   |
//! +-----------+--------+--------+----------+-------------+
//! | payload                                              |
//! | payload_len bytes                                    |
//! +------------------------------------------------------+
//! ```
//!
//! Stream id 0 is the control stream. It carries `Ping`, `Close` (the peer is
//! draining) and `Error` (connection-level failure). Every other kind needs a
//! non-zero stream id.

use crate::error::ProtocolError;
use crate::message::{OpenRequest, ResetReason};
use crate::{CONTROL_STREAM_ID, DEFAULT_MAX_PAYLOAD_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes (4+1+1+2+4 = 12).
pub const FRAME_HEADER_SIZE: usize = 12;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Opens a stream; payload is a JSON [`OpenRequest`].
    Open = 0,
    /// Carries (a chunk of) one logical message.
    Data = 1,
    /// Sender has no more data for this stream.
    HalfClose = 2,
    /// Sender closes the stream in both directions. On stream 0: go away.
    Close = 3,
    /// Stream reset; payload is a JSON [`ResetReason`]. On stream 0: fatal.
    Error = 4,
    /// Connection liveness check, stream 0 only.
    Ping = 5,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Open),
            1 => Some(Self::Data),
            2 => Some(Self::HalfClose),
            3 => Some(Self::Close),
            4 => Some(Self::Error),
            5 => Some(Self::Ping),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Data => "DATA",
            Self::HalfClose => "HALF_CLOSE",
            Self::Close => "CLOSE",
            Self::Error => "ERROR",
            Self::Ping => "PING",
        }
    }

    /// Returns whether this kind may appear on the given stream id.
    pub fn allowed_on(&self, stream_id: u32) -> bool {
        if stream_id == CONTROL_STREAM_ID {
            matches!(self, Self::Ping | Self::Close | Self::Error)
        } else {
            !matches!(self, Self::Ping)
        }
    }
}

/// Frame flags bitfield.
///
/// Bits without a meaning in this version are carried through untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Last payload from this sender on the stream.
    pub const FINAL_PAYLOAD: u8 = 1 << 0;
    /// The reset was requested by the application (cancellation).
    pub const CANCEL: u8 = 1 << 1;
    /// A receiver that does not know this frame kind may skip it.
    pub const IGNORABLE: u8 = 1 << 2;
    /// The logical message continues in the next Data frame.
    pub const CONTINUED: u8 = 1 << 3;
    /// Ping acknowledgement.
    pub const ACK: u8 = 1 << 4;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn with_final(mut self) -> Self {
        self.0 |= Self::FINAL_PAYLOAD;
        self
    }

    pub fn with_cancel(mut self) -> Self {
        self.0 |= Self::CANCEL;
        self
    }

    pub fn with_ignorable(mut self) -> Self {
        self.0 |= Self::IGNORABLE;
        self
    }

    pub fn with_continued(mut self) -> Self {
        self.0 |= Self::CONTINUED;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn is_final(&self) -> bool {
        self.0 & Self::FINAL_PAYLOAD != 0
    }

    pub fn is_cancel(&self) -> bool {
        self.0 & Self::CANCEL != 0
    }

    pub fn is_ignorable(&self) -> bool {
        self.0 & Self::IGNORABLE != 0
    }

    pub fn is_continued(&self) -> bool {
        self.0 & Self::CONTINUED != 0
    }

    pub fn is_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }
}

/// Raw frame header, before the kind byte is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_id: u32,
    pub kind: u8,
    pub flags: FrameFlags,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Parses a header from the front of `buf` without consuming it.
    ///
    /// Returns `None` if fewer than [`FRAME_HEADER_SIZE`] bytes are available.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(Self {
            stream_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            kind: buf[4],
            flags: FrameFlags::from_bits(buf[5]),
            // buf[6..8] is reserved
            payload_len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u32(self.stream_id);
        dst.put_u8(self.kind);
        dst.put_u8(self.flags.bits());
        dst.put_u16(0);
        dst.put_u32(self.payload_len);
    }

    /// Total encoded size of the frame this header describes.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload_len as usize
    }
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, kind: FrameKind, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind,
            flags,
            payload,
        }
    }

    /// Creates an Open frame for the given operation.
    pub fn open(stream_id: u32, request: &OpenRequest) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(request)?;
        Ok(Self::new(
            stream_id,
            FrameKind::Open,
            FrameFlags::new(),
            Bytes::from(payload),
        ))
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(stream_id, FrameKind::Data, FrameFlags::new(), payload)
    }

    pub fn data_final(stream_id: u32, payload: Bytes) -> Self {
        Self::new(
            stream_id,
            FrameKind::Data,
            FrameFlags::new().with_final(),
            payload,
        )
    }

    pub fn half_close(stream_id: u32) -> Self {
        Self::new(stream_id, FrameKind::HalfClose, FrameFlags::new(), Bytes::new())
    }

    pub fn close(stream_id: u32) -> Self {
        Self::new(stream_id, FrameKind::Close, FrameFlags::new(), Bytes::new())
    }

    /// Creates an Error frame resetting the stream.
    pub fn error(stream_id: u32, reason: &ResetReason) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(reason)?;
        let mut flags = FrameFlags::new();
        if reason.code == crate::ErrorCode::Cancelled {
            flags = flags.with_cancel();
        }
        Ok(Self::new(
            stream_id,
            FrameKind::Error,
            flags,
            Bytes::from(payload),
        ))
    }

    /// Creates a Ping on the control stream carrying an 8-byte nonce.
    pub fn ping(nonce: u64) -> Self {
        Self::new(
            CONTROL_STREAM_ID,
            FrameKind::Ping,
            FrameFlags::new(),
            Bytes::copy_from_slice(&nonce.to_be_bytes()),
        )
    }

    /// Creates the acknowledgement for a received Ping.
    pub fn pong(ping: &Frame) -> Self {
        Self::new(
            CONTROL_STREAM_ID,
            FrameKind::Ping,
            FrameFlags::new().with_ack(),
            ping.payload.clone(),
        )
    }

    /// Creates a go-away notice: the sender accepts no new streams.
    pub fn go_away() -> Self {
        Self::close(CONTROL_STREAM_ID)
    }

    /// Returns the Ping nonce, if this is a well-formed Ping.
    pub fn ping_nonce(&self) -> Option<u64> {
        if self.kind != FrameKind::Ping {
            return None;
        }
        let bytes: [u8; 8] = self.payload.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Parses the Open-frame payload.
    pub fn open_request(&self) -> Result<OpenRequest, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|source| ProtocolError::MalformedPayload {
            what: "OPEN",
            source,
        })
    }

    /// Parses the Error-frame payload.
    pub fn reset_reason(&self) -> Result<ResetReason, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|source| ProtocolError::MalformedPayload {
            what: "ERROR",
            source,
        })
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            stream_id: self.stream_id,
            kind: self.kind as u8,
            flags: self.flags,
            payload_len: self.payload.len() as u32,
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encodes the frame into a fresh buffer using the default payload limit.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.encode_to(&mut buf, DEFAULT_MAX_PAYLOAD_SIZE)?;
        Ok(buf)
    }

    /// Appends the encoded frame to `dst`.
    pub fn encode_to(&self, dst: &mut BytesMut, max_payload: u32) -> Result<(), ProtocolError> {
        if self.payload.len() > max_payload as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
                max: max_payload,
            });
        }
        if !self.kind.allowed_on(self.stream_id) {
            return Err(ProtocolError::InvalidStreamId {
                kind: self.kind.as_str(),
                stream_id: self.stream_id,
            });
        }

        dst.reserve(self.wire_size());
        self.header().write(dst);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded and consumed,
    /// `Ok(None)` if more data is needed (nothing is consumed), or `Err` on a
    /// protocol violation. Unknown kinds flagged ignorable are consumed and
    /// skipped.
    pub fn decode(buf: &mut BytesMut, max_payload: u32) -> Result<Option<Self>, ProtocolError> {
        loop {
            let header = match FrameHeader::parse(buf) {
                Some(header) => header,
                None => return Ok(None),
            };

            if header.payload_len > max_payload {
                return Err(ProtocolError::FrameTooLarge {
                    size: header.payload_len,
                    max: max_payload,
                });
            }

            let kind = match FrameKind::from_u8(header.kind) {
                Some(kind) => Some(kind),
                None if header.flags.is_ignorable() => None,
                None => return Err(ProtocolError::UnknownFrameKind(header.kind)),
            };

            if let Some(kind) = kind {
                if !kind.allowed_on(header.stream_id) {
                    return Err(ProtocolError::InvalidStreamId {
                        kind: kind.as_str(),
                        stream_id: header.stream_id,
                    });
                }
            }

            if buf.len() < header.frame_len() {
                return Ok(None);
            }

            buf.advance(FRAME_HEADER_SIZE);
            let payload = buf.split_to(header.payload_len as usize).freeze();

            match kind {
                Some(kind) => {
                    return Ok(Some(Self {
                        stream_id: header.stream_id,
                        kind,
                        flags: header.flags,
                        payload,
                    }))
                }
                // Ignorable frame of a kind this version does not know.
                None => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;
    use proptest::prelude::*;

    const MAX: u32 = 1024;

    fn kind_strategy() -> impl Strategy<Value = FrameKind> {
        prop_oneof![
            Just(FrameKind::Open),
            Just(FrameKind::Data),
            Just(FrameKind::HalfClose),
            Just(FrameKind::Close),
            Just(FrameKind::Error),
        ]
    }

    fn stream_frame_strategy() -> impl Strategy<Value = Frame> {
        (
            1u32..=u32::MAX,
            kind_strategy(),
            any::<u8>(),
            proptest::collection::vec(any::<u8>(), 0..=MAX as usize),
        )
            .prop_map(|(id, kind, flags, payload)| {
                Frame::new(id, kind, FrameFlags::from_bits(flags), Bytes::from(payload))
            })
    }

    fn control_frame_strategy() -> impl Strategy<Value = Frame> {
        prop_oneof![
            any::<u64>().prop_map(Frame::ping),
            any::<u64>().prop_map(|nonce| Frame::pong(&Frame::ping(nonce))),
            Just(Frame::go_away()),
            ".{0,64}".prop_map(|message| {
                Frame::error(
                    CONTROL_STREAM_ID,
                    &ResetReason::new(ErrorCode::ShuttingDown, message),
                )
                .unwrap()
            }),
            (
                prop_oneof![Just(FrameKind::Ping), Just(FrameKind::Close), Just(FrameKind::Error)],
                any::<u8>(),
                proptest::collection::vec(any::<u8>(), 0..=64),
            )
                .prop_map(|(kind, flags, payload)| {
                    Frame::new(
                        CONTROL_STREAM_ID,
                        kind,
                        FrameFlags::from_bits(flags),
                        Bytes::from(payload),
                    )
                }),
        ]
    }

    fn frame_strategy() -> impl Strategy<Value = Frame> {
        prop_oneof![stream_frame_strategy(), control_frame_strategy()]
    }

    proptest! {
        #[test]
        fn prop_frame_roundtrip(frame in frame_strategy()) {
            let mut buf = BytesMut::new();
            frame.encode_to(&mut buf, MAX).unwrap();
            let decoded = Frame::decode(&mut buf, MAX).unwrap().unwrap();
            prop_assert_eq!(decoded, frame);
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_oversized_payload_rejected(extra in 1u32..4096, id in 1u32..1000) {
            let mut buf = BytesMut::new();
            FrameHeader {
                stream_id: id,
                kind: FrameKind::Data as u8,
                flags: FrameFlags::new(),
                payload_len: MAX + extra,
            }
            .write(&mut buf);
            // Even with the full payload present nothing is yielded.
            buf.extend_from_slice(&vec![0u8; (MAX + extra) as usize]);
            let result = Frame::decode(&mut buf, MAX);
            let is_too_large = matches!(result, Err(ProtocolError::FrameTooLarge { .. }));
            prop_assert!(is_too_large);
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(
            0x01020304,
            FrameKind::Data,
            FrameFlags::new().with_final(),
            Bytes::from_static(b"hi"),
        );
        let encoded = frame.encode().unwrap();
        assert_eq!(
            &encoded[..],
            &[0x01, 0x02, 0x03, 0x04, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, b'h', b'i']
        );
    }

    #[test]
    fn test_incomplete_header() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 1][..]);
        assert!(Frame::decode(&mut buf, MAX).unwrap().is_none());
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_incomplete_payload_is_retained() {
        let frame = Frame::data(1, Bytes::from_static(b"payload"));
        let encoded = frame.encode().unwrap();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 2]);
        assert!(Frame::decode(&mut buf, MAX).unwrap().is_none());
        assert_eq!(buf.len(), encoded.len() - 2);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = BytesMut::new();
        FrameHeader {
            stream_id: 1,
            kind: 0x42,
            flags: FrameFlags::new(),
            payload_len: 0,
        }
        .write(&mut buf);
        assert!(matches!(
            Frame::decode(&mut buf, MAX),
            Err(ProtocolError::UnknownFrameKind(0x42))
        ));
    }

    #[test]
    fn test_unknown_ignorable_kind_skipped() {
        let mut buf = BytesMut::new();
        FrameHeader {
            stream_id: 1,
            kind: 0x42,
            flags: FrameFlags::new().with_ignorable(),
            payload_len: 3,
        }
        .write(&mut buf);
        buf.extend_from_slice(b"xyz");
        Frame::data(1, Bytes::from_static(b"next"))
            .encode_to(&mut buf, MAX)
            .unwrap();

        let decoded = Frame::decode(&mut buf, MAX).unwrap().unwrap();
        assert_eq!(decoded.kind, FrameKind::Data);
        assert_eq!(decoded.payload.as_ref(), b"next");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ping_on_stream_rejected() {
        let mut buf = BytesMut::new();
        FrameHeader {
            stream_id: 5,
            kind: FrameKind::Ping as u8,
            flags: FrameFlags::new(),
            payload_len: 0,
        }
        .write(&mut buf);
        assert!(matches!(
            Frame::decode(&mut buf, MAX),
            Err(ProtocolError::InvalidStreamId { stream_id: 5, .. })
        ));
    }

    #[test]
    fn test_data_on_control_stream_rejected() {
        let frame = Frame::data(0, Bytes::new());
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::InvalidStreamId { stream_id: 0, .. })
        ));
    }

    #[test]
    fn test_encode_too_large() {
        let frame = Frame::data(1, Bytes::from(vec![0u8; MAX as usize + 1]));
        let mut buf = BytesMut::new();
        assert!(matches!(
            frame.encode_to(&mut buf, MAX),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reserved_bits_ignored() {
        let mut encoded = Frame::half_close(9).encode().unwrap();
        encoded[6] = 0xAB;
        encoded[7] = 0xCD;
        let decoded = Frame::decode(&mut encoded, MAX).unwrap().unwrap();
        assert_eq!(decoded, Frame::half_close(9));
    }

    #[test]
    fn test_ping_pong() {
        let ping = Frame::ping(0xDEAD_BEEF);
        assert_eq!(ping.ping_nonce(), Some(0xDEAD_BEEF));
        let pong = Frame::pong(&ping);
        assert!(pong.flags.is_ack());
        assert_eq!(pong.ping_nonce(), Some(0xDEAD_BEEF));
    }

    #[test]
    fn test_open_and_error_payloads() {
        let open = Frame::open(3, &OpenRequest::new("calc.add")).unwrap();
        assert_eq!(open.open_request().unwrap().op, "calc.add");

        let reason = ResetReason::new(ErrorCode::Cancelled, "client went away");
        let err = Frame::error(3, &reason).unwrap();
        assert!(err.flags.is_cancel());
        assert_eq!(err.reset_reason().unwrap(), reason);

        let bad = Frame::data(3, Bytes::from_static(b"not json"));
        assert!(matches!(
            bad.open_request(),
            Err(ProtocolError::MalformedPayload { what: "OPEN", .. })
        ));
    }

    #[test]
    fn test_flags() {
        let flags = FrameFlags::new().with_final().with_continued();
        assert!(flags.is_final());
        assert!(flags.is_continued());
        assert!(!flags.is_cancel());
        assert!(!flags.is_ack());
        // Unknown bits survive
        assert_eq!(FrameFlags::from_bits(0x80).bits(), 0x80);
    }
}
