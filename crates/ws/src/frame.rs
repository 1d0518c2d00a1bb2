//! WebSocket frames, RFC 6455 section 5.2.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Extended payload length continued, if payload len == 127  |
//! +-------------------------------+-------------------------------+
//! |                               | Masking-key, if MASK set to 1 |
//! +-------------------------------+-------------------------------+
//! |   Masking-key (continued)     |          Payload Data         |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! Incoming frames are read by [`FrameReader`] one field at a time straight from a
//! [`ReadStream`]; outgoing frames are serialized into the write buffer by [`FrameEncoder`].

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use gale_http::iostream::ReadStream;
use tokio_util::codec::Encoder;
use tracing::trace;

use crate::WebSocketError;
use crate::mask::{apply_mask, generate_mask};

const FIN: u8 = 0x80;
const RSV1: u8 = 0x40;
const RSV_MASK: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0f;
const MASK_BIT: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7f;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// `Close`, `Ping` and `Pong`: never fragmented, at most 125 bytes of payload.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Opcodes that may start a message.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xa => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(opcode: OpCode) -> Self {
        match opcode {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
        }
    }
}

/// Status code carried by a close frame, RFC 6455 section 7.4.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: Self = Self(1000);
    pub const GOING_AWAY: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    pub const INVALID_PAYLOAD: Self = Self(1007);
    pub const POLICY_VIOLATION: Self = Self(1008);
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    pub const INTERNAL_ERROR: Self = Self(1011);

    /// Whether a peer may put this code in a close frame. 1005, 1006 and 1015 are reserved for
    /// local reporting, 3000-4999 belong to libraries and applications.
    pub fn is_sendable(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.0
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which end of the connection this is. Clients mask what they send, servers never do.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn masks_outgoing(self) -> bool {
        self == Self::Client
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    /// Marks the first frame of a compressed message.
    pub rsv1: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

/// A frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, rsv1: bool, payload: Bytes) -> Self {
        let header = FrameHeader { fin, rsv1, opcode, mask: None, payload_len: payload.len() as u64 };
        Self { header, payload }
    }

    pub fn ping(payload: Bytes) -> Self {
        Self::new(true, OpCode::Ping, false, payload)
    }

    pub fn pong(payload: Bytes) -> Self {
        Self::new(true, OpCode::Pong, false, payload)
    }

    /// A close frame. A reason without a code is sent with [`CloseCode::NORMAL`]; the reason is
    /// cut at a character boundary so the payload fits a control frame.
    pub fn close(code: Option<CloseCode>, reason: Option<&str>) -> Self {
        let code = match (code, reason) {
            (None, Some(_)) => Some(CloseCode::NORMAL),
            (code, _) => code,
        };
        let mut payload = BytesMut::new();
        if let Some(code) = code {
            payload.put_u16(code.0);
            if let Some(reason) = reason {
                let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
                while !reason.is_char_boundary(end) {
                    end -= 1;
                }
                payload.put_slice(&reason.as_bytes()[..end]);
            }
        }
        Self::new(true, OpCode::Close, false, payload.freeze())
    }
}

/// Serializes frames, masking them with a fresh random key when sent by a client.
#[derive(Debug, Copy, Clone)]
pub struct FrameEncoder {
    mask_outgoing: bool,
}

impl FrameEncoder {
    pub fn new(role: Role) -> Self {
        Self { mask_outgoing: role.masks_outgoing() }
    }
}

impl Encoder<Frame> for FrameEncoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = frame.header;
        let len = frame.payload.len();
        dst.reserve(len + 14);

        let mut first = u8::from(header.opcode);
        if header.fin {
            first |= FIN;
        }
        if header.rsv1 {
            first |= RSV1;
        }
        dst.put_u8(first);

        let mask_bit = if self.mask_outgoing { MASK_BIT } else { 0 };
        match (u8::try_from(len), u16::try_from(len)) {
            (Ok(short), _) if short < 126 => dst.put_u8(mask_bit | short),
            (_, Ok(medium)) => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(medium);
            }
            _ => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(len as u64);
            }
        }

        if self.mask_outgoing {
            let mask = generate_mask();
            dst.put_slice(&mask);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], mask);
        } else {
            dst.put_slice(&frame.payload);
        }
        trace!(opcode = ?header.opcode, len, "frame encoded");
        Ok(())
    }
}

#[derive(Debug, Copy, Clone)]
enum ReadStep {
    Start,
    Length { header: FrameHeader, width: usize },
    Mask { header: FrameHeader },
    Payload { header: FrameHeader },
}

/// Reads frames field by field: two header bytes, the extended length, the masking key, then
/// the payload. Each field is a single exact-size read and progress is kept between calls, so
/// a `read_frame` future dropped mid-frame resumes where it stopped on the next call.
#[derive(Debug)]
pub struct FrameReader {
    role: Role,
    compression: bool,
    max_payload: usize,
    step: ReadStep,
    wire_bytes: u64,
}

impl FrameReader {
    pub fn new(role: Role, compression: bool, max_payload: usize) -> Self {
        Self { role, compression, max_payload, step: ReadStep::Start, wire_bytes: 0 }
    }

    /// Bytes consumed from the wire so far, headers included.
    pub fn wire_bytes(&self) -> u64 {
        self.wire_bytes
    }

    pub async fn read_frame(&mut self, stream: &mut ReadStream) -> Result<Frame, WebSocketError> {
        loop {
            match self.step {
                ReadStep::Start => {
                    let head = stream.read_bytes(2).await?;
                    self.wire_bytes += 2;
                    let (header, length) = self.parse_head(head[0], head[1])?;
                    self.step = match length {
                        126 => ReadStep::Length { header, width: 2 },
                        127 => ReadStep::Length { header, width: 8 },
                        length => self.after_length(FrameHeader { payload_len: u64::from(length), ..header })?,
                    };
                }
                ReadStep::Length { mut header, width } => {
                    let bytes = stream.read_bytes(width).await?;
                    self.wire_bytes += width as u64;
                    header.payload_len = bytes.iter().fold(0u64, |len, byte| (len << 8) | u64::from(*byte));
                    self.step = self.after_length(header)?;
                }
                ReadStep::Mask { mut header } => {
                    let key = stream.read_bytes(4).await?;
                    self.wire_bytes += 4;
                    header.mask = Some([key[0], key[1], key[2], key[3]]);
                    self.step = ReadStep::Payload { header };
                }
                ReadStep::Payload { header } => {
                    // bounded by max_payload in after_length
                    let len = usize::try_from(header.payload_len).unwrap_or(usize::MAX);
                    let payload = stream.read_bytes(len).await?;
                    self.wire_bytes += header.payload_len;
                    self.step = ReadStep::Start;

                    let payload = match header.mask {
                        Some(mask) => {
                            let mut payload = BytesMut::from(payload);
                            apply_mask(&mut payload, mask);
                            payload.freeze()
                        }
                        None => payload,
                    };
                    trace!(opcode = ?header.opcode, fin = header.fin, len, "frame received");
                    return Ok(Frame { header, payload });
                }
            }
        }
    }

    fn parse_head(&self, first: u8, second: u8) -> Result<(FrameHeader, u8), WebSocketError> {
        let opcode = OpCode::try_from(first & OPCODE_MASK)?;
        let fin = first & FIN != 0;

        let allowed = if self.compression && opcode.is_data() { RSV1 } else { 0 };
        let reserved = first & RSV_MASK;
        if reserved & !allowed != 0 {
            return Err(WebSocketError::ReservedBits(reserved >> 4));
        }

        let length = second & LENGTH_MASK;
        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::FragmentedControlFrame);
            }
            if usize::from(length) > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge(u64::from(length)));
            }
        }

        let masked = second & MASK_BIT != 0;
        match self.role {
            Role::Server if !masked => return Err(WebSocketError::UnmaskedFrame),
            Role::Client if masked => return Err(WebSocketError::MaskedFrame),
            _ => {}
        }

        let header = FrameHeader { fin, rsv1: reserved & RSV1 != 0, opcode, mask: None, payload_len: 0 };
        Ok((header, length))
    }

    fn after_length(&self, header: FrameHeader) -> Result<ReadStep, WebSocketError> {
        if header.payload_len > self.max_payload as u64 {
            return Err(WebSocketError::MessageTooBig { size: header.payload_len, max_size: self.max_payload });
        }
        Ok(match self.role {
            Role::Server => ReadStep::Mask { header },
            Role::Client => ReadStep::Payload { header },
        })
    }
}

#[cfg(test)]
mod tests {
    use gale_http::iostream::{IoStream, StreamConfig};
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn encode(role: Role, frame: Frame) -> BytesMut {
        let mut dst = BytesMut::new();
        FrameEncoder::new(role).encode(frame, &mut dst).unwrap();
        dst
    }

    fn reader_stream(bytes: &[u8]) -> ReadStream {
        let (local, mut peer) = tokio::io::duplex(1024 * 1024);
        let bytes = bytes.to_vec();
        tokio::spawn(async move {
            peer.write_all(&bytes).await.unwrap();
            // keep the peer open until the test is done reading
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });
        IoStream::new(local, StreamConfig::default()).split().0
    }

    #[test]
    fn server_frames_are_unmasked() {
        let wire = encode(Role::Server, Frame::new(true, OpCode::Text, false, Bytes::from_static(b"hi")));
        assert_eq!(&wire[..], &[0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn client_frames_are_masked() {
        let wire = encode(Role::Client, Frame::new(true, OpCode::Binary, false, Bytes::from_static(b"abcd")));
        assert_eq!(wire[0], 0x82);
        assert_eq!(wire[1], MASK_BIT | 4);
        let mask = [wire[2], wire[3], wire[4], wire[5]];
        let mut payload = wire[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(payload, b"abcd");
    }

    #[test]
    fn extended_lengths() {
        let wire = encode(Role::Server, Frame::new(true, OpCode::Binary, false, Bytes::from(vec![0; 126])));
        assert_eq!(&wire[..4], &[0x82, 126, 0, 126]);

        let wire = encode(Role::Server, Frame::new(true, OpCode::Binary, false, Bytes::from(vec![0; 65536])));
        assert_eq!(&wire[..10], &[0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn close_frame_defaults_code_for_a_reason() {
        let frame = Frame::close(None, Some("bye"));
        assert_eq!(&frame.payload[..], b"\x03\xe8bye");
        assert!(Frame::close(None, None).payload.is_empty());

        let long = "é".repeat(100);
        let frame = Frame::close(Some(CloseCode::GOING_AWAY), Some(&long));
        assert!(frame.payload.len() <= MAX_CONTROL_PAYLOAD);
        assert!(std::str::from_utf8(&frame.payload[2..]).is_ok());
    }

    #[tokio::test]
    async fn reads_masked_client_frame() {
        let wire = encode(Role::Client, Frame::new(true, OpCode::Text, false, Bytes::from_static(b"Hello")));
        let mut stream = reader_stream(&wire);

        let mut reader = FrameReader::new(Role::Server, false, 1024);
        let frame = reader.read_frame(&mut stream).await.unwrap();
        assert_eq!(frame.header.opcode, OpCode::Text);
        assert!(frame.header.fin);
        assert_eq!(&frame.payload[..], b"Hello");
        assert_eq!(reader.wire_bytes(), wire.len() as u64);
    }

    #[tokio::test]
    async fn reads_64bit_length() {
        let payload = Bytes::from(vec![7; 70_000]);
        let wire = encode(Role::Server, Frame::new(true, OpCode::Binary, false, payload.clone()));
        let mut stream = reader_stream(&wire);

        let mut reader = FrameReader::new(Role::Client, false, 1024 * 1024);
        let frame = reader.read_frame(&mut stream).await.unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[tokio::test]
    async fn server_rejects_unmasked_frames() {
        let mut stream = reader_stream(&[0x81, 0x00]);
        let mut reader = FrameReader::new(Role::Server, false, 1024);
        assert!(matches!(reader.read_frame(&mut stream).await, Err(WebSocketError::UnmaskedFrame)));
    }

    #[tokio::test]
    async fn client_rejects_masked_frames() {
        let mut stream = reader_stream(&[0x81, 0x80, 0, 0, 0, 0]);
        let mut reader = FrameReader::new(Role::Client, false, 1024);
        assert!(matches!(reader.read_frame(&mut stream).await, Err(WebSocketError::MaskedFrame)));
    }

    #[tokio::test]
    async fn rsv1_needs_compression() {
        let mut stream = reader_stream(&[0xc1, 0x00, 0xc1, 0x00]);
        let mut reader = FrameReader::new(Role::Client, false, 1024);
        assert!(matches!(reader.read_frame(&mut stream).await, Err(WebSocketError::ReservedBits(0b100))));

        let mut reader = FrameReader::new(Role::Client, true, 1024);
        assert!(reader.read_frame(&mut stream).await.unwrap().header.rsv1);
    }

    #[tokio::test]
    async fn control_frame_rules() {
        let mut stream = reader_stream(&[0x09, 0x00]);
        let mut reader = FrameReader::new(Role::Client, false, 1024);
        assert!(matches!(reader.read_frame(&mut stream).await, Err(WebSocketError::FragmentedControlFrame)));

        let mut stream = reader_stream(&[0x89, 126, 0, 126]);
        let mut reader = FrameReader::new(Role::Client, false, 1024);
        assert!(matches!(reader.read_frame(&mut stream).await, Err(WebSocketError::ControlFrameTooLarge(126))));
    }

    #[tokio::test]
    async fn unknown_opcode() {
        let mut stream = reader_stream(&[0x83, 0x00]);
        let mut reader = FrameReader::new(Role::Client, false, 1024);
        assert!(matches!(reader.read_frame(&mut stream).await, Err(WebSocketError::InvalidOpCode(3))));
    }

    #[tokio::test]
    async fn oversized_frame_is_refused_before_reading_it() {
        let mut stream = reader_stream(&[0x82, 127, 0, 0, 0, 1, 0, 0, 0, 0]);
        let mut reader = FrameReader::new(Role::Client, false, 1024);
        let err = reader.read_frame(&mut stream).await.unwrap_err();
        assert!(matches!(err, WebSocketError::MessageTooBig { size: 0x1_0000_0000, max_size: 1024 }));
    }

    #[tokio::test]
    async fn resumes_after_a_dropped_read() {
        let (local, mut peer) = tokio::io::duplex(1024);
        let mut stream = IoStream::new(local, StreamConfig::default()).split().0;
        let mut reader = FrameReader::new(Role::Client, false, 1024);

        peer.write_all(&[0x82, 126, 0, 3]).await.unwrap();
        let pending = tokio::time::timeout(std::time::Duration::from_millis(50), reader.read_frame(&mut stream)).await;
        assert!(pending.is_err());

        peer.write_all(b"abc").await.unwrap();
        let frame = reader.read_frame(&mut stream).await.unwrap();
        assert_eq!(&frame.payload[..], b"abc");
    }
}
