use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use super::commands::min_payload_len;


pub const FRAME_START: u8 = 0xfc;

/// Fixed bytes after the packet type. Every known unit sends these.
const FRAME_HEADER: [u8; 2] = [0x01, 0x30];

/// start, type, header[2], length
pub const HEADER_LEN: usize = 5;
const CHECKSUM_LEN: usize = 1;

/// Known payloads are at most 16 bytes. Anything declaring much more is
/// treated as noise rather than waited for.
pub const MAX_PAYLOAD_LEN: usize = 0x20;


#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(packet_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// Size of the frame on the wire.
    pub fn len(&self) -> usize {
        HEADER_LEN + self.payload.len() + CHECKSUM_LEN
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FramingError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FramingError::LengthOutOfRange(self.payload.len()))
        }

        dst.reserve(self.len());

        let start = dst.len();

        dst.put_u8(FRAME_START);
        dst.put_u8(self.packet_type);
        dst.put_slice(&FRAME_HEADER);
        dst.put_u8(self.payload.len() as u8);
        dst.put_slice(&self.payload);

        let checksum = dst[start..].iter().checksum();
        dst.put_u8(checksum);

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, FramingError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}


trait Checksum {
    fn checksum(&mut self) -> u8;
}

impl <'a>Checksum for std::slice::Iter<'a, u8> {
    /// `0xfc` minus the byte sum, all mod 256
    fn checksum(&mut self) -> u8 {
        let sum = self.fold(0u8, |acc, byte| acc.wrapping_add(*byte));
        FRAME_START.wrapping_sub(sum)
    }
}

/// Checksum over everything from the start byte to the end of the payload.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().checksum()
}


#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("start of frame marker not found")]
    BadStartByte,
    #[error("declared payload length {0} out of range")]
    LengthOutOfRange(usize),
    #[error("frame is {actual} bytes but its header declares {expected}")]
    LengthMismatch {
        expected: usize,
        actual: usize,
    },
    #[error("invalid checksum (expected {expected:x}, actual: {actual:x})")]
    InvalidChecksum {
        expected: u8,
        actual: u8,
    },
    #[error("payload of packet type {packet_type:#04x} too short ({len} < {min})")]
    PayloadTooShort {
        packet_type: u8,
        len: usize,
        min: usize,
    },
}


/// Check a single, complete raw frame.
pub fn validate(raw: &[u8]) -> Result<Frame, FramingError> {
    let [start, packet_type, _, _, length, ..] = raw else {
        return Err(FramingError::LengthMismatch { expected: HEADER_LEN + CHECKSUM_LEN, actual: raw.len() })
    };

    if *start != FRAME_START {
        return Err(FramingError::BadStartByte)
    }

    let length = *length as usize;
    if length > MAX_PAYLOAD_LEN {
        return Err(FramingError::LengthOutOfRange(length))
    }

    let size = HEADER_LEN + length + CHECKSUM_LEN;
    if raw.len() != size {
        return Err(FramingError::LengthMismatch { expected: size, actual: raw.len() })
    }

    let (body, footer) = raw.split_at(size - CHECKSUM_LEN);

    let expected = body.iter().checksum();
    let actual = footer[0];
    if expected != actual {
        return Err(FramingError::InvalidChecksum { expected, actual })
    }

    let min = min_payload_len(*packet_type);
    if length < min {
        return Err(FramingError::PayloadTooShort { packet_type: *packet_type, len: length, min })
    }

    Ok(Frame {
        packet_type: *packet_type,
        payload: Bytes::copy_from_slice(&body[HEADER_LEN..]),
    })
}


#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// Not enough bytes yet. The candidate frame is left in the buffer.
    Incomplete,
    /// The candidate frame was rejected and its start byte consumed.
    Invalid(FramingError),
}

/// Pull the next frame off the front of `src`.
///
/// Junk before a start byte is dropped. A rejected candidate only costs its
/// start byte, so a genuine frame that begins inside it is still found.
pub fn decode_next(src: &mut BytesMut) -> Decoded {
    match src.iter().position(|byte| *byte == FRAME_START) {
        Some(0) => {},
        Some(skip) => {
            trace!(skip, "dropping bytes before frame start");
            src.advance(skip);
        },
        None => {
            if !src.is_empty() {
                trace!(skip = src.len(), "no frame start in buffer");
                src.clear();
            }
            return Decoded::Incomplete
        }
    }

    if src.len() < HEADER_LEN {
        return Decoded::Incomplete
    }

    let length = src[HEADER_LEN - 1] as usize;
    if length > MAX_PAYLOAD_LEN {
        src.advance(1);
        return Decoded::Invalid(FramingError::LengthOutOfRange(length))
    }

    let size = HEADER_LEN + length + CHECKSUM_LEN;
    if src.len() < size {
        src.reserve(size - src.len());
        return Decoded::Incomplete
    }

    match validate(&src[..size]) {
        Ok(frame) => {
            src.advance(size);
            Decoded::Frame(frame)
        },
        Err(err) => {
            src.advance(1);
            Decoded::Invalid(err)
        }
    }
}


#[derive(Debug, Default)]
pub struct FrameCodec {
    invalid_frames: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of candidate frames rejected so far.
    pub fn invalid_frames(&self) -> u64 {
        self.invalid_frames
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;

    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match decode_next(src) {
                Decoded::Frame(frame) => {
                    trace!(packet_type = frame.packet_type, payload = ?&frame.payload[..], "rx frame");
                    return Ok(Some(frame))
                },
                Decoded::Incomplete => return Ok(None),
                Decoded::Invalid(err) => {
                    self.invalid_frames += 1;
                    warn!(%err, "discarding invalid frame");
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // a trailing partial frame can never complete
                if !buf.is_empty() {
                    trace!(len = buf.len(), "dropping partial frame at end of stream");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode(dst)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        trace!(packet_type = frame.packet_type, payload = ?&frame.payload[..], "tx frame");

        Ok(())
    }
}
