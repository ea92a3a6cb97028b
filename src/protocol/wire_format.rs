//! Frame envelope encoding and decoding.
//!
//! Every frame on the wire starts with a fixed 16-byte envelope:
//! ```text
//! ┌──────────┬────────┬──────────┬──────────┬──────────┐
//! │ size     │ type   │ reserved │ id       │ reserved │
//! │ 2 bytes  │ 1 byte │ 1 byte   │ 4 bytes  │ 8 bytes  │
//! │ uint16 BE│        │          │ uint32 BE│          │
//! └──────────┴────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `size` counts the whole frame including the envelope, so the body is
//! `size - 16` bytes and can never exceed 65519 bytes. All multi-byte
//! integers are Big Endian. Reserved bytes are written as zero and ignored
//! on reception.

use crate::error::{Result, TChannelError};

/// Envelope size in bytes (fixed, exactly 16).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Maximum total frame size; `size` is a uint16.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Maximum body size: what remains after the envelope.
pub const MAX_BODY_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// Frame id addressing the whole connection rather than a single call.
pub const CONNECTION_ID: u32 = 0xFFFF_FFFF;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// First frame sent by the initiating side of the handshake.
    InitRequest = 0x01,
    /// Handshake reply from the passive side.
    InitResponse = 0x02,
    /// First (possibly only) fragment of an outgoing call.
    CallRequest = 0x03,
    /// First (possibly only) fragment of a call response.
    CallResponse = 0x04,
    /// Later fragment of a call request.
    CallRequestContinue = 0x13,
    /// Later fragment of a call response.
    CallResponseContinue = 0x14,
    /// Caller gave up on an in-flight call.
    Cancel = 0xC0,
    /// Retry coordination hint; parsed and ignored.
    Claim = 0xC1,
    /// Liveness probe.
    PingRequest = 0xD0,
    /// Liveness probe reply.
    PingResponse = 0xD1,
    /// Terminates a call or, addressed to [`CONNECTION_ID`], the connection.
    Error = 0xFF,
}

impl FrameType {
    /// Decode a frame type byte. Unknown types are a fatal protocol error.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::InitRequest),
            0x02 => Ok(Self::InitResponse),
            0x03 => Ok(Self::CallRequest),
            0x04 => Ok(Self::CallResponse),
            0x13 => Ok(Self::CallRequestContinue),
            0x14 => Ok(Self::CallResponseContinue),
            0xC0 => Ok(Self::Cancel),
            0xC1 => Ok(Self::Claim),
            0xD0 => Ok(Self::PingRequest),
            0xD1 => Ok(Self::PingResponse),
            0xFF => Ok(Self::Error),
            _ => Err(TChannelError::Protocol(format!(
                "unknown frame type 0x{value:02X}"
            ))),
        }
    }

    /// The wire byte for this type.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Decoded frame envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size including the envelope.
    pub size: u16,
    /// Frame type.
    pub frame_type: FrameType,
    /// Call id this frame belongs to.
    pub id: u32,
}

impl FrameHeader {
    /// Create a new envelope for a body of `body_len` bytes.
    ///
    /// The caller must have checked `body_len <= MAX_BODY_SIZE`.
    pub fn new(frame_type: FrameType, id: u32, body_len: usize) -> Self {
        debug_assert!(body_len <= MAX_BODY_SIZE);
        Self {
            size: (FRAME_HEADER_SIZE + body_len) as u16,
            frame_type,
            id,
        }
    }

    /// Encode the envelope (Big Endian, reserved bytes zeroed).
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than `FRAME_HEADER_SIZE`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= FRAME_HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.size.to_be_bytes());
        buf[2] = self.frame_type.as_u8();
        buf[3] = 0;
        buf[4..8].copy_from_slice(&self.id.to_be_bytes());
        buf[8..16].fill(0);
    }

    /// Encode the envelope into a fresh array.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Decode an envelope from the front of `buf`.
    ///
    /// Requires at least `FRAME_HEADER_SIZE` bytes; validates the type byte
    /// and that `size` covers the envelope itself. Reserved bytes are
    /// ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TChannelError::Protocol(format!(
                "truncated frame envelope: {} bytes",
                buf.len()
            )));
        }
        let size = u16::from_be_bytes([buf[0], buf[1]]);
        if (size as usize) < FRAME_HEADER_SIZE {
            return Err(TChannelError::Protocol(format!(
                "frame size {size} smaller than envelope"
            )));
        }
        let frame_type = FrameType::from_u8(buf[2])?;
        let id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Self {
            size,
            frame_type,
            id,
        })
    }
}
