//! Typed frames and whole-frame encode/decode.
//!
//! A [`Frame`] pairs a call id with a typed body. Encoding computes the
//! envelope `size` field and refuses bodies that would overflow it; decoding
//! dispatches on the type byte and parses the body.

use bytes::{Bytes, BytesMut};

use super::body::{
    CallRequestBody, CallResponseBody, CancelBody, ClaimBody, ContinueBody, ErrorBody, InitBody,
};
use super::wire_format::{FrameHeader, FrameType, FRAME_HEADER_SIZE, MAX_BODY_SIZE};
use crate::error::{Result, TChannelError};

/// Typed frame body; one variant per frame type.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// Handshake opener.
    InitRequest(InitBody),
    /// Handshake reply.
    InitResponse(InitBody),
    /// First fragment of a call.
    CallRequest(CallRequestBody),
    /// First fragment of a response.
    CallResponse(CallResponseBody),
    /// Later fragment of a call.
    CallRequestContinue(ContinueBody),
    /// Later fragment of a response.
    CallResponseContinue(ContinueBody),
    /// Caller gave up on an in-flight call.
    Cancel(CancelBody),
    /// Retry coordination hint.
    Claim(ClaimBody),
    /// Liveness probe.
    PingRequest,
    /// Liveness probe reply.
    PingResponse,
    /// Call or connection failure.
    Error(ErrorBody),
}

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Call id this frame belongs to.
    pub id: u32,
    /// Typed body.
    pub body: FrameBody,
}

impl Frame {
    /// Create a new frame.
    pub fn new(id: u32, body: FrameBody) -> Self {
        Self { id, body }
    }

    /// The wire type of this frame.
    pub fn frame_type(&self) -> FrameType {
        match &self.body {
            FrameBody::InitRequest(_) => FrameType::InitRequest,
            FrameBody::InitResponse(_) => FrameType::InitResponse,
            FrameBody::CallRequest(_) => FrameType::CallRequest,
            FrameBody::CallResponse(_) => FrameType::CallResponse,
            FrameBody::CallRequestContinue(_) => FrameType::CallRequestContinue,
            FrameBody::CallResponseContinue(_) => FrameType::CallResponseContinue,
            FrameBody::Cancel(_) => FrameType::Cancel,
            FrameBody::Claim(_) => FrameType::Claim,
            FrameBody::PingRequest => FrameType::PingRequest,
            FrameBody::PingResponse => FrameType::PingResponse,
            FrameBody::Error(_) => FrameType::Error,
        }
    }

    /// Encode the full frame (envelope + body).
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the encoded body exceeds
    /// [`MAX_BODY_SIZE`]; the caller must fragment first.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(256);
        match &self.body {
            FrameBody::InitRequest(b) | FrameBody::InitResponse(b) => b.encode_into(&mut body)?,
            FrameBody::CallRequest(b) => b.encode_into(&mut body)?,
            FrameBody::CallResponse(b) => b.encode_into(&mut body)?,
            FrameBody::CallRequestContinue(b) | FrameBody::CallResponseContinue(b) => {
                b.encode_into(&mut body)?
            }
            FrameBody::Cancel(b) => b.encode_into(&mut body)?,
            FrameBody::Claim(b) => b.encode_into(&mut body)?,
            FrameBody::PingRequest | FrameBody::PingResponse => {}
            FrameBody::Error(b) => b.encode_into(&mut body)?,
        }

        if body.len() > MAX_BODY_SIZE {
            return Err(TChannelError::Protocol(format!(
                "frame body of {} bytes exceeds the {MAX_BODY_SIZE}-byte limit",
                body.len()
            )));
        }

        let header = FrameHeader::new(self.frame_type(), self.id, body.len());
        let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    /// Decode one complete frame.
    ///
    /// `bytes` must hold exactly the frame: the envelope `size` field must
    /// equal `bytes.len()`.
    pub fn decode(bytes: Bytes) -> Result<Self> {
        let header = FrameHeader::decode(&bytes)?;
        if header.size as usize != bytes.len() {
            return Err(TChannelError::Protocol(format!(
                "frame size field {} does not match {} buffered bytes",
                header.size,
                bytes.len()
            )));
        }
        let body_bytes = bytes.slice(FRAME_HEADER_SIZE..);
        let body = match header.frame_type {
            FrameType::InitRequest => FrameBody::InitRequest(InitBody::decode(body_bytes)?),
            FrameType::InitResponse => FrameBody::InitResponse(InitBody::decode(body_bytes)?),
            FrameType::CallRequest => FrameBody::CallRequest(CallRequestBody::decode(body_bytes)?),
            FrameType::CallResponse => {
                FrameBody::CallResponse(CallResponseBody::decode(body_bytes)?)
            }
            FrameType::CallRequestContinue => {
                FrameBody::CallRequestContinue(ContinueBody::decode(body_bytes)?)
            }
            FrameType::CallResponseContinue => {
                FrameBody::CallResponseContinue(ContinueBody::decode(body_bytes)?)
            }
            FrameType::Cancel => FrameBody::Cancel(CancelBody::decode(body_bytes)?),
            FrameType::Claim => FrameBody::Claim(ClaimBody::decode(body_bytes)?),
            FrameType::PingRequest => {
                ensure_empty(&body_bytes, "ping request")?;
                FrameBody::PingRequest
            }
            FrameType::PingResponse => {
                ensure_empty(&body_bytes, "ping response")?;
                FrameBody::PingResponse
            }
            FrameType::Error => FrameBody::Error(ErrorBody::decode(body_bytes)?),
        };
        Ok(Self {
            id: header.id,
            body,
        })
    }
}

fn ensure_empty(body: &Bytes, what: &str) -> Result<()> {
    if !body.is_empty() {
        return Err(TChannelError::Protocol(format!(
            "{what} carries an unexpected {}-byte body",
            body.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::body::{ResponseCode, Trace, FLAG_MORE_FRAGMENTS};
    use crate::protocol::checksum::ChecksumType;
    use crate::protocol::wire_format::MAX_FRAME_SIZE;
    use std::collections::HashMap;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::new(
                1,
                FrameBody::InitRequest(InitBody {
                    version: 2,
                    headers: HashMap::from([
                        ("host_port".into(), "127.0.0.1:4040".into()),
                        ("process_name".into(), "a".into()),
                    ]),
                }),
            ),
            Frame::new(
                2,
                FrameBody::CallRequest(CallRequestBody {
                    flags: FLAG_MORE_FRAGMENTS,
                    ttl_ms: 1000,
                    tracing: Trace {
                        span_id: 5,
                        parent_id: 6,
                        trace_id: 7,
                        flags: 1,
                    },
                    service: "svc".into(),
                    headers: HashMap::from([("as".into(), "raw".into())]),
                    checksum_type: ChecksumType::Crc32,
                    checksum: 0xCAFEBABE,
                    args: vec![Bytes::from_static(b"op"), Bytes::from_static(b"hdrs")],
                }),
            ),
            Frame::new(
                2,
                FrameBody::CallResponse(CallResponseBody {
                    flags: 0,
                    code: ResponseCode::Ok,
                    tracing: Trace::default(),
                    headers: HashMap::new(),
                    checksum_type: ChecksumType::None,
                    checksum: 0,
                    args: vec![Bytes::new(), Bytes::new(), Bytes::from_static(b"ok")],
                }),
            ),
            Frame::new(
                3,
                FrameBody::CallRequestContinue(ContinueBody {
                    flags: 0,
                    checksum_type: ChecksumType::Crc32C,
                    checksum: 42,
                    args: vec![Bytes::from_static(b"tail")],
                }),
            ),
            Frame::new(
                4,
                FrameBody::Cancel(CancelBody {
                    ttl_ms: 0,
                    tracing: Trace::default(),
                    why: "gone".into(),
                }),
            ),
            Frame::new(
                5,
                FrameBody::Claim(ClaimBody {
                    ttl_ms: 9,
                    tracing: Trace::default(),
                }),
            ),
            Frame::new(6, FrameBody::PingRequest),
            Frame::new(6, FrameBody::PingResponse),
            Frame::new(
                7,
                FrameBody::Error(ErrorBody {
                    code: ErrorCode::Timeout,
                    tracing: Trace::default(),
                    message: "request timed out".into(),
                }),
            ),
        ]
    }

    #[test]
    fn test_all_frame_types_roundtrip() {
        for frame in sample_frames() {
            let encoded = frame.encode().unwrap();
            let decoded = Frame::decode(encoded).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_size_field_equals_total_length() {
        for frame in sample_frames() {
            let encoded = frame.encode().unwrap();
            let size = u16::from_be_bytes([encoded[0], encoded[1]]);
            assert_eq!(size as usize, encoded.len());
        }
    }

    #[test]
    fn test_oversized_body_refused() {
        let frame = Frame::new(
            1,
            FrameBody::CallRequestContinue(ContinueBody {
                flags: 0,
                checksum_type: ChecksumType::None,
                checksum: 0,
                args: vec![Bytes::from(vec![0x41; MAX_BODY_SIZE])],
            }),
        );
        // Chunk prefix pushes the body two bytes past the limit.
        assert!(frame.encode().is_err());
    }

    #[test]
    fn test_max_size_body_accepted() {
        let frame = Frame::new(
            1,
            FrameBody::CallRequestContinue(ContinueBody {
                flags: 0,
                checksum_type: ChecksumType::None,
                checksum: 0,
                args: vec![Bytes::from(vec![0x41; MAX_BODY_SIZE - 4])],
            }),
        );
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), MAX_FRAME_SIZE);
        assert_eq!(Frame::decode(encoded).unwrap(), frame);
    }

    #[test]
    fn test_ping_with_body_rejected() {
        let mut bytes = Frame::new(1, FrameBody::PingRequest).encode().unwrap().to_vec();
        bytes.push(0x00);
        let len = bytes.len() as u16;
        bytes[0..2].copy_from_slice(&len.to_be_bytes());
        assert!(Frame::decode(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let encoded = Frame::new(1, FrameBody::PingRequest).encode().unwrap();
        let mut bytes = encoded.to_vec();
        bytes[1] += 1;
        assert!(Frame::decode(Bytes::from(bytes)).is_err());
    }
}
