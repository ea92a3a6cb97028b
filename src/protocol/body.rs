//! Typed frame bodies and their binary codecs.
//!
//! Body layouts (all integers Big Endian):
//!
//! ```text
//! init req/res:       version:2 nh:2 (key~2 value~2){nh}
//! call req:           flags:1 ttl:4 tracing:25 service~1 nh:1 (hk~1 hv~1){nh}
//!                     csumtype:1 (csum:4){0,1} arg1~2 [arg2~2 [arg3~2]]
//! call res:           flags:1 code:1 tracing:25 nh:1 (hk~1 hv~1){nh}
//!                     csumtype:1 (csum:4){0,1} arg1~2 [arg2~2 [arg3~2]]
//! call req/res cont.: flags:1 csumtype:1 (csum:4){0,1} arg chunks
//! cancel:             ttl:4 tracing:25 why~2
//! claim:              ttl:4 tracing:25
//! ping req/res:       (empty)
//! error:              code:1 tracing:25 message~2
//! ```
//!
//! `x~n` is an n-byte length prefix followed by that many bytes. Arg chunks
//! are opaque; how they map onto arg1/arg2/arg3 is the reassembler's
//! business ([`crate::call`]).

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::checksum::ChecksumType;
use crate::error::{ErrorCode, Result, TChannelError};

/// Flag bit on call frames: more fragments of this call follow.
pub const FLAG_MORE_FRAGMENTS: u8 = 0x01;

/// Protocol-level tracing field carried by call, cancel, claim and error
/// frames. 25 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trace {
    /// Id of the current span.
    pub span_id: u64,
    /// Id of the parent span, 0 if none.
    pub parent_id: u64,
    /// Id of the whole trace (64-bit on the wire).
    pub trace_id: u64,
    /// Tracer-defined flags (e.g. sampled).
    pub flags: u8,
}

impl Trace {
    /// Encoded size in bytes.
    pub const WIRE_SIZE: usize = 25;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64(self.span_id);
        buf.put_u64(self.parent_id);
        buf.put_u64(self.trace_id);
        buf.put_u8(self.flags);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        ensure_remaining(buf, Self::WIRE_SIZE, "tracing field")?;
        Ok(Self {
            span_id: buf.get_u64(),
            parent_id: buf.get_u64(),
            trace_id: buf.get_u64(),
            flags: buf.get_u8(),
        })
    }
}

/// Response outcome carried by call-response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    /// Call succeeded.
    Ok = 0x00,
    /// Call failed; arg2/arg3 describe the failure.
    Error = 0x01,
}

impl ResponseCode {
    /// Decode a response code byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::Error),
            _ => Err(TChannelError::Protocol(format!(
                "unknown response code 0x{value:02X}"
            ))),
        }
    }

    /// The wire byte for this code.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Body of `InitRequest` / `InitResponse` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitBody {
    /// Protocol version; currently always 2.
    pub version: u16,
    /// Identifying headers; `host_port` and `process_name` are required.
    pub headers: HashMap<String, String>,
}

/// Body of a `CallRequest` frame (first fragment of an outgoing call).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequestBody {
    /// Fragmentation flags; see [`FLAG_MORE_FRAGMENTS`].
    pub flags: u8,
    /// Time to live in milliseconds; must be positive.
    pub ttl_ms: u32,
    /// Protocol-level tracing field.
    pub tracing: Trace,
    /// Target service name (at most 255 bytes).
    pub service: String,
    /// Transport headers.
    pub headers: HashMap<String, String>,
    /// Checksum algorithm used by every fragment of this call.
    pub checksum_type: ChecksumType,
    /// This fragment's digest; 0 when `checksum_type` is `None`.
    pub checksum: u32,
    /// Arg chunks carried by this fragment (1 to 3).
    pub args: Vec<Bytes>,
}

/// Body of a `CallResponse` frame (first fragment of a response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponseBody {
    /// Fragmentation flags; see [`FLAG_MORE_FRAGMENTS`].
    pub flags: u8,
    /// Response outcome.
    pub code: ResponseCode,
    /// Protocol-level tracing field.
    pub tracing: Trace,
    /// Transport headers.
    pub headers: HashMap<String, String>,
    /// Checksum algorithm used by every fragment of this response.
    pub checksum_type: ChecksumType,
    /// This fragment's digest; 0 when `checksum_type` is `None`.
    pub checksum: u32,
    /// Arg chunks carried by this fragment (1 to 3).
    pub args: Vec<Bytes>,
}

/// Body of `CallRequestContinue` / `CallResponseContinue` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinueBody {
    /// Fragmentation flags; see [`FLAG_MORE_FRAGMENTS`].
    pub flags: u8,
    /// Checksum algorithm; must match the call's first fragment.
    pub checksum_type: ChecksumType,
    /// This fragment's digest; 0 when `checksum_type` is `None`.
    pub checksum: u32,
    /// Arg chunks carried by this fragment (1 to 3).
    pub args: Vec<Bytes>,
}

/// Body of a `Cancel` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelBody {
    /// Remaining ttl of the cancelled call in milliseconds.
    pub ttl_ms: u32,
    /// Tracing field of the cancelled call.
    pub tracing: Trace,
    /// Human-readable cancellation reason.
    pub why: String,
}

/// Body of a `Claim` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimBody {
    /// Ttl of the claimed call in milliseconds.
    pub ttl_ms: u32,
    /// Tracing field of the claimed call.
    pub tracing: Trace,
}

/// Body of an `Error` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    /// What went wrong.
    pub code: ErrorCode,
    /// Tracing field of the failed call, zeroed if unknown.
    pub tracing: Trace,
    /// Human-readable message.
    pub message: String,
}

impl InitBody {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.version);
        let count = u16::try_from(self.headers.len())
            .map_err(|_| TChannelError::Protocol("too many init headers".into()))?;
        buf.put_u16(count);
        for (key, value) in &self.headers {
            write_str_u16(buf, key, "init header key")?;
            write_str_u16(buf, value, "init header value")?;
        }
        Ok(())
    }

    pub(crate) fn decode(mut buf: Bytes) -> Result<Self> {
        ensure_remaining(&buf, 4, "init body")?;
        let version = buf.get_u16();
        let count = buf.get_u16();
        let mut headers = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let key = read_str_u16(&mut buf, "init header key")?;
            let value = read_str_u16(&mut buf, "init header value")?;
            headers.insert(key, value);
        }
        ensure_consumed(&buf, "init body")?;
        Ok(Self { version, headers })
    }
}

impl CallRequestBody {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.flags);
        buf.put_u32(self.ttl_ms);
        self.tracing.encode_into(buf);
        write_str_u8(buf, &self.service, "service name")?;
        write_headers_u8(buf, &self.headers)?;
        write_checksum(buf, self.checksum_type, self.checksum);
        write_args(buf, &self.args)
    }

    pub(crate) fn decode(mut buf: Bytes) -> Result<Self> {
        ensure_remaining(&buf, 5, "call request body")?;
        let flags = buf.get_u8();
        let ttl_ms = buf.get_u32();
        let tracing = Trace::decode(&mut buf)?;
        let service = read_str_u8(&mut buf, "service name")?;
        let headers = read_headers_u8(&mut buf)?;
        let (checksum_type, checksum) = read_checksum(&mut buf)?;
        let args = read_args(&mut buf)?;
        Ok(Self {
            flags,
            ttl_ms,
            tracing,
            service,
            headers,
            checksum_type,
            checksum,
            args,
        })
    }
}

impl CallResponseBody {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.flags);
        buf.put_u8(self.code.as_u8());
        self.tracing.encode_into(buf);
        write_headers_u8(buf, &self.headers)?;
        write_checksum(buf, self.checksum_type, self.checksum);
        write_args(buf, &self.args)
    }

    pub(crate) fn decode(mut buf: Bytes) -> Result<Self> {
        ensure_remaining(&buf, 2, "call response body")?;
        let flags = buf.get_u8();
        let code = ResponseCode::from_u8(buf.get_u8())?;
        let tracing = Trace::decode(&mut buf)?;
        let headers = read_headers_u8(&mut buf)?;
        let (checksum_type, checksum) = read_checksum(&mut buf)?;
        let args = read_args(&mut buf)?;
        Ok(Self {
            flags,
            code,
            tracing,
            headers,
            checksum_type,
            checksum,
            args,
        })
    }
}

impl ContinueBody {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.flags);
        write_checksum(buf, self.checksum_type, self.checksum);
        write_args(buf, &self.args)
    }

    pub(crate) fn decode(mut buf: Bytes) -> Result<Self> {
        ensure_remaining(&buf, 1, "continue body")?;
        let flags = buf.get_u8();
        let (checksum_type, checksum) = read_checksum(&mut buf)?;
        let args = read_args(&mut buf)?;
        Ok(Self {
            flags,
            checksum_type,
            checksum,
            args,
        })
    }
}

impl CancelBody {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32(self.ttl_ms);
        self.tracing.encode_into(buf);
        write_str_u16(buf, &self.why, "cancel reason")
    }

    pub(crate) fn decode(mut buf: Bytes) -> Result<Self> {
        ensure_remaining(&buf, 4, "cancel body")?;
        let ttl_ms = buf.get_u32();
        let tracing = Trace::decode(&mut buf)?;
        let why = read_str_u16(&mut buf, "cancel reason")?;
        ensure_consumed(&buf, "cancel body")?;
        Ok(Self {
            ttl_ms,
            tracing,
            why,
        })
    }
}

impl ClaimBody {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32(self.ttl_ms);
        self.tracing.encode_into(buf);
        Ok(())
    }

    pub(crate) fn decode(mut buf: Bytes) -> Result<Self> {
        ensure_remaining(&buf, 4, "claim body")?;
        let ttl_ms = buf.get_u32();
        let tracing = Trace::decode(&mut buf)?;
        ensure_consumed(&buf, "claim body")?;
        Ok(Self { ttl_ms, tracing })
    }
}

impl ErrorBody {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.code.as_u8());
        self.tracing.encode_into(buf);
        write_str_u16(buf, &self.message, "error message")
    }

    pub(crate) fn decode(mut buf: Bytes) -> Result<Self> {
        ensure_remaining(&buf, 1, "error body")?;
        let code_byte = buf.get_u8();
        let code = ErrorCode::from_u8(code_byte).ok_or_else(|| {
            TChannelError::Protocol(format!("unknown error code 0x{code_byte:02X}"))
        })?;
        let tracing = Trace::decode(&mut buf)?;
        let message = read_str_u16(&mut buf, "error message")?;
        ensure_consumed(&buf, "error body")?;
        Ok(Self {
            code,
            tracing,
            message,
        })
    }
}

// Codec helpers. Readers consume from a `Bytes` cursor and turn truncation
// into protocol errors; writers enforce that string lengths fit their
// length-prefix fields.

fn ensure_remaining(buf: &Bytes, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(TChannelError::Protocol(format!(
            "truncated {what}: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn ensure_consumed(buf: &Bytes, what: &str) -> Result<()> {
    if buf.has_remaining() {
        return Err(TChannelError::Protocol(format!(
            "{} trailing bytes after {what}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_utf8(bytes: Bytes, what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| TChannelError::Protocol(format!("{what} is not valid UTF-8")))
}

fn read_str_u8(buf: &mut Bytes, what: &str) -> Result<String> {
    ensure_remaining(buf, 1, what)?;
    let len = buf.get_u8() as usize;
    ensure_remaining(buf, len, what)?;
    read_utf8(buf.split_to(len), what)
}

fn read_str_u16(buf: &mut Bytes, what: &str) -> Result<String> {
    ensure_remaining(buf, 2, what)?;
    let len = buf.get_u16() as usize;
    ensure_remaining(buf, len, what)?;
    read_utf8(buf.split_to(len), what)
}

fn write_str_u8(buf: &mut BytesMut, value: &str, what: &str) -> Result<()> {
    let len = u8::try_from(value.len())
        .map_err(|_| TChannelError::Protocol(format!("{what} longer than 255 bytes")))?;
    buf.put_u8(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn write_str_u16(buf: &mut BytesMut, value: &str, what: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| TChannelError::Protocol(format!("{what} longer than 65535 bytes")))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn read_headers_u8(buf: &mut Bytes) -> Result<HashMap<String, String>> {
    ensure_remaining(buf, 1, "transport header count")?;
    let count = buf.get_u8();
    let mut headers = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = read_str_u8(buf, "transport header key")?;
        let value = read_str_u8(buf, "transport header value")?;
        headers.insert(key, value);
    }
    Ok(headers)
}

fn write_headers_u8(buf: &mut BytesMut, headers: &HashMap<String, String>) -> Result<()> {
    let count = u8::try_from(headers.len())
        .map_err(|_| TChannelError::Protocol("too many transport headers".into()))?;
    buf.put_u8(count);
    for (key, value) in headers {
        write_str_u8(buf, key, "transport header key")?;
        write_str_u8(buf, value, "transport header value")?;
    }
    Ok(())
}

fn read_checksum(buf: &mut Bytes) -> Result<(ChecksumType, u32)> {
    ensure_remaining(buf, 1, "checksum type")?;
    let ty = ChecksumType::from_u8(buf.get_u8())?;
    if !ty.has_value() {
        return Ok((ty, 0));
    }
    ensure_remaining(buf, 4, "checksum")?;
    Ok((ty, buf.get_u32()))
}

fn write_checksum(buf: &mut BytesMut, ty: ChecksumType, checksum: u32) {
    buf.put_u8(ty.as_u8());
    if ty.has_value() {
        buf.put_u32(checksum);
    }
}

fn read_args(buf: &mut Bytes) -> Result<Vec<Bytes>> {
    let mut args = Vec::new();
    while buf.has_remaining() {
        if args.len() == 3 {
            return Err(TChannelError::Protocol(
                "frame carries more than three arg chunks".into(),
            ));
        }
        ensure_remaining(buf, 2, "arg chunk length")?;
        let len = buf.get_u16() as usize;
        ensure_remaining(buf, len, "arg chunk")?;
        args.push(buf.split_to(len));
    }
    Ok(args)
}

fn write_args(buf: &mut BytesMut, args: &[Bytes]) -> Result<()> {
    if args.len() > 3 {
        return Err(TChannelError::Protocol(
            "frame carries more than three arg chunks".into(),
        ));
    }
    for arg in args {
        let len = u16::try_from(arg.len())
            .map_err(|_| TChannelError::Protocol("arg chunk longer than 65535 bytes".into()))?;
        buf.put_u16(len);
        buf.put_slice(arg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<F: FnOnce(&mut BytesMut) -> Result<()>>(f: F) -> Bytes {
        let mut buf = BytesMut::new();
        f(&mut buf).unwrap();
        buf.freeze()
    }

    #[test]
    fn test_trace_wire_size() {
        let tracing = Trace {
            span_id: 1,
            parent_id: 2,
            trace_id: 3,
            flags: 1,
        };
        let mut buf = BytesMut::new();
        tracing.encode_into(&mut buf);
        assert_eq!(buf.len(), Trace::WIRE_SIZE);
    }

    #[test]
    fn test_init_body_roundtrip() {
        let body = InitBody {
            version: 2,
            headers: HashMap::from([
                ("host_port".to_string(), "127.0.0.1:4040".to_string()),
                ("process_name".to_string(), "worker-a".to_string()),
            ]),
        };
        let bytes = encode(|buf| body.encode_into(buf));
        assert_eq!(InitBody::decode(bytes).unwrap(), body);
    }

    #[test]
    fn test_init_body_trailing_garbage_rejected() {
        let body = InitBody {
            version: 2,
            headers: HashMap::new(),
        };
        let mut bytes = encode(|buf| body.encode_into(buf)).to_vec();
        bytes.push(0xAA);
        assert!(InitBody::decode(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn test_call_request_body_roundtrip() {
        let body = CallRequestBody {
            flags: FLAG_MORE_FRAGMENTS,
            ttl_ms: 1000,
            tracing: Trace {
                span_id: 0x1111,
                parent_id: 0x2222,
                trace_id: 0x3333,
                flags: 1,
            },
            service: "svc".to_string(),
            headers: HashMap::from([("cn".to_string(), "caller".to_string())]),
            checksum_type: ChecksumType::Crc32,
            checksum: 0xDEADBEEF,
            args: vec![
                Bytes::from_static(b"endpoint"),
                Bytes::from_static(b""),
                Bytes::from_static(b"{}"),
            ],
        };
        let bytes = encode(|buf| body.encode_into(buf));
        assert_eq!(CallRequestBody::decode(bytes).unwrap(), body);
    }

    #[test]
    fn test_call_request_body_without_checksum_omits_field() {
        let body = CallRequestBody {
            flags: 0,
            ttl_ms: 50,
            tracing: Trace::default(),
            service: "s".to_string(),
            headers: HashMap::new(),
            checksum_type: ChecksumType::None,
            checksum: 0,
            args: vec![Bytes::from_static(b"op")],
        };
        let with_none = encode(|buf| body.encode_into(buf)).len();
        let with_crc = encode(|buf| {
            CallRequestBody {
                checksum_type: ChecksumType::Crc32,
                ..body.clone()
            }
            .encode_into(buf)
        })
        .len();
        assert_eq!(with_crc, with_none + 4);
    }

    #[test]
    fn test_call_response_body_roundtrip() {
        let body = CallResponseBody {
            flags: 0,
            code: ResponseCode::Error,
            tracing: Trace::default(),
            headers: HashMap::new(),
            checksum_type: ChecksumType::Crc32C,
            checksum: 7,
            args: vec![
                Bytes::new(),
                Bytes::from_static(b"msg"),
                Bytes::from_static(b"details"),
            ],
        };
        let bytes = encode(|buf| body.encode_into(buf));
        assert_eq!(CallResponseBody::decode(bytes).unwrap(), body);
    }

    #[test]
    fn test_continue_body_roundtrip() {
        let body = ContinueBody {
            flags: 0,
            checksum_type: ChecksumType::Farmhash,
            checksum: 99,
            args: vec![Bytes::from_static(b"tail of arg3")],
        };
        let bytes = encode(|buf| body.encode_into(buf));
        assert_eq!(ContinueBody::decode(bytes).unwrap(), body);
    }

    #[test]
    fn test_cancel_and_claim_roundtrip() {
        let cancel = CancelBody {
            ttl_ms: 120,
            tracing: Trace::default(),
            why: "caller went away".to_string(),
        };
        let bytes = encode(|buf| cancel.encode_into(buf));
        assert_eq!(CancelBody::decode(bytes).unwrap(), cancel);

        let claim = ClaimBody {
            ttl_ms: 120,
            tracing: Trace::default(),
        };
        let bytes = encode(|buf| claim.encode_into(buf));
        assert_eq!(ClaimBody::decode(bytes).unwrap(), claim);
    }

    #[test]
    fn test_error_body_roundtrip() {
        let body = ErrorBody {
            code: ErrorCode::BadRequest,
            tracing: Trace::default(),
            message: "ttl must be positive".to_string(),
        };
        let bytes = encode(|buf| body.encode_into(buf));
        assert_eq!(ErrorBody::decode(bytes).unwrap(), body);
    }

    #[test]
    fn test_error_body_unknown_code_rejected() {
        let body = ErrorBody {
            code: ErrorCode::Busy,
            tracing: Trace::default(),
            message: String::new(),
        };
        let mut bytes = encode(|buf| body.encode_into(buf)).to_vec();
        bytes[0] = 0x77;
        assert!(ErrorBody::decode(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn test_truncated_body_is_protocol_error() {
        let body = CallRequestBody {
            flags: 0,
            ttl_ms: 1000,
            tracing: Trace::default(),
            service: "svc".to_string(),
            headers: HashMap::new(),
            checksum_type: ChecksumType::None,
            checksum: 0,
            args: vec![Bytes::from_static(b"op")],
        };
        let bytes = encode(|buf| body.encode_into(buf));
        for cut in [0, 1, 4, 20, bytes.len() - 1] {
            let err = CallRequestBody::decode(bytes.slice(..cut)).unwrap_err();
            assert!(
                matches!(err, TChannelError::Protocol(_)),
                "cut at {cut} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_arg_chunk_length_overflow_rejected() {
        // Chunk length prefix claims more bytes than remain in the body.
        let mut buf = BytesMut::new();
        let body = ContinueBody {
            flags: 0,
            checksum_type: ChecksumType::None,
            checksum: 0,
            args: vec![],
        };
        body.encode_into(&mut buf).unwrap();
        buf.put_u16(500);
        buf.put_slice(b"short");
        assert!(ContinueBody::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_more_than_three_chunks_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u8(ChecksumType::None.as_u8());
        for _ in 0..4 {
            buf.put_u16(1);
            buf.put_u8(b'x');
        }
        assert!(ContinueBody::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_service_name_longer_than_255_rejected() {
        let body = CallRequestBody {
            flags: 0,
            ttl_ms: 1,
            tracing: Trace::default(),
            service: "s".repeat(256),
            headers: HashMap::new(),
            checksum_type: ChecksumType::None,
            checksum: 0,
            args: vec![],
        };
        let mut buf = BytesMut::new();
        assert!(body.encode_into(&mut buf).is_err());
    }

    #[test]
    fn test_invalid_utf8_header_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(2); // version
        buf.put_u16(1); // nh
        buf.put_u16(2);
        buf.put_slice(&[0xFF, 0xFE]);
        buf.put_u16(0);
        assert!(InitBody::decode(buf.freeze()).is_err());
    }
}
