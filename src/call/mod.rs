//! Logical calls and their fragmentation.
//!
//! A call is a request/response exchange identified by a frame id per
//! direction. On the wire it is one or more fragments; [`fragment`] splits
//! an outgoing call into frames and [`assemble`] rebuilds an incoming one.
//! The three args are opaque byte regions; by convention arg1 is the
//! endpoint name and is empty in responses.

mod assemble;
mod fragment;

pub use assemble::{AssembledArgs, Assembler};
pub use fragment::Fragmenter;

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Result, TChannelError};
use crate::protocol::{ChecksumType, ResponseCode, Trace};
use crate::trace::TRACING_KEY_PREFIX;

/// Maximum size of arg1 (the endpoint name) in bytes.
pub const MAX_ARG1_SIZE: usize = 16384;

/// An outgoing call, before fragmentation.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Target service name (at most 255 bytes).
    pub service: String,
    /// Endpoint name; must fit in the first fragment.
    pub arg1: Bytes,
    /// Second opaque byte region.
    pub arg2: Bytes,
    /// Third opaque byte region.
    pub arg3: Bytes,
    /// Transport headers. Keys with the reserved `$tracing$` prefix are
    /// tracer-owned and rejected in user input.
    pub headers: HashMap<String, String>,
    /// Time to live; must be positive.
    pub ttl: Duration,
    /// Checksum algorithm for every fragment of this call.
    pub checksum_type: ChecksumType,
    /// Protocol-level tracing field; filled in by the tracing bridge.
    pub tracing: Trace,
}

impl CallRequest {
    /// Create a call to `service`'s `endpoint` with empty args, a one
    /// second ttl and no checksum.
    pub fn new(service: impl Into<String>, endpoint: impl Into<Bytes>) -> Self {
        Self {
            service: service.into(),
            arg1: endpoint.into(),
            arg2: Bytes::new(),
            arg3: Bytes::new(),
            headers: HashMap::new(),
            ttl: Duration::from_secs(1),
            checksum_type: ChecksumType::None,
            tracing: Trace::default(),
        }
    }

    /// The endpoint name as text, for naming spans and log events.
    pub fn endpoint(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.arg1)
    }

    /// Reject user-supplied headers in the tracer-owned namespace.
    ///
    /// Called before the tracing bridge injects its own `$tracing$` keys.
    pub fn validate_user_headers(&self) -> Result<()> {
        if let Some(key) = self
            .headers
            .keys()
            .find(|k| k.starts_with(TRACING_KEY_PREFIX))
        {
            return Err(TChannelError::BadRequest(format!(
                "header key {key:?} uses the reserved {TRACING_KEY_PREFIX:?} prefix"
            )));
        }
        Ok(())
    }
}

/// A call response, before fragmentation or after reassembly.
#[derive(Debug, Clone)]
pub struct CallResponse {
    /// Response outcome.
    pub code: ResponseCode,
    /// Transport headers.
    pub headers: HashMap<String, String>,
    /// Empty in responses by convention.
    pub arg1: Bytes,
    /// Second opaque byte region.
    pub arg2: Bytes,
    /// Third opaque byte region.
    pub arg3: Bytes,
    /// Protocol-level tracing field.
    pub tracing: Trace,
}

impl CallResponse {
    /// Create an OK response with empty args.
    pub fn ok() -> Self {
        Self::with_code(ResponseCode::Ok)
    }

    /// Create an application-error response with empty args.
    pub fn error() -> Self {
        Self::with_code(ResponseCode::Error)
    }

    fn with_code(code: ResponseCode) -> Self {
        Self {
            code,
            headers: HashMap::new(),
            arg1: Bytes::new(),
            arg2: Bytes::new(),
            arg3: Bytes::new(),
            tracing: Trace::default(),
        }
    }

    /// Whether the peer reported an application error.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.code == ResponseCode::Error
    }
}
