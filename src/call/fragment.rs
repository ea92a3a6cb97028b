//! Outgoing call fragmentation.
//!
//! Splits a logical call into one `CallRequest` (or `CallResponse`) frame
//! followed by continue frames. Each frame carries 1 to 3 arg chunks in
//! arg order; within a frame every chunk except the last closes its arg,
//! and the last chunk stays open unless the frame clears the
//! more-fragments flag. An arg that is exhausted exactly at a frame
//! boundary is closed by a zero-length chunk at the start of the next
//! fragment.
//!
//! Fragments of one call chain their checksums: each frame's digest covers
//! its own arg bytes seeded with the previous frame's digest.

use std::collections::HashMap;

use bytes::Bytes;

use super::{CallRequest, CallResponse, MAX_ARG1_SIZE};
use crate::error::{Result, TChannelError};
use crate::protocol::{
    CallRequestBody, CallResponseBody, ChecksumChain, ChecksumType, ContinueBody, Frame,
    FrameBody, ResponseCode, Trace, FLAG_MORE_FRAGMENTS, MAX_BODY_SIZE,
};

/// Which side of the call is being emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Request,
    Response,
}

/// Fixed fields of the first fragment, taken when it is built.
#[derive(Debug)]
enum FirstFragment {
    Request {
        service: String,
        headers: HashMap<String, String>,
        ttl_ms: u32,
        tracing: Trace,
    },
    Response {
        code: ResponseCode,
        headers: HashMap<String, String>,
        tracing: Trace,
    },
}

/// Splits one logical call into wire fragments.
///
/// Construction validates everything up front, so [`Fragmenter::next_frame`]
/// is infallible: it yields frames until the call is fully emitted.
#[derive(Debug)]
pub struct Fragmenter {
    id: u32,
    direction: Direction,
    first: Option<FirstFragment>,
    args: [Bytes; 3],
    /// Arg the receiver considers open; the next frame's first chunk
    /// belongs to it.
    cursor: usize,
    chain: ChecksumChain,
    done: bool,
}

impl Fragmenter {
    /// Fragment an outgoing call request under frame id `id`.
    pub fn request(id: u32, request: &CallRequest) -> Result<Self> {
        let ttl_ms = u32::try_from(request.ttl.as_millis())
            .map_err(|_| TChannelError::BadRequest("ttl exceeds the 32-bit range".into()))?;
        if ttl_ms == 0 {
            return Err(TChannelError::BadRequest("ttl must be positive".into()));
        }
        if request.arg1.len() > MAX_ARG1_SIZE {
            return Err(TChannelError::BadRequest(format!(
                "arg1 of {} bytes exceeds the {MAX_ARG1_SIZE}-byte limit",
                request.arg1.len()
            )));
        }
        let first = FirstFragment::Request {
            service: request.service.clone(),
            headers: request.headers.clone(),
            ttl_ms,
            tracing: request.tracing,
        };
        let overhead = first_overhead(&first, request.checksum_type)?;
        // The first fragment must close arg1: room for its full chunk plus
        // the next chunk's length prefix.
        if overhead + 2 + request.arg1.len() + 2 > MAX_BODY_SIZE {
            return Err(TChannelError::BadRequest(
                "service, headers and arg1 do not fit in a single fragment".into(),
            ));
        }
        Ok(Self {
            id,
            direction: Direction::Request,
            first: Some(first),
            args: [
                request.arg1.clone(),
                request.arg2.clone(),
                request.arg3.clone(),
            ],
            cursor: 0,
            chain: ChecksumChain::new(request.checksum_type),
            done: false,
        })
    }

    /// Fragment a call response under the request's frame id.
    pub fn response(
        id: u32,
        response: &CallResponse,
        checksum_type: ChecksumType,
    ) -> Result<Self> {
        if response.arg1.len() > MAX_ARG1_SIZE {
            return Err(TChannelError::BadRequest(format!(
                "arg1 of {} bytes exceeds the {MAX_ARG1_SIZE}-byte limit",
                response.arg1.len()
            )));
        }
        let first = FirstFragment::Response {
            code: response.code,
            headers: response.headers.clone(),
            tracing: response.tracing,
        };
        let overhead = first_overhead(&first, checksum_type)?;
        if overhead + 2 + response.arg1.len() + 2 > MAX_BODY_SIZE {
            return Err(TChannelError::BadRequest(
                "headers and arg1 do not fit in a single fragment".into(),
            ));
        }
        Ok(Self {
            id,
            direction: Direction::Response,
            first: Some(first),
            args: [
                response.arg1.clone(),
                response.arg2.clone(),
                response.arg3.clone(),
            ],
            cursor: 0,
            chain: ChecksumChain::new(checksum_type),
            done: false,
        })
    }

    /// Emit the next fragment, or `None` once the call is fully emitted.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }
        let first = self.first.take();
        let overhead = match &first {
            Some(first) => {
                // Validated at construction; recomputing cannot fail.
                first_overhead(first, self.chain.ty()).unwrap_or(MAX_BODY_SIZE)
            }
            None => continue_overhead(self.chain.ty()),
        };

        let mut space = MAX_BODY_SIZE - overhead;
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut arg = self.cursor;
        let mut last_arg = arg;
        while space >= 2 && arg < 3 {
            let take = self.args[arg].len().min(space - 2);
            let chunk = self.args[arg].split_to(take);
            space -= 2 + take;
            last_arg = arg;
            chunks.push(chunk);
            if self.args[arg].is_empty() {
                arg += 1;
            } else {
                break;
            }
        }

        let more = arg < 3;
        if more {
            // The receiver keeps the last chunk's arg open; resume there.
            self.cursor = last_arg;
        } else {
            self.done = true;
        }
        let flags = if more { FLAG_MORE_FRAGMENTS } else { 0 };

        let slices: Vec<&[u8]> = chunks.iter().map(|c| c.as_ref()).collect();
        let checksum = self.chain.fragment(&slices);
        let checksum_type = self.chain.ty();

        let body = match (first, self.direction) {
            (
                Some(FirstFragment::Request {
                    service,
                    headers,
                    ttl_ms,
                    tracing,
                }),
                _,
            ) => FrameBody::CallRequest(CallRequestBody {
                flags,
                ttl_ms,
                tracing,
                service,
                headers,
                checksum_type,
                checksum,
                args: chunks,
            }),
            (
                Some(FirstFragment::Response {
                    code,
                    headers,
                    tracing,
                }),
                _,
            ) => FrameBody::CallResponse(CallResponseBody {
                flags,
                code,
                tracing,
                headers,
                checksum_type,
                checksum,
                args: chunks,
            }),
            (None, Direction::Request) => FrameBody::CallRequestContinue(ContinueBody {
                flags,
                checksum_type,
                checksum,
                args: chunks,
            }),
            (None, Direction::Response) => FrameBody::CallResponseContinue(ContinueBody {
                flags,
                checksum_type,
                checksum,
                args: chunks,
            }),
        };
        Some(Frame::new(self.id, body))
    }
}

fn first_overhead(first: &FirstFragment, checksum_type: ChecksumType) -> Result<usize> {
    let (fixed, service_len, headers) = match first {
        FirstFragment::Request {
            service, headers, ..
        } => {
            // flags + ttl + tracing + service length prefix + nh
            (1 + 4 + Trace::WIRE_SIZE + 1 + 1, service.len(), headers)
        }
        // flags + code + tracing + nh
        FirstFragment::Response { headers, .. } => (1 + 1 + Trace::WIRE_SIZE + 1, 0, headers),
    };
    if service_len > u8::MAX as usize {
        return Err(TChannelError::BadRequest(
            "service name longer than 255 bytes".into(),
        ));
    }
    if headers.len() > u8::MAX as usize {
        return Err(TChannelError::BadRequest(
            "more than 255 transport headers".into(),
        ));
    }
    let mut header_len = 0usize;
    for (key, value) in headers {
        if key.len() > u8::MAX as usize || value.len() > u8::MAX as usize {
            return Err(TChannelError::BadRequest(format!(
                "transport header {key:?} longer than 255 bytes"
            )));
        }
        header_len += 2 + key.len() + value.len();
    }
    Ok(fixed + service_len + header_len + checksum_len(checksum_type))
}

fn continue_overhead(checksum_type: ChecksumType) -> usize {
    // flags + csumtype
    1 + 1 + checksum_len(checksum_type)
}

fn checksum_len(checksum_type: ChecksumType) -> usize {
    if checksum_type.has_value() {
        4
    } else {
        0
    }
}
