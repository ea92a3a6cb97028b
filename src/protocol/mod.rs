//! Wire protocol: frame envelope, typed bodies, incremental decoding,
//! checksums.
//!
//! This module implements the binary protocol of the connection:
//! - 16-byte envelope encoding/decoding
//! - typed frame bodies for every frame type
//! - frame buffer for accumulating partial reads
//! - chained per-fragment checksums

mod body;
mod checksum;
mod frame;
mod frame_buffer;
mod wire_format;

pub use body::{
    CallRequestBody, CallResponseBody, CancelBody, ClaimBody, ContinueBody, ErrorBody, InitBody,
    ResponseCode, Trace, FLAG_MORE_FRAGMENTS,
};
pub use checksum::{ChecksumChain, ChecksumType};
pub use frame::{Frame, FrameBody};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    FrameHeader, FrameType, CONNECTION_ID, FRAME_HEADER_SIZE, MAX_BODY_SIZE, MAX_FRAME_SIZE,
};
