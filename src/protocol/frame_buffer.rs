//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management. The envelope's
//! leading `size` field makes parsing a two-step state machine:
//! - `WaitingForSize`: need the first 2 bytes
//! - `WaitingForFrame`: size known, need `size` bytes total
//!
//! Incomplete frames are not an error; `push` simply returns the frames
//! that are complete and buffers the rest for the next push.

use bytes::BytesMut;

use super::frame::Frame;
use super::wire_format::FRAME_HEADER_SIZE;
use crate::error::{Result, TChannelError};

/// State machine for frame extraction.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the 2-byte size prefix.
    WaitingForSize,
    /// Size known, waiting for the whole frame.
    WaitingForFrame { size: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
}

impl FrameBuffer {
    /// Create a new frame buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForSize,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the decoded frames (may be empty while waiting for bytes).
    ///
    /// # Errors
    ///
    /// Returns a protocol error on a malformed frame: unknown type byte,
    /// size smaller than the envelope, or a body that fails to parse. Such
    /// errors are unrecoverable for the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match self.state {
            State::WaitingForSize => {
                if self.buffer.len() < 2 {
                    return Ok(None);
                }
                let size = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
                if size < FRAME_HEADER_SIZE {
                    return Err(TChannelError::Protocol(format!(
                        "frame size {size} smaller than envelope"
                    )));
                }
                self.state = State::WaitingForFrame { size };
                self.try_extract_one()
            }

            State::WaitingForFrame { size } => {
                if self.buffer.len() < size {
                    return Ok(None);
                }
                let frame_bytes = self.buffer.split_to(size).freeze();
                self.state = State::WaitingForSize;
                Frame::decode(frame_bytes).map(Some)
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::body::{CancelBody, Trace};
    use crate::protocol::frame::FrameBody;

    fn make_frame(id: u32) -> Frame {
        Frame::new(
            id,
            FrameBody::Cancel(CancelBody {
                ttl_ms: 100,
                tracing: Trace::default(),
                why: format!("reason-{id}"),
            }),
        )
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frame = make_frame(42);

        let frames = buffer.push(&frame.encode().unwrap()).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], frame);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = Vec::new();
        for id in 1..=3 {
            combined.extend_from_slice(&make_frame(id).encode().unwrap());
        }

        let frames = buffer.push(&combined).unwrap();

        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.id, (i + 1) as u32);
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_delivery() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_frame(7).encode().unwrap();

        // One byte short of the size prefix.
        assert!(buffer.push(&bytes[..1]).unwrap().is_empty());
        // Size known, body incomplete.
        assert!(buffer.push(&bytes[1..10]).unwrap().is_empty());
        // Remainder completes the frame.
        let frames = buffer.push(&bytes[10..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 7);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_frame(9).encode().unwrap();

        let mut all_frames = Vec::new();
        for byte in bytes.iter() {
            all_frames.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all_frames.len(), 1);
        assert_eq!(all_frames[0].id, 9);
    }

    #[test]
    fn test_complete_frame_plus_partial() {
        let mut buffer = FrameBuffer::new();
        let first = make_frame(1).encode().unwrap();
        let second = make_frame(2).encode().unwrap();

        let mut data = first.to_vec();
        data.extend_from_slice(&second[..5]);

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 1);

        let frames = buffer.push(&second[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 2);
    }

    #[test]
    fn test_undersized_frame_is_protocol_error() {
        let mut buffer = FrameBuffer::new();
        // size field says 4: smaller than the 16-byte envelope.
        let result = buffer.push(&[0x00, 0x04, 0x00, 0x00]);
        assert!(matches!(result, Err(TChannelError::Protocol(_))));
    }

    #[test]
    fn test_unknown_frame_type_is_protocol_error() {
        let mut buffer = FrameBuffer::new();
        let mut bytes = make_frame(1).encode().unwrap().to_vec();
        bytes[2] = 0x66;
        let result = buffer.push(&bytes);
        assert!(matches!(result, Err(TChannelError::Protocol(_))));
    }
}
