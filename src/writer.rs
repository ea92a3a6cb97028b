//! Dedicated writer task: the connection's bounded outbound frame queue.
//!
//! Frames arrive fully encoded (envelope + body, at most 65535 bytes) and
//! leave in arrival order, so fragments enqueued back-to-back for one call
//! stay in order on the wire while frames of different calls interleave at
//! frame granularity.
//!
//! The queue is a bounded channel and doubles as the backpressure
//! boundary: a sender that cannot enqueue within the configured timeout
//! gets [`TChannelError::QueueFull`]. The task drains whatever is queued
//! into a staging buffer and writes it out with one flush per drain, so a
//! burst of small frames costs one syscall, not one per frame.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, TChannelError};
use crate::protocol::MAX_FRAME_SIZE;

/// Default outbound queue capacity, in frames.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default time a sender may wait for queue space.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Staging budget per drain: two maximum-size frames.
const COALESCE_BUDGET: usize = 2 * MAX_FRAME_SIZE;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Outbound queue capacity, in frames.
    pub queue_capacity: usize,
    /// How long a sender may wait for queue space before giving up.
    pub enqueue_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }
}

/// Handle for enqueueing encoded frames.
///
/// Cheaply cloneable; shared by the driver task and inbound responders.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    enqueue_timeout: Duration,
}

impl WriterHandle {
    /// Enqueue one encoded frame.
    ///
    /// # Errors
    ///
    /// [`TChannelError::QueueFull`] if the queue stays full past the
    /// enqueue timeout; [`TChannelError::ConnectionClosed`] once the
    /// writer task is gone.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        match tokio::time::timeout(self.enqueue_timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TChannelError::ConnectionClosed),
            Err(_) => Err(TChannelError::QueueFull),
        }
    }
}

/// Spawn the writer task for `stream` and return the sending handle.
///
/// The task exits cleanly once every handle is dropped, or with the I/O
/// error that killed the stream; after that, sends fail with
/// `ConnectionClosed`.
pub fn start_writer<W>(stream: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let handle = WriterHandle {
        tx,
        enqueue_timeout: config.enqueue_timeout,
    };
    let task = tokio::spawn(drain_queue(rx, stream));
    (handle, task)
}

/// Writer loop: block on the first frame of a drain, then sweep the rest
/// of the queue into the same flush.
async fn drain_queue<W>(mut rx: mpsc::Receiver<Bytes>, mut stream: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut staged = BytesMut::with_capacity(COALESCE_BUDGET);
    while let Some(frame) = rx.recv().await {
        staged.extend_from_slice(&frame);
        while staged.len() < COALESCE_BUDGET {
            match rx.try_recv() {
                Ok(frame) => staged.extend_from_slice(&frame),
                Err(_) => break,
            }
        }
        stream.write_all(&staged).await?;
        stream.flush().await?;
        staged.clear();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, FrameBody};
    use tokio::io::{duplex, AsyncReadExt};

    fn ping_frame(id: u32) -> Bytes {
        Frame::new(id, FrameBody::PingRequest).encode().unwrap()
    }

    fn frame_id_at(buf: &[u8], frame_index: usize) -> u32 {
        let at = frame_index * 16;
        u32::from_be_bytes([buf[at + 4], buf[at + 5], buf[at + 6], buf[at + 7]])
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.enqueue_timeout, DEFAULT_ENQUEUE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_single_frame_reaches_the_stream() {
        let (writer_side, mut reader_side) = duplex(4096);
        let (handle, _task) = start_writer(writer_side, WriterConfig::default());

        handle.send(ping_frame(42)).await.unwrap();

        let mut buf = [0u8; 16];
        reader_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(frame_id_at(&buf, 0), 42);
    }

    #[tokio::test]
    async fn test_frames_keep_enqueue_order() {
        let (writer_side, mut reader_side) = duplex(64 * 1024);
        let (handle, _task) = start_writer(writer_side, WriterConfig::default());

        for id in 0..10u32 {
            handle.send(ping_frame(id)).await.unwrap();
        }

        let mut buf = [0u8; 10 * 16];
        reader_side.read_exact(&mut buf).await.unwrap();
        for id in 0..10u32 {
            assert_eq!(frame_id_at(&buf, id as usize), id);
        }
    }

    #[tokio::test]
    async fn test_coalesced_drain_stays_within_budget() {
        // A frame larger than the budget still goes out whole; the budget
        // only bounds how much piles up in one drain.
        let body = vec![0x41u8; 30_000];
        let frame = Frame::new(
            1,
            FrameBody::CallRequestContinue(crate::protocol::ContinueBody {
                flags: 0,
                checksum_type: crate::protocol::ChecksumType::None,
                checksum: 0,
                args: vec![Bytes::from(body)],
            }),
        )
        .encode()
        .unwrap();
        let total = 6 * frame.len();

        let (writer_side, mut reader_side) = duplex(512 * 1024);
        let (handle, _task) = start_writer(writer_side, WriterConfig::default());
        for _ in 0..6 {
            handle.send(frame.clone()).await.unwrap();
        }

        let mut buf = vec![0u8; total];
        reader_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..frame.len()], &frame[..]);
        assert_eq!(&buf[total - frame.len()..], &frame[..]);
    }

    #[tokio::test]
    async fn test_clean_shutdown_when_handles_drop() {
        let (writer_side, _reader_side) = duplex(4096);
        let (handle, task) = start_writer(writer_side, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_times_out_with_queue_full() {
        // A stream smaller than one frame wedges the task mid-write, and a
        // one-slot queue fills right behind it.
        let (writer_side, _reader_side) = duplex(8);
        let (handle, _task) = start_writer(
            writer_side,
            WriterConfig {
                queue_capacity: 1,
                enqueue_timeout: Duration::from_millis(50),
            },
        );

        let mut saw_queue_full = false;
        for id in 0..4u32 {
            match handle.send(ping_frame(id)).await {
                Ok(()) => {}
                Err(TChannelError::QueueFull) => {
                    saw_queue_full = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert!(saw_queue_full, "queue never reported backpressure");
    }

    #[tokio::test]
    async fn test_dead_stream_closes_the_queue() {
        let (writer_side, reader_side) = duplex(4096);
        let (handle, task) = start_writer(writer_side, WriterConfig::default());
        drop(reader_side);

        // The write that hits the dead stream kills the task; the frame
        // that triggered it may itself be accepted into the queue.
        let _ = handle.send(ping_frame(1)).await;
        let result = task.await.unwrap();
        assert!(result.is_err());

        let err = handle.send(ping_frame(2)).await.unwrap_err();
        assert!(matches!(err, TChannelError::ConnectionClosed));
    }
}
