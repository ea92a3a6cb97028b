//! # tchannel
//!
//! Wire-protocol core for TChannel: a bidirectional, multiplexed, framed
//! RPC transport over a single long-lived connection.
//!
//! This crate covers the protocol itself, not a service framework:
//!
//! - **Frame codec** ([`protocol`]): the 16-byte envelope, typed bodies for
//!   every frame type, incremental decoding, chained checksums
//! - **Init handshake** ([`handshake`]): version negotiation that must
//!   precede any call
//! - **Call fragmentation** ([`call`]): splitting calls into size-limited
//!   fragments and reassembling them, with per-fragment checksum chains
//! - **Connection multiplexer** ([`connection`]): one driver task per
//!   connection routing frames by id, sweeping deadlines, answering pings
//! - **Tracing bridge** ([`trace`]): carrying trace context in `$tracing$`
//!   headers and the protocol-level tracing field
//!
//! Arg payloads are opaque byte regions; argument schemes (JSON, Thrift,
//! raw) and service dispatch live above this crate.
//!
//! ## Example
//!
//! ```ignore
//! use tchannel::{CallRequest, Connection, ConnectionOptions};
//!
//! #[tokio::main]
//! async fn main() -> tchannel::Result<()> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:4040").await?;
//!     let conn = Connection::initiate(
//!         stream,
//!         ConnectionOptions::new("127.0.0.1:0", "example-client"),
//!     )
//!     .await?;
//!
//!     let mut request = CallRequest::new("svc", &b"echo"[..]);
//!     request.arg3 = bytes::Bytes::from_static(b"hello");
//!     let response = conn.submit(request).await?.wait().await?;
//!     println!("{:?}", response.arg3);
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod trace;

mod writer;

pub use call::{CallRequest, CallResponse};
pub use connection::{Connection, ConnectionOptions, InboundCall, ResponseFuture};
pub use error::{ErrorCode, Result, TChannelError};
pub use handshake::PeerInfo;
