//! Init handshake: version negotiation before any call may flow.
//!
//! State machine per connection:
//!
//! ```text
//! NEW ──send InitRequest──▶ AWAIT_INIT_RES ──recv InitResponse(v=2)──▶ READY
//! NEW ──recv InitRequest(v=2)──▶ send InitResponse ──▶ READY
//! any state × (bad version | non-init frame before READY) → fatal, close
//! ```
//!
//! Both sides advertise `host_port` and `process_name`; the peer's values
//! are recorded for routing and observability.

use std::collections::HashMap;

use crate::error::{Result, TChannelError};
use crate::protocol::{Frame, FrameBody, InitBody};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u16 = 2;

/// Required init header: local listening address, `host:port` form.
pub const HOST_PORT_KEY: &str = "host_port";

/// Required init header: free-form process identifier.
pub const PROCESS_NAME_KEY: &str = "process_name";

/// Frame id used for the handshake exchange on the initiating side.
pub const INIT_FRAME_ID: u32 = 1;

/// Identity a connection endpoint advertises during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Listening address in `host:port` form.
    pub host_port: String,
    /// Free-form process identifier.
    pub process_name: String,
}

impl PeerInfo {
    /// Create a new identity.
    pub fn new(host_port: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            host_port: host_port.into(),
            process_name: process_name.into(),
        }
    }

    /// Init headers advertising this identity.
    pub fn to_headers(&self) -> HashMap<String, String> {
        HashMap::from([
            (HOST_PORT_KEY.to_string(), self.host_port.clone()),
            (PROCESS_NAME_KEY.to_string(), self.process_name.clone()),
        ])
    }

    /// Extract an identity from init headers. Both keys are required;
    /// additional headers are ignored.
    pub fn from_headers(headers: &HashMap<String, String>) -> Result<Self> {
        let host_port = headers
            .get(HOST_PORT_KEY)
            .ok_or_else(|| missing_header(HOST_PORT_KEY))?;
        let process_name = headers
            .get(PROCESS_NAME_KEY)
            .ok_or_else(|| missing_header(PROCESS_NAME_KEY))?;
        Ok(Self::new(host_port.clone(), process_name.clone()))
    }
}

fn missing_header(key: &str) -> TChannelError {
    TChannelError::Handshake(format!("init headers missing required key {key:?}"))
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Nothing sent or received yet.
    New,
    /// InitRequest sent; waiting for the InitResponse.
    AwaitInitRes,
    /// Handshake complete; call frames may flow.
    Ready,
}

/// What a received frame did to the handshake.
#[derive(Debug)]
pub enum HandshakeEvent {
    /// Passive side: peer identified; send `response` back. READY.
    Reply {
        /// The peer's advertised identity.
        peer: PeerInfo,
        /// The InitResponse to send, echoing the request's frame id.
        response: Frame,
    },
    /// Active side: peer identified. READY.
    Complete {
        /// The peer's advertised identity.
        peer: PeerInfo,
    },
}

/// Per-connection init state machine.
///
/// The caller performs the I/O; this type decides what is legal and builds
/// the init frames.
#[derive(Debug)]
pub struct Handshake {
    state: InitState,
    local: PeerInfo,
}

impl Handshake {
    /// Create a handshake for a connection identifying as `local`.
    pub fn new(local: PeerInfo) -> Self {
        Self {
            state: InitState::New,
            local,
        }
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> InitState {
        self.state
    }

    /// Build the InitRequest and move NEW → AWAIT_INIT_RES.
    ///
    /// Only valid on a fresh handshake.
    pub fn initiate(&mut self) -> Result<Frame> {
        if self.state != InitState::New {
            return Err(TChannelError::Handshake(
                "handshake already initiated".into(),
            ));
        }
        self.state = InitState::AwaitInitRes;
        Ok(Frame::new(
            INIT_FRAME_ID,
            FrameBody::InitRequest(InitBody {
                version: PROTOCOL_VERSION,
                headers: self.local.to_headers(),
            }),
        ))
    }

    /// Drive the state machine with a received frame.
    ///
    /// Any frame other than the one the current state expects - or an init
    /// frame with an unsupported version - is fatal for the connection.
    pub fn on_frame(&mut self, frame: &Frame) -> Result<HandshakeEvent> {
        match (self.state, &frame.body) {
            (InitState::New, FrameBody::InitRequest(body)) => {
                check_version(body.version)?;
                let peer = PeerInfo::from_headers(&body.headers)?;
                self.state = InitState::Ready;
                let response = Frame::new(
                    frame.id,
                    FrameBody::InitResponse(InitBody {
                        version: PROTOCOL_VERSION,
                        headers: self.local.to_headers(),
                    }),
                );
                Ok(HandshakeEvent::Reply { peer, response })
            }
            (InitState::AwaitInitRes, FrameBody::InitResponse(body)) => {
                check_version(body.version)?;
                let peer = PeerInfo::from_headers(&body.headers)?;
                self.state = InitState::Ready;
                Ok(HandshakeEvent::Complete { peer })
            }
            (InitState::Ready, _) => Err(TChannelError::Handshake(
                "handshake already complete".into(),
            )),
            (_, body) => Err(TChannelError::Protocol(format!(
                "received {} frame before init handshake completed",
                frame_name(body)
            ))),
        }
    }
}

fn check_version(version: u16) -> Result<()> {
    if version != PROTOCOL_VERSION {
        return Err(TChannelError::Handshake(format!(
            "unsupported protocol version {version}, expected {PROTOCOL_VERSION}"
        )));
    }
    Ok(())
}

fn frame_name(body: &FrameBody) -> &'static str {
    match body {
        FrameBody::InitRequest(_) => "init request",
        FrameBody::InitResponse(_) => "init response",
        FrameBody::CallRequest(_) => "call request",
        FrameBody::CallResponse(_) => "call response",
        FrameBody::CallRequestContinue(_) => "call request continue",
        FrameBody::CallResponseContinue(_) => "call response continue",
        FrameBody::Cancel(_) => "cancel",
        FrameBody::Claim(_) => "claim",
        FrameBody::PingRequest => "ping request",
        FrameBody::PingResponse => "ping response",
        FrameBody::Error(_) => "error",
    }
}
