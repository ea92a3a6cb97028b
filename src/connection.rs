//! Connection multiplexer.
//!
//! One driver task per connection owns every piece of per-call state, so
//! the in-flight tables need no locks. The driver selects over three
//! inputs: the stream's read half (through the incremental frame buffer),
//! a bounded submission channel that callers reach through [`Connection`],
//! and a deadline tick. Writes go through the dedicated writer task in
//! [`crate::writer`].
//!
//! Lifecycle:
//! 1. [`Connection::initiate`] / [`Connection::accept`] run the init
//!    handshake inline on the raw stream - no call frame can precede READY
//! 2. the driver task and writer task are spawned
//! 3. [`Connection::submit`] fragments outgoing calls onto the wire and
//!    returns a [`ResponseFuture`]; reassembled inbound calls surface via
//!    [`Connection::next_inbound`]
//! 4. timeouts sweep through a deadline heap; errors and cancels run the
//!    same terminal transition so state cleanup is uniform

use std::borrow::Cow;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::call::{AssembledArgs, Assembler, CallRequest, CallResponse, Fragmenter};
use crate::error::{ErrorCode, Result, TChannelError};
use crate::handshake::{Handshake, HandshakeEvent, PeerInfo};
use crate::protocol::{
    CallRequestBody, CallResponseBody, ChecksumType, ErrorBody, Frame, FrameBody, FrameBuffer,
    ResponseCode, Trace, CONNECTION_ID,
};
use crate::trace::{self, Tracer, TracingContext};
use crate::writer::{start_writer, WriterConfig, WriterHandle};

/// Configuration for a connection.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Identity advertised during the handshake.
    pub local: PeerInfo,
    /// Optional tracer collaborator.
    pub tracer: Option<Arc<dyn Tracer>>,
    /// Optional per-task tracing context.
    pub tracing_context: Option<Arc<dyn TracingContext>>,
    /// Outbound frame queue capacity; senders wait for space and
    /// eventually fail with `QueueFull`.
    pub outbound_queue_capacity: usize,
    /// Submission channel capacity.
    pub submission_capacity: usize,
    /// Inbound call channel capacity.
    pub inbound_capacity: usize,
    /// Deadline sweep interval.
    pub tick_interval: Duration,
    /// How long a terminated call id keeps discarding late frames.
    pub tombstone_ttl: Duration,
}

impl ConnectionOptions {
    /// Options with default limits for a connection identifying as
    /// `host_port` / `process_name`.
    pub fn new(host_port: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            local: PeerInfo::new(host_port, process_name),
            tracer: None,
            tracing_context: None,
            outbound_queue_capacity: 256,
            submission_capacity: 64,
            inbound_capacity: 64,
            tick_interval: Duration::from_millis(10),
            tombstone_ttl: Duration::from_secs(5),
        }
    }

    /// Attach a tracer and tracing context.
    pub fn with_tracer(
        mut self,
        tracer: Arc<dyn Tracer>,
        tracing_context: Arc<dyn TracingContext>,
    ) -> Self {
        self.tracer = Some(tracer);
        self.tracing_context = Some(tracing_context);
        self
    }
}

/// A fully reassembled inbound call, delivered to the handler layer.
///
/// Owns its arg buffers; the connection's per-call state is already gone
/// when this surfaces. Respond through [`InboundCall::respond`] or
/// [`InboundCall::respond_error`].
pub struct InboundCall {
    /// Target service name.
    pub service: String,
    /// Time to live the caller granted.
    pub ttl: Duration,
    /// Protocol-level tracing field.
    pub tracing: Trace,
    /// Transport headers (tracer-owned keys are stripped by
    /// [`crate::trace::start_inbound`]).
    pub headers: HashMap<String, String>,
    /// Endpoint name.
    pub arg1: Bytes,
    /// Second opaque byte region.
    pub arg2: Bytes,
    /// Third opaque byte region.
    pub arg3: Bytes,
    responder: Responder,
}

impl InboundCall {
    /// The endpoint name as text.
    pub fn endpoint(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.arg1)
    }

    /// Build a detached inbound call (for testing without a connection).
    pub fn for_testing(
        service: impl Into<String>,
        arg1: impl Into<Bytes>,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            service: service.into(),
            ttl: Duration::from_secs(1),
            tracing: Trace::default(),
            headers,
            arg1: arg1.into(),
            arg2: Bytes::new(),
            arg3: Bytes::new(),
            responder: Responder {
                id: 0,
                checksum_type: ChecksumType::None,
                tracing: Trace::default(),
                writer: None,
            },
        }
    }

    /// Fragment and send a response for this call.
    ///
    /// The response reuses the request's checksum type; its tracing field,
    /// if left default, echoes the request's.
    pub async fn respond(self, mut response: CallResponse) -> Result<()> {
        let Responder {
            id,
            checksum_type,
            tracing,
            writer,
        } = self.responder;
        let Some(writer) = writer else {
            // Testing mode: no connection behind this call.
            return Ok(());
        };
        if response.tracing == Trace::default() {
            response.tracing = tracing;
        }
        let mut fragmenter = Fragmenter::response(id, &response, checksum_type)?;
        while let Some(frame) = fragmenter.next_frame() {
            writer.send(frame.encode()?).await?;
        }
        Ok(())
    }

    /// Terminate this call with an error frame instead of a response.
    pub async fn respond_error(self, code: ErrorCode, message: &str) -> Result<()> {
        let Responder {
            id,
            tracing,
            writer,
            ..
        } = self.responder;
        let Some(writer) = writer else {
            return Ok(());
        };
        let frame = Frame::new(
            id,
            FrameBody::Error(ErrorBody {
                code,
                tracing,
                message: message.to_string(),
            }),
        );
        writer.send(frame.encode()?).await
    }
}

/// Sends the response frames for one inbound call.
struct Responder {
    id: u32,
    checksum_type: ChecksumType,
    tracing: Trace,
    writer: Option<WriterHandle>,
}

/// Completion handle for a submitted call.
///
/// Resolves exactly once: with the peer's response, or with the error that
/// terminated the call (timeout, cancel, peer error, connection failure).
pub struct ResponseFuture {
    id: Option<u32>,
    id_rx: oneshot::Receiver<u32>,
    reply: oneshot::Receiver<Result<CallResponse>>,
    commands: mpsc::Sender<Command>,
}

impl ResponseFuture {
    /// Wait for the call's terminal state.
    pub async fn wait(self) -> Result<CallResponse> {
        match self.reply.await {
            Ok(result) => result,
            Err(_) => Err(TChannelError::ConnectionClosed),
        }
    }

    /// The frame id the connection assigned, once known.
    ///
    /// `None` if the call failed before an id was allocated (validation or
    /// interceptor failure).
    pub async fn id(&mut self) -> Option<u32> {
        if self.id.is_none() {
            self.id = (&mut self.id_rx).await.ok();
        }
        self.id
    }

    /// Cancel the call: sends `Cancel` to the peer and completes this
    /// future with [`TChannelError::Cancelled`].
    pub async fn cancel(&mut self, why: &str) {
        if let Some(id) = self.id().await {
            let _ = self
                .commands
                .send(Command::Cancel {
                    id,
                    why: why.to_string(),
                })
                .await;
        }
    }
}

/// Caller-to-driver submission queue messages.
enum Command {
    Call {
        request: CallRequest,
        id_tx: oneshot::Sender<u32>,
        reply: oneshot::Sender<Result<CallResponse>>,
    },
    Cancel {
        id: u32,
        why: String,
    },
    Ping {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A connection to one peer, multiplexing calls over a byte stream.
pub struct Connection {
    peer: PeerInfo,
    commands: mpsc::Sender<Command>,
    inbound: mpsc::Receiver<InboundCall>,
}

impl Connection {
    /// Actively open a connection: send `InitRequest`, await the
    /// `InitResponse`, then start the driver.
    pub async fn initiate<S>(mut stream: S, options: ConnectionOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut handshake = Handshake::new(options.local.clone());
        let init = handshake.initiate()?.encode()?;
        stream.write_all(&init).await?;
        stream.flush().await?;

        let (peer, frame_buffer, pending) =
            drive_handshake(&mut stream, &mut handshake, |event| match event {
                HandshakeEvent::Complete { peer } => Ok((peer, None)),
                HandshakeEvent::Reply { .. } => Err(TChannelError::Handshake(
                    "received init request while awaiting init response".into(),
                )),
            })
            .await?;

        Ok(Self::spawn(stream, frame_buffer, pending, peer, options))
    }

    /// Passively accept a connection: await the `InitRequest`, reply, then
    /// start the driver.
    pub async fn accept<S>(mut stream: S, options: ConnectionOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut handshake = Handshake::new(options.local.clone());

        let (peer, frame_buffer, pending) =
            drive_handshake(&mut stream, &mut handshake, |event| match event {
                HandshakeEvent::Reply { peer, response } => Ok((peer, Some(response))),
                HandshakeEvent::Complete { .. } => Err(TChannelError::Handshake(
                    "unexpected handshake completion on the passive side".into(),
                )),
            })
            .await?;

        Ok(Self::spawn(stream, frame_buffer, pending, peer, options))
    }

    fn spawn<S>(
        stream: S,
        frame_buffer: FrameBuffer,
        pending: Vec<Frame>,
        peer: PeerInfo,
        options: ConnectionOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, _writer_task) = start_writer(
            write_half,
            WriterConfig {
                queue_capacity: options.outbound_queue_capacity,
                ..WriterConfig::default()
            },
        );
        let (commands_tx, commands_rx) = mpsc::channel(options.submission_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_capacity);

        let driver = Driver {
            writer,
            inbound_tx,
            tracer: options.tracer,
            tracing_context: options.tracing_context,
            next_id: 2,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            pending_pings: HashMap::new(),
            deadlines: BinaryHeap::new(),
            tombstones: HashMap::new(),
            tombstone_ttl: options.tombstone_ttl,
            tick_interval: options.tick_interval,
        };
        tokio::spawn(driver.run(read_half, frame_buffer, pending, commands_rx));

        Self {
            peer,
            commands: commands_tx,
            inbound: inbound_rx,
        }
    }

    /// The peer's identity recorded during the handshake.
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Submit an outbound call.
    ///
    /// Crosses the bounded submission queue into the driver task; the
    /// returned future resolves on the call's terminal state.
    pub async fn submit(&self, request: CallRequest) -> Result<ResponseFuture> {
        let (id_tx, id_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                request,
                id_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TChannelError::ConnectionClosed)?;
        Ok(ResponseFuture {
            id: None,
            id_rx,
            reply: reply_rx,
            commands: self.commands.clone(),
        })
    }

    /// Probe the peer: resolves when the matching `PingResponse` arrives.
    pub async fn ping(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Ping { reply: reply_tx })
            .await
            .map_err(|_| TChannelError::ConnectionClosed)?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(TChannelError::ConnectionClosed),
        }
    }

    /// Next fully reassembled inbound call, or `None` once the connection
    /// is gone.
    pub async fn next_inbound(&mut self) -> Option<InboundCall> {
        self.inbound.recv().await
    }
}

/// Read frames until the handshake resolves; returns leftover frames that
/// arrived in the same reads.
async fn drive_handshake<S, F>(
    stream: &mut S,
    handshake: &mut Handshake,
    mut resolve: F,
) -> Result<(PeerInfo, FrameBuffer, Vec<Frame>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(HandshakeEvent) -> Result<(PeerInfo, Option<Frame>)>,
{
    let mut frame_buffer = FrameBuffer::new();
    let mut read_buf = vec![0u8; 16 * 1024];
    loop {
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Err(TChannelError::Handshake(
                "connection closed during init handshake".into(),
            ));
        }
        let mut frames = match frame_buffer.push(&read_buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                reject_handshake(stream, &e).await;
                return Err(e);
            }
        };
        if frames.is_empty() {
            continue;
        }
        let first = frames.remove(0);
        match handshake.on_frame(&first).and_then(&mut resolve) {
            Ok((peer, response)) => {
                if let Some(response) = response {
                    stream.write_all(&response.encode()?).await?;
                    stream.flush().await?;
                }
                return Ok((peer, frame_buffer, frames));
            }
            Err(e) => {
                reject_handshake(stream, &e).await;
                return Err(e);
            }
        }
    }
}

/// Best-effort fatal error frame before abandoning a failed handshake.
async fn reject_handshake<S: AsyncWrite + Unpin>(stream: &mut S, error: &TChannelError) {
    let frame = Frame::new(
        CONNECTION_ID,
        FrameBody::Error(ErrorBody {
            code: ErrorCode::FatalProtocolError,
            tracing: Trace::default(),
            message: error.to_string(),
        }),
    );
    if let Ok(bytes) = frame.encode() {
        let _ = stream.write_all(&bytes).await;
        let _ = stream.flush().await;
    }
}

/// Whether the connection keeps running after a frame.
enum FrameOutcome {
    Continue,
    Shutdown,
}

/// Which in-flight table a deadline entry points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Direction {
    Outgoing,
    Incoming,
}

/// Outgoing call state, keyed by frame id.
struct OutgoingCall {
    reply: oneshot::Sender<Result<CallResponse>>,
    assembler: Assembler,
    meta: Option<ResponseMeta>,
    deadline: Instant,
    tracing: Trace,
    span: Option<Box<dyn trace::Span>>,
}

/// Fixed fields of a response's first fragment.
struct ResponseMeta {
    code: ResponseCode,
    headers: HashMap<String, String>,
    tracing: Trace,
}

/// Incoming call state, keyed by frame id.
struct IncomingCall {
    assembler: Assembler,
    meta: RequestMeta,
    deadline: Instant,
}

/// Fixed fields of a request's first fragment.
struct RequestMeta {
    service: String,
    headers: HashMap<String, String>,
    ttl_ms: u32,
    tracing: Trace,
    checksum_type: ChecksumType,
}

/// The connection task: single writer of all per-call state.
struct Driver {
    writer: WriterHandle,
    inbound_tx: mpsc::Sender<InboundCall>,
    tracer: Option<Arc<dyn Tracer>>,
    tracing_context: Option<Arc<dyn TracingContext>>,
    next_id: u32,
    outgoing: HashMap<u32, OutgoingCall>,
    incoming: HashMap<u32, IncomingCall>,
    pending_pings: HashMap<u32, oneshot::Sender<Result<()>>>,
    deadlines: BinaryHeap<Reverse<(Instant, u32, Direction)>>,
    tombstones: HashMap<u32, Instant>,
    tombstone_ttl: Duration,
    tick_interval: Duration,
}

impl Driver {
    async fn run<R: AsyncRead + Unpin>(
        mut self,
        mut reader: R,
        mut frame_buffer: FrameBuffer,
        pending: Vec<Frame>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        // Frames that rode in with the handshake bytes.
        for frame in pending {
            match self.on_frame(frame).await {
                Ok(FrameOutcome::Continue) => {}
                Ok(FrameOutcome::Shutdown) => return,
                Err(e) => {
                    self.shutdown_fatal(e).await;
                    return;
                }
            }
        }

        let mut read_buf = vec![0u8; 64 * 1024];
        let mut tick = tokio::time::interval(self.tick_interval);
        let mut commands_open = true;

        loop {
            tokio::select! {
                read = reader.read(&mut read_buf) => match read {
                    Ok(0) => {
                        self.fail_all(|| TChannelError::Network("connection closed by peer".into()));
                        return;
                    }
                    Ok(n) => {
                        let frames = match frame_buffer.push(&read_buf[..n]) {
                            Ok(frames) => frames,
                            Err(e) => {
                                self.shutdown_fatal(e).await;
                                return;
                            }
                        };
                        for frame in frames {
                            match self.on_frame(frame).await {
                                Ok(FrameOutcome::Continue) => {}
                                Ok(FrameOutcome::Shutdown) => return,
                                Err(e) => {
                                    self.shutdown_fatal(e).await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("read failed: {e}");
                        self.fail_all(|| TChannelError::Network(format!("read failed: {e}")));
                        return;
                    }
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command).await,
                    None => commands_open = false,
                },
                _ = tick.tick() => self.tick(Instant::now()).await,
            }
        }
    }

    /// Allocate a frame id: monotonic, wrapping, skipping ids still in
    /// flight or tombstoned.
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id == CONNECTION_ID {
                continue;
            }
            if !self.outgoing.contains_key(&id)
                && !self.pending_pings.contains_key(&id)
                && !self.tombstones.contains_key(&id)
            {
                return id;
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Call {
                request,
                id_tx,
                reply,
            } => self.submit_call(request, id_tx, reply).await,
            Command::Cancel { id, why } => self.cancel_call(id, &why).await,
            Command::Ping { reply } => {
                let id = self.allocate_id();
                let frame = Frame::new(id, FrameBody::PingRequest);
                match self.send_frame(&frame).await {
                    Ok(()) => {
                        self.pending_pings.insert(id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    async fn submit_call(
        &mut self,
        mut request: CallRequest,
        id_tx: oneshot::Sender<u32>,
        reply: oneshot::Sender<Result<CallResponse>>,
    ) {
        if let Err(e) = request.validate_user_headers() {
            let _ = reply.send(Err(e));
            return;
        }

        // Interceptor failures surface here, before any id is allocated.
        let span = match trace::start_outbound(
            &mut request,
            self.tracer.as_deref(),
            self.tracing_context.as_deref(),
        ) {
            Ok(span) => span,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let id = self.allocate_id();
        let mut fragmenter = match Fragmenter::request(id, &request) {
            Ok(fragmenter) => fragmenter,
            Err(e) => {
                if let Some(span) = span {
                    trace::finish_span(span, Some(&e.to_string()));
                }
                let _ = reply.send(Err(e));
                return;
            }
        };
        let _ = id_tx.send(id);

        while let Some(frame) = fragmenter.next_frame() {
            if let Err(e) = self.send_frame(&frame).await {
                if let Some(span) = span {
                    trace::finish_span(span, Some(&e.to_string()));
                }
                let _ = reply.send(Err(e));
                return;
            }
        }

        let deadline = Instant::now() + request.ttl;
        self.deadlines
            .push(Reverse((deadline, id, Direction::Outgoing)));
        self.outgoing.insert(
            id,
            OutgoingCall {
                reply,
                assembler: Assembler::new(),
                meta: None,
                deadline,
                tracing: request.tracing,
                span,
            },
        );
    }

    async fn cancel_call(&mut self, id: u32, why: &str) {
        let Some(call) = self.outgoing.remove(&id) else {
            return;
        };
        let remaining = call
            .deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as u32;
        let frame = Frame::new(
            id,
            FrameBody::Cancel(crate::protocol::CancelBody {
                ttl_ms: remaining,
                tracing: call.tracing,
                why: why.to_string(),
            }),
        );
        if let Err(e) = self.send_frame(&frame).await {
            tracing::warn!("failed to send cancel frame for call {}: {}", id, e);
        }
        self.tombstone(id);
        if let Some(span) = call.span {
            trace::finish_span(span, Some("cancelled"));
        }
        let _ = call.reply.send(Err(TChannelError::Cancelled));
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<FrameOutcome> {
        let id = frame.id;
        match frame.body {
            FrameBody::InitRequest(_) | FrameBody::InitResponse(_) => Err(TChannelError::Protocol(
                "init frame after handshake completed".into(),
            )),
            FrameBody::CallRequest(body) => self.on_call_request(id, body).await,
            FrameBody::CallRequestContinue(body) => {
                self.on_call_request_continue(id, body).await
            }
            FrameBody::CallResponse(body) => self.on_call_response(id, body).await,
            FrameBody::CallResponseContinue(body) => {
                self.on_call_response_continue(id, body).await
            }
            FrameBody::Cancel(body) => {
                if self.incoming.remove(&id).is_some() {
                    tracing::debug!("inbound call {} cancelled by peer: {}", id, body.why);
                    self.tombstone(id);
                } else if self.outgoing.contains_key(&id) {
                    self.complete_outgoing(id, Err(TChannelError::Cancelled));
                    self.tombstone(id);
                } else {
                    tracing::debug!("cancel for unknown call {}", id);
                }
                Ok(FrameOutcome::Continue)
            }
            FrameBody::Claim(body) => {
                tracing::debug!("ignoring claim frame for call {} (ttl {}ms)", id, body.ttl_ms);
                Ok(FrameOutcome::Continue)
            }
            FrameBody::PingRequest => {
                self.send_frame(&Frame::new(id, FrameBody::PingResponse))
                    .await?;
                Ok(FrameOutcome::Continue)
            }
            FrameBody::PingResponse => {
                match self.pending_pings.remove(&id) {
                    Some(reply) => {
                        let _ = reply.send(Ok(()));
                    }
                    None => tracing::debug!("ping response without a pending ping: {}", id),
                }
                Ok(FrameOutcome::Continue)
            }
            FrameBody::Error(body) => self.on_error_frame(id, body),
        }
    }

    async fn on_call_request(&mut self, id: u32, body: CallRequestBody) -> Result<FrameOutcome> {
        if self.incoming.contains_key(&id) {
            // The peer reused an id that is still open: its fault, but the
            // shared framing state can no longer be trusted.
            self.send_error(id, ErrorCode::BadRequest, "call request for an in-flight id")
                .await;
            return Err(TChannelError::Protocol(format!(
                "duplicate call request for in-flight id {id}"
            )));
        }
        if self.tombstones.contains_key(&id) {
            tracing::debug!("discarding call request for terminated id {}", id);
            return Ok(FrameOutcome::Continue);
        }
        if body.ttl_ms == 0 {
            self.send_error(id, ErrorCode::BadRequest, "ttl must be positive")
                .await;
            return Ok(FrameOutcome::Continue);
        }

        let meta = RequestMeta {
            service: body.service,
            headers: body.headers,
            ttl_ms: body.ttl_ms,
            tracing: body.tracing,
            checksum_type: body.checksum_type,
        };
        let mut assembler = Assembler::new();
        match assembler.first_fragment(body.checksum_type, body.checksum, body.flags, &body.args) {
            Ok(Some(args)) => {
                self.deliver(id, meta, args).await;
                Ok(FrameOutcome::Continue)
            }
            Ok(None) => {
                let deadline = Instant::now() + Duration::from_millis(u64::from(meta.ttl_ms));
                self.deadlines
                    .push(Reverse((deadline, id, Direction::Incoming)));
                self.incoming.insert(
                    id,
                    IncomingCall {
                        assembler,
                        meta,
                        deadline,
                    },
                );
                Ok(FrameOutcome::Continue)
            }
            Err(TChannelError::BadRequest(message)) => {
                self.send_error(id, ErrorCode::BadRequest, &message).await;
                Ok(FrameOutcome::Continue)
            }
            Err(e) => Err(e),
        }
    }

    async fn on_call_request_continue(
        &mut self,
        id: u32,
        body: crate::protocol::ContinueBody,
    ) -> Result<FrameOutcome> {
        let Some(call) = self.incoming.get_mut(&id) else {
            if self.tombstones.contains_key(&id) {
                tracing::debug!("discarding late fragment for terminated id {}", id);
            } else {
                self.send_error(id, ErrorCode::BadRequest, "continue frame for unknown call")
                    .await;
            }
            return Ok(FrameOutcome::Continue);
        };

        match call
            .assembler
            .continue_fragment(body.checksum_type, body.checksum, body.flags, &body.args)
        {
            Ok(Some(args)) => {
                let Some(call) = self.incoming.remove(&id) else {
                    return Ok(FrameOutcome::Continue);
                };
                self.deliver(id, call.meta, args).await;
                Ok(FrameOutcome::Continue)
            }
            Ok(None) => Ok(FrameOutcome::Continue),
            Err(TChannelError::BadRequest(message)) => {
                self.incoming.remove(&id);
                self.tombstone(id);
                self.send_error(id, ErrorCode::BadRequest, &message).await;
                Ok(FrameOutcome::Continue)
            }
            Err(e) => Err(e),
        }
    }

    async fn on_call_response(&mut self, id: u32, body: CallResponseBody) -> Result<FrameOutcome> {
        let Some(call) = self.outgoing.get_mut(&id) else {
            if self.tombstones.contains_key(&id) {
                tracing::debug!("discarding late response for terminated id {}", id);
            } else {
                self.send_error(id, ErrorCode::BadRequest, "response for unknown call")
                    .await;
            }
            return Ok(FrameOutcome::Continue);
        };

        call.meta = Some(ResponseMeta {
            code: body.code,
            headers: body.headers,
            tracing: body.tracing,
        });
        match call
            .assembler
            .first_fragment(body.checksum_type, body.checksum, body.flags, &body.args)
        {
            Ok(Some(args)) => {
                self.finish_response(id, args);
                Ok(FrameOutcome::Continue)
            }
            Ok(None) => Ok(FrameOutcome::Continue),
            Err(TChannelError::BadRequest(message)) => {
                self.send_error(id, ErrorCode::BadRequest, &message).await;
                self.complete_outgoing(id, Err(TChannelError::BadRequest(message)));
                Ok(FrameOutcome::Continue)
            }
            Err(e) => Err(e),
        }
    }

    async fn on_call_response_continue(
        &mut self,
        id: u32,
        body: crate::protocol::ContinueBody,
    ) -> Result<FrameOutcome> {
        let Some(call) = self.outgoing.get_mut(&id) else {
            if self.tombstones.contains_key(&id) {
                tracing::debug!("discarding late fragment for terminated id {}", id);
            } else {
                self.send_error(id, ErrorCode::BadRequest, "continue frame for unknown call")
                    .await;
            }
            return Ok(FrameOutcome::Continue);
        };

        match call
            .assembler
            .continue_fragment(body.checksum_type, body.checksum, body.flags, &body.args)
        {
            Ok(Some(args)) => {
                self.finish_response(id, args);
                Ok(FrameOutcome::Continue)
            }
            Ok(None) => Ok(FrameOutcome::Continue),
            Err(TChannelError::BadRequest(message)) => {
                self.send_error(id, ErrorCode::BadRequest, &message).await;
                self.complete_outgoing(id, Err(TChannelError::BadRequest(message)));
                Ok(FrameOutcome::Continue)
            }
            Err(e) => Err(e),
        }
    }

    fn on_error_frame(&mut self, id: u32, body: ErrorBody) -> Result<FrameOutcome> {
        if id == CONNECTION_ID {
            tracing::error!("connection-level error from peer: {:?} {}", body.code, body.message);
            self.fail_all(|| TChannelError::from_peer(body.code, body.message.clone()));
            return Ok(FrameOutcome::Shutdown);
        }
        if self.outgoing.contains_key(&id) {
            self.complete_outgoing(id, Err(TChannelError::from_peer(body.code, body.message)));
        } else if self.incoming.remove(&id).is_some() {
            tracing::debug!("inbound call {} terminated by peer error {:?}", id, body.code);
            self.tombstone(id);
        } else {
            tracing::debug!("error frame for unknown call {}: {:?}", id, body.code);
        }
        Ok(FrameOutcome::Continue)
    }

    /// Hand a reassembled call upward; decline it if nobody is listening.
    async fn deliver(&mut self, id: u32, meta: RequestMeta, args: AssembledArgs) {
        let tracing_field = meta.tracing;
        let call = InboundCall {
            service: meta.service,
            ttl: Duration::from_millis(u64::from(meta.ttl_ms)),
            tracing: tracing_field,
            headers: meta.headers,
            arg1: args.arg1,
            arg2: args.arg2,
            arg3: args.arg3,
            responder: Responder {
                id,
                checksum_type: meta.checksum_type,
                tracing: tracing_field,
                writer: Some(self.writer.clone()),
            },
        };
        if self.inbound_tx.send(call).await.is_err() {
            tracing::warn!("no inbound receiver attached; declining call {}", id);
            self.send_error(id, ErrorCode::Declined, "no handler attached")
                .await;
        }
    }

    /// Complete an outgoing call from its reassembled response.
    fn finish_response(&mut self, id: u32, args: AssembledArgs) {
        let Some(call) = self.outgoing.get_mut(&id) else {
            return;
        };
        let Some(meta) = call.meta.take() else {
            return;
        };
        let response = CallResponse {
            code: meta.code,
            headers: meta.headers,
            arg1: args.arg1,
            arg2: args.arg2,
            arg3: args.arg3,
            tracing: meta.tracing,
        };
        self.complete_outgoing(id, Ok(response));
    }

    /// The single terminal transition for outgoing calls.
    fn complete_outgoing(&mut self, id: u32, result: Result<CallResponse>) {
        let Some(call) = self.outgoing.remove(&id) else {
            return;
        };
        if let Some(span) = call.span {
            let failure = match &result {
                Ok(response) if response.is_error() => Some("application error".to_string()),
                Ok(_) => None,
                Err(e) => Some(e.to_string()),
            };
            trace::finish_span(span, failure.as_deref());
        }
        let _ = call.reply.send(result);
    }

    /// Evict records whose deadline passed and purge expired tombstones.
    async fn tick(&mut self, now: Instant) {
        while let Some(Reverse((at, id, direction))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            match direction {
                Direction::Outgoing => {
                    // The heap entry may be stale: the id could have been
                    // completed and reused with a later deadline.
                    let expired = self
                        .outgoing
                        .get(&id)
                        .map(|call| call.deadline <= now)
                        .unwrap_or(false);
                    if expired {
                        let tracing_field =
                            self.outgoing.get(&id).map(|c| c.tracing).unwrap_or_default();
                        self.send_error_with_trace(
                            id,
                            ErrorCode::Timeout,
                            tracing_field,
                            "request timed out",
                        )
                        .await;
                        self.complete_outgoing(id, Err(TChannelError::Timeout));
                        self.tombstone(id);
                    }
                }
                Direction::Incoming => {
                    let expired = self
                        .incoming
                        .get(&id)
                        .map(|call| call.deadline <= now)
                        .unwrap_or(false);
                    if expired {
                        let call = self.incoming.remove(&id);
                        let tracing_field = call.map(|c| c.meta.tracing).unwrap_or_default();
                        self.send_error_with_trace(
                            id,
                            ErrorCode::Timeout,
                            tracing_field,
                            "call assembly exceeded ttl",
                        )
                        .await;
                        self.tombstone(id);
                    }
                }
            }
        }
        self.tombstones.retain(|_, expiry| *expiry > now);
    }

    fn tombstone(&mut self, id: u32) {
        self.tombstones
            .insert(id, Instant::now() + self.tombstone_ttl);
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.writer.send(frame.encode()?).await
    }

    async fn send_error(&self, id: u32, code: ErrorCode, message: &str) {
        self.send_error_with_trace(id, code, Trace::default(), message)
            .await;
    }

    async fn send_error_with_trace(&self, id: u32, code: ErrorCode, tracing: Trace, message: &str) {
        let frame = Frame::new(
            id,
            FrameBody::Error(ErrorBody {
                code,
                tracing,
                message: message.to_string(),
            }),
        );
        if let Err(e) = self.send_frame(&frame).await {
            tracing::warn!("failed to send error frame for call {}: {}", id, e);
        }
    }

    /// Unrecoverable protocol violation: tell the peer, fail everything.
    async fn shutdown_fatal(&mut self, error: TChannelError) {
        tracing::error!("fatal protocol error: {error}");
        self.send_error_with_trace(
            CONNECTION_ID,
            ErrorCode::FatalProtocolError,
            Trace::default(),
            &error.to_string(),
        )
        .await;
        self.fail_all(|| TChannelError::Network("connection closed after protocol error".into()));
    }

    /// Fail every in-flight call and pending ping with `make_error`'s value.
    fn fail_all(&mut self, mut make_error: impl FnMut() -> TChannelError) {
        for (_, call) in self.outgoing.drain() {
            let error = make_error();
            if let Some(span) = call.span {
                trace::finish_span(span, Some(&error.to_string()));
            }
            let _ = call.reply.send(Err(error));
        }
        for (_, reply) in self.pending_pings.drain() {
            let _ = reply.send(Err(make_error()));
        }
        self.incoming.clear();
    }
}
