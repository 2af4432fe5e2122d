//! Connection engine: setup handshake, frame dispatch, and lifecycle.
//!
//! One [`Connection`] owns three tasks sharing a single cancellation
//! scope:
//!
//! 1. the inbound dispatch task - decodes frames, reassembles fragment
//!    chains, and routes them to the stream registry (or handles them
//!    directly for stream 0);
//! 2. the writer task - drains the prioritized outbound queue
//!    ([`queue`]) and writes to the transport;
//! 3. the keepalive task - probes the peer and fails the connection when
//!    it goes silent past the max lifetime.
//!
//! Clients are built with [`RSocketConnector`]: the SETUP frame goes out
//! immediately and the connection is `Established` without waiting for
//! acknowledgment (absence of an immediate stream-0 ERROR frame is the
//! acknowledgment). Servers are built with [`RSocketServer`]: the first
//! inbound frame must be a supported SETUP, the acceptor produces the
//! per-connection responder, and a rejection sends one stream-0 ERROR
//! frame before closing.

mod keepalive;
pub(crate) mod queue;

pub use keepalive::KeepAliveConfig;
pub use queue::DEFAULT_FRAME_QUEUE_CAPACITY;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::{ErrorCode, RSocketError, Result};
use crate::flow_control::{PrefetchStrategy, RequestStrategy};
use crate::fragmentation::{Fragmenter, Reassembler};
use crate::frame::{
    self, ErrorFrame, Frame, FrameType, KeepAliveFrame, RequestFrame, SetupFrame, Version,
};
use crate::handler::{BoxFuture, RequestHandler, Responder};
use crate::payload::Payload;
use crate::registry::{FinishResult, StreamEvent, StreamRegistry};
use crate::requester::RSocketRequester;
use crate::responder;
use crate::stream_id::{ConnectionSide, StreamIdAllocator};
use crate::transport::{Transport, TransportSink, TransportStream};

use keepalive::KeepAliveState;
use queue::{frame_queue, FrameQueue};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Server only: waiting for the client's SETUP frame.
    AwaitingSetup,
    /// Streams may be opened.
    Established,
    /// Teardown in progress; active streams are being failed.
    Closing,
    /// Final state.
    Closed,
}

/// Hook invoked for reported-and-ignored protocol violations.
pub(crate) type DiagnosticHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Produces one demand strategy per receiving stream.
pub(crate) type StrategyFactory = Arc<dyn Fn() -> Box<dyn RequestStrategy> + Send + Sync>;

type BoxAcceptor = Box<
    dyn Fn(SetupFrame, RSocketRequester) -> BoxFuture<'static, Result<Arc<dyn Responder>>>
        + Send
        + Sync,
>;

fn default_diagnostics() -> DiagnosticHook {
    Arc::new(|message| tracing::warn!(message, "protocol violation ignored"))
}

fn default_strategy_factory() -> StrategyFactory {
    Arc::new(|| Box::new(PrefetchStrategy::default()))
}

/// State shared by the connection tasks, the requester handle, and every
/// stream's sink/stream surface.
pub(crate) struct ConnectionShared {
    side: ConnectionSide,
    pub(crate) registry: StreamRegistry,
    queue: FrameQueue,
    fragmenter: Fragmenter,
    allocator: Mutex<StreamIdAllocator>,
    state: Mutex<ConnectionState>,
    tasks: Mutex<Vec<AbortHandle>>,
    closed_tx: watch::Sender<bool>,
    diagnostics: DiagnosticHook,
    strategy_factory: StrategyFactory,
}

impl ConnectionShared {
    fn new(
        side: ConnectionSide,
        queue: FrameQueue,
        fragmenter: Fragmenter,
        diagnostics: DiagnosticHook,
        strategy_factory: StrategyFactory,
        closed_tx: watch::Sender<bool>,
        initial_state: ConnectionState,
    ) -> Self {
        Self {
            side,
            registry: StreamRegistry::new(),
            queue,
            fragmenter,
            allocator: Mutex::new(StreamIdAllocator::new(side)),
            state: Mutex::new(initial_state),
            tasks: Mutex::new(Vec::new()),
            closed_tx,
            diagnostics,
            strategy_factory,
        }
    }

    pub fn side(&self) -> ConnectionSide {
        self.side
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_established(&self) {
        *self.state.lock().unwrap() = ConnectionState::Established;
    }

    pub fn ensure_active(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Established => Ok(()),
            _ => Err(RSocketError::ConnectionClosed),
        }
    }

    /// Report an ignored protocol violation.
    pub fn report_violation(&self, message: &str) {
        (self.diagnostics)(message);
    }

    /// Fresh demand strategy for a receiving stream.
    pub fn new_strategy(&self) -> Box<dyn RequestStrategy> {
        (self.strategy_factory)()
    }

    /// Allocate the next stream id; exhaustion fails the connection.
    pub fn next_stream_id(&self) -> Result<u32> {
        match self.allocator.lock().unwrap().next() {
            Ok(id) => Ok(id),
            Err(err) => {
                self.shutdown(ErrorCode::CONNECTION_ERROR, "stream ids exhausted", true);
                Err(err)
            }
        }
    }

    fn register_task(&self, task: AbortHandle) {
        self.tasks.lock().unwrap().push(task);
    }

    /// Enqueue one frame for the writer.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.queue.send(frame).await
    }

    /// Fragment (if configured) and enqueue a request/payload frame.
    pub async fn send_request_frame(&self, frame: RequestFrame) -> Result<()> {
        for fragment in self.fragmenter.fragment(frame) {
            self.queue.send(Frame::Request(fragment)).await?;
        }
        Ok(())
    }

    /// Finish this side's direction and send COMPLETE unless the stream
    /// is already terminal.
    pub async fn complete_outbound(&self, stream_id: u32) -> Result<()> {
        match self.registry.finish_outbound(stream_id) {
            FinishResult::Unknown => Ok(()),
            FinishResult::Open | FinishResult::Terminated => {
                self.send_frame(Frame::Request(RequestFrame::complete(stream_id)))
                    .await
            }
        }
    }

    /// Non-suspending variant for drop paths; enqueues best-effort.
    pub fn complete_outbound_sync(&self, stream_id: u32) {
        match self.registry.finish_outbound(stream_id) {
            FinishResult::Unknown => {}
            FinishResult::Open | FinishResult::Terminated => {
                if !self
                    .queue
                    .try_send(Frame::Request(RequestFrame::complete(stream_id)))
                {
                    tracing::debug!(stream_id, "could not enqueue COMPLETE during teardown");
                }
            }
        }
    }

    /// Terminate a stream with an ERROR frame; the whole stream (both
    /// directions) ends.
    pub async fn error_outbound(&self, stream_id: u32, error: &RSocketError) -> Result<()> {
        let Some(entry) = self.registry.remove_errored(stream_id) else {
            // Already cancelled or completed; nothing to report.
            return Ok(());
        };
        let (code, message) = error.to_stream_error();
        if let Some(limiter) = &entry.limiter {
            limiter.fail_errored(code, message.clone());
        }
        if let Some(events) = &entry.events {
            let _ = events.send(StreamEvent::Error(RSocketError::Stream {
                code,
                message: message.clone(),
            }));
        }
        self.send_frame(Frame::Error(ErrorFrame {
            stream_id,
            code,
            message,
        }))
        .await
    }

    /// Locally cancel a stream: evict it, stop its producer, and tell the
    /// peer with a CANCEL frame (the peer has not terminated it yet).
    pub fn cancel_local(&self, stream_id: u32) {
        let Some(entry) = self.registry.remove_cancelled(stream_id) else {
            return;
        };
        if let Some(limiter) = &entry.limiter {
            limiter.fail_cancelled();
        }
        if let Some(task) = &entry.responder_task {
            task.abort();
        }
        if !self.queue.try_send(Frame::Cancel { stream_id }) {
            tracing::debug!(stream_id, "could not enqueue CANCEL during teardown");
        }
    }

    /// Fail the connection: every active operation is failed with the
    /// same cause, the peer is (optionally) told with one stream-0 ERROR
    /// frame, and all connection tasks stop.
    pub fn shutdown(&self, code: ErrorCode, message: &str, notify_peer: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        tracing::debug!(side = ?self.side, %code, message, "closing connection");

        if notify_peer
            && !self.queue.try_send(Frame::Error(ErrorFrame {
                stream_id: 0,
                code,
                message: message.to_string(),
            }))
        {
            tracing::debug!("could not enqueue final ERROR frame");
        }

        for (stream_id, mut entry) in self.registry.drain() {
            tracing::trace!(stream_id, "failing stream with connection");
            let _ = entry.operation.fail();
            if let Some(limiter) = &entry.limiter {
                limiter.fail_closed();
            }
            if let Some(task) = &entry.responder_task {
                task.abort();
            }
            if let Some(events) = &entry.events {
                let _ = events.send(StreamEvent::Error(RSocketError::Connection {
                    code,
                    message: message.to_string(),
                }));
            }
        }

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        *self.state.lock().unwrap() = ConnectionState::Closed;
        // Tells the writer to flush what is queued (including the final
        // ERROR frame) and stop; closed() waiters wake here too.
        let _ = self.closed_tx.send(true);
    }
}

/// A live RSocket connection: requester handle plus lifecycle control.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    requester: RSocketRequester,
    closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Requester handle for issuing requests to the peer; cheaply
    /// cloneable and usable independently of this struct.
    pub fn requester(&self) -> RSocketRequester {
        self.requester.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.shared.state(),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    /// Gracefully close: active streams fail, the peer receives one
    /// `ConnectionClose` ERROR frame.
    pub fn close(&self) {
        self.shared
            .shutdown(ErrorCode::CONNECTION_CLOSE, "connection closed", true);
    }

    /// Wait until the connection is closed (locally or by the peer).
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Client-side connection builder.
///
/// # Example
///
/// ```ignore
/// let connection = RSocketConnector::new()
///     .keep_alive(Duration::from_secs(20), Duration::from_secs(90))
///     .mime_types("application/octet-stream", "application/json")
///     .connect(transport)
///     .await?;
/// let requester = connection.requester();
/// ```
pub struct RSocketConnector {
    keep_alive: KeepAliveConfig,
    metadata_mime_type: String,
    data_mime_type: String,
    setup_payload: Payload,
    resume_token: Option<Bytes>,
    max_fragment_size: usize,
    queue_capacity: usize,
    responder: Arc<dyn Responder>,
    strategy_factory: StrategyFactory,
    diagnostics: DiagnosticHook,
}

impl RSocketConnector {
    pub fn new() -> Self {
        Self {
            keep_alive: KeepAliveConfig::default(),
            metadata_mime_type: "application/octet-stream".to_string(),
            data_mime_type: "application/octet-stream".to_string(),
            setup_payload: Payload::empty(),
            resume_token: None,
            max_fragment_size: 0,
            queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            responder: Arc::new(RequestHandler::default()),
            strategy_factory: default_strategy_factory(),
            diagnostics: default_diagnostics(),
        }
    }

    /// Keepalive interval and max lifetime carried in SETUP.
    pub fn keep_alive(
        mut self,
        interval: std::time::Duration,
        max_lifetime: std::time::Duration,
    ) -> Self {
        self.keep_alive = KeepAliveConfig::new(interval, max_lifetime);
        self
    }

    /// Metadata and data MIME types carried in SETUP.
    pub fn mime_types(mut self, metadata_mime_type: &str, data_mime_type: &str) -> Self {
        self.metadata_mime_type = metadata_mime_type.to_string();
        self.data_mime_type = data_mime_type.to_string();
        self
    }

    /// Payload carried in SETUP and handed to the server's acceptor.
    pub fn setup_payload(mut self, payload: Payload) -> Self {
        self.setup_payload = payload;
        self
    }

    /// Opaque resume token carried in SETUP (resumption itself is not
    /// implemented by this engine).
    pub fn resume_token(mut self, token: Bytes) -> Self {
        self.resume_token = Some(token);
        self
    }

    /// Split outbound payloads into fragments of at most this many
    /// payload bytes; 0 disables fragmentation.
    pub fn max_fragment_size(mut self, max_fragment_size: usize) -> Self {
        self.max_fragment_size = max_fragment_size;
        self
    }

    /// Capacity of each outbound queue class.
    pub fn frame_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Responder for requests initiated by the server.
    pub fn request_handler(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    /// Demand window for receiving streams opened by this side.
    pub fn prefetch(mut self, request_size: u32, request_on: u32) -> Self {
        self.strategy_factory = Arc::new(move || Box::new(PrefetchStrategy::new(request_size, request_on)));
        self
    }

    /// Hook for reported-and-ignored protocol violations.
    pub fn diagnostics(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.diagnostics = Arc::new(hook);
        self
    }

    /// Connect over `transport`: send SETUP and establish immediately.
    pub async fn connect<T: Transport>(self, transport: T) -> Result<Connection> {
        let (transport_sink, transport_stream) = transport.split();
        let (queue, queue_rx) = frame_queue(self.queue_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(ConnectionShared::new(
            ConnectionSide::Client,
            queue,
            Fragmenter::new(self.max_fragment_size),
            self.diagnostics,
            self.strategy_factory,
            closed_tx,
            ConnectionState::Established,
        ));

        shared
            .send_frame(Frame::Setup(SetupFrame {
                version: Version::V1_0,
                honor_lease: false,
                keep_alive_interval: self.keep_alive.interval,
                keep_alive_max_lifetime: self.keep_alive.max_lifetime,
                resume_token: self.resume_token,
                metadata_mime_type: self.metadata_mime_type,
                data_mime_type: self.data_mime_type,
                payload: self.setup_payload,
            }))
            .await?;
        tracing::debug!("client connection established");

        Ok(start_connection(
            shared,
            transport_sink,
            transport_stream,
            queue_rx,
            closed_rx,
            self.responder,
            self.keep_alive,
        ))
    }
}

impl Default for RSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side handshake for one accepted transport connection.
///
/// # Example
///
/// ```ignore
/// let connection = RSocketServer::new()
///     .acceptor(|setup, _requester| async move {
///         Ok(RequestHandler::builder()
///             .request_response(|p| async move { Ok(p) })
///             .build_arc())
///     })
///     .accept(transport)
///     .await?;
/// ```
pub struct RSocketServer {
    acceptor: BoxAcceptor,
    max_fragment_size: usize,
    queue_capacity: usize,
    strategy_factory: StrategyFactory,
    diagnostics: DiagnosticHook,
}

impl RSocketServer {
    pub fn new() -> Self {
        Self {
            acceptor: Box::new(|_setup, _requester| {
                Box::pin(async { Ok(Arc::new(RequestHandler::default()) as Arc<dyn Responder>) })
            }),
            max_fragment_size: 0,
            queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            strategy_factory: default_strategy_factory(),
            diagnostics: default_diagnostics(),
        }
    }

    /// Produce the per-connection responder from the decoded SETUP and a
    /// requester handle for server-initiated requests. Returning an error
    /// rejects the setup: the client receives one `RejectedSetup` ERROR
    /// frame and the connection closes.
    pub fn acceptor<F, Fut>(mut self, acceptor: F) -> Self
    where
        F: Fn(SetupFrame, RSocketRequester) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Arc<dyn Responder>>> + Send + 'static,
    {
        self.acceptor = Box::new(move |setup, requester| Box::pin(acceptor(setup, requester)));
        self
    }

    /// See [`RSocketConnector::max_fragment_size`].
    pub fn max_fragment_size(mut self, max_fragment_size: usize) -> Self {
        self.max_fragment_size = max_fragment_size;
        self
    }

    /// See [`RSocketConnector::frame_queue_capacity`].
    pub fn frame_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// See [`RSocketConnector::prefetch`].
    pub fn prefetch(mut self, request_size: u32, request_on: u32) -> Self {
        self.strategy_factory = Arc::new(move || Box::new(PrefetchStrategy::new(request_size, request_on)));
        self
    }

    /// See [`RSocketConnector::diagnostics`].
    pub fn diagnostics(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.diagnostics = Arc::new(hook);
        self
    }

    /// Serve one connection: await SETUP, validate it, run the acceptor.
    pub async fn accept<T: Transport>(self, transport: T) -> Result<Connection> {
        let (mut transport_sink, mut transport_stream) = transport.split();

        let first = transport_stream
            .receive()
            .await
            .map_err(RSocketError::Io)?
            .ok_or(RSocketError::ConnectionClosed)?;
        let setup = match frame::decode(first) {
            Ok(Frame::Setup(setup)) => setup,
            Ok(Frame::Resume(_)) => {
                return Err(reject_setup(
                    &mut transport_sink,
                    ErrorCode::REJECTED_RESUME,
                    "resumption is not supported".to_string(),
                )
                .await);
            }
            Ok(other) => {
                return Err(reject_setup(
                    &mut transport_sink,
                    ErrorCode::INVALID_SETUP,
                    format!("first frame must be SETUP, was {:?}", other.frame_type()),
                )
                .await);
            }
            Err(err) => {
                return Err(reject_setup(
                    &mut transport_sink,
                    ErrorCode::INVALID_SETUP,
                    format!("could not parse first frame: {err}"),
                )
                .await);
            }
        };

        if setup.version.major != Version::V1_0.major {
            return Err(reject_setup(
                &mut transport_sink,
                ErrorCode::UNSUPPORTED_SETUP,
                format!("unsupported protocol version {}", setup.version),
            )
            .await);
        }
        if setup.honor_lease {
            return Err(reject_setup(
                &mut transport_sink,
                ErrorCode::UNSUPPORTED_SETUP,
                "lease is not supported".to_string(),
            )
            .await);
        }

        let keep_alive =
            KeepAliveConfig::new(setup.keep_alive_interval, setup.keep_alive_max_lifetime);
        let (queue, queue_rx) = frame_queue(self.queue_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(ConnectionShared::new(
            ConnectionSide::Server,
            queue,
            Fragmenter::new(self.max_fragment_size),
            self.diagnostics,
            self.strategy_factory,
            closed_tx,
            ConnectionState::AwaitingSetup,
        ));
        let requester = RSocketRequester::new(shared.clone());

        let responder = match (self.acceptor)(setup, requester.clone()).await {
            Ok(responder) => responder,
            Err(err) => {
                return Err(reject_setup(
                    &mut transport_sink,
                    ErrorCode::REJECTED_SETUP,
                    err.to_string(),
                )
                .await);
            }
        };

        shared.set_established();
        tracing::debug!("server connection established");
        Ok(start_connection(
            shared,
            transport_sink,
            transport_stream,
            queue_rx,
            closed_rx,
            responder,
            keep_alive,
        ))
    }
}

impl Default for RSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Send one stream-0 ERROR frame and produce the matching local error.
async fn reject_setup<S: TransportSink>(
    sink: &mut S,
    code: ErrorCode,
    message: String,
) -> RSocketError {
    let frame = Frame::Error(ErrorFrame {
        stream_id: 0,
        code,
        message: message.clone(),
    });
    if let Err(err) = sink.send(frame::encode(&frame)).await {
        tracing::debug!(%err, "could not send setup rejection");
    }
    RSocketError::Connection { code, message }
}

/// Spawn the writer, dispatch, and keepalive tasks for an established
/// connection.
fn start_connection<Sk, St>(
    shared: Arc<ConnectionShared>,
    transport_sink: Sk,
    transport_stream: St,
    queue_rx: queue::FrameQueueReceiver,
    closed_rx: watch::Receiver<bool>,
    responder: Arc<dyn Responder>,
    keep_alive: KeepAliveConfig,
) -> Connection
where
    Sk: TransportSink,
    St: TransportStream,
{
    let keepalive_state = Arc::new(KeepAliveState::new());

    // The writer holds no reference to the shared state: it exits on
    // write error, when the queue closes, or when the close signal fires
    // (flushing the final frames first).
    tokio::spawn({
        let closed_rx = closed_rx.clone();
        async move {
            if let Err(err) = queue::writer_loop(transport_sink, queue_rx, closed_rx).await {
                tracing::debug!(%err, "writer stopped");
            }
        }
    });

    let dispatch = tokio::spawn(dispatch_loop(
        transport_stream,
        shared.clone(),
        responder,
        keepalive_state.clone(),
    ));
    shared.register_task(dispatch.abort_handle());

    let keepalive_task = tokio::spawn({
        let shared = shared.clone();
        let queue = shared.queue.clone();
        async move {
            if let Err(err) = keepalive::keepalive_loop(keep_alive, keepalive_state, queue).await {
                let (code, message) = match &err {
                    RSocketError::Connection { code, message } => (*code, message.clone()),
                    other => (ErrorCode::CONNECTION_ERROR, other.to_string()),
                };
                shared.shutdown(code, &message, true);
            }
        }
    });
    shared.register_task(keepalive_task.abort_handle());

    Connection {
        requester: RSocketRequester::new(shared.clone()),
        shared,
        closed: closed_rx,
    }
}

/// Inbound dispatch: read, decode, reassemble, route.
async fn dispatch_loop<S: TransportStream>(
    mut transport_stream: S,
    shared: Arc<ConnectionShared>,
    responder: Arc<dyn Responder>,
    keepalive: Arc<KeepAliveState>,
) {
    let mut reassembler = Reassembler::new();
    loop {
        let bytes = match transport_stream.receive().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::debug!("transport reached end of stream");
                shared.shutdown(
                    ErrorCode::CONNECTION_CLOSE,
                    "connection closed by peer",
                    false,
                );
                return;
            }
            Err(err) => {
                shared.shutdown(
                    ErrorCode::CONNECTION_ERROR,
                    &format!("transport failed: {err}"),
                    false,
                );
                return;
            }
        };

        let decoded = match frame::decode(bytes.clone()) {
            Ok(decoded) => decoded,
            Err(RSocketError::ProtocolViolation(message)) => {
                // Ignore-and-report, unless the violation is on stream 0.
                if frame::peek_stream_id(&bytes) == 0 {
                    shared.shutdown(ErrorCode::CONNECTION_ERROR, &message, true);
                    return;
                }
                shared.report_violation(&message);
                continue;
            }
            Err(err) => {
                // Malformed wire data is always fatal.
                shared.shutdown(ErrorCode::CONNECTION_ERROR, &err.to_string(), true);
                return;
            }
        };

        if handle_frame(&shared, &responder, &keepalive, &mut reassembler, decoded).await {
            return;
        }
    }
}

/// Handle one decoded frame; `true` means the connection is done.
async fn handle_frame(
    shared: &Arc<ConnectionShared>,
    responder: &Arc<dyn Responder>,
    keepalive: &Arc<KeepAliveState>,
    reassembler: &mut Reassembler,
    decoded: Frame,
) -> bool {
    match decoded {
        Frame::Setup(_) => {
            shared.shutdown(
                ErrorCode::CONNECTION_ERROR,
                "unexpected SETUP frame on established connection",
                true,
            );
            true
        }
        Frame::Resume(_) | Frame::ResumeOk { .. } => {
            shared.shutdown(
                ErrorCode::CONNECTION_ERROR,
                "unexpected resumption frame on established connection",
                true,
            );
            true
        }
        Frame::Lease(_) => {
            shared.report_violation("LEASE frame ignored: lease is not supported");
            false
        }
        Frame::KeepAlive(frame) => {
            keepalive.mark_received();
            if frame.respond {
                let echo = Frame::KeepAlive(KeepAliveFrame {
                    respond: false,
                    last_position: frame.last_position,
                    data: frame.data,
                });
                if shared.send_frame(echo).await.is_err() {
                    return true;
                }
            }
            false
        }
        Frame::MetadataPush { metadata } => {
            let responder = responder.clone();
            tokio::spawn(async move {
                if let Err(err) = responder.metadata_push(metadata).await {
                    tracing::debug!(%err, "metadata push handler failed");
                }
            });
            false
        }
        Frame::Error(frame) if frame.stream_id == 0 => {
            tracing::debug!(code = %frame.code, message = %frame.message, "connection error from peer");
            shared.shutdown(frame.code, &frame.message, false);
            true
        }
        Frame::Error(frame) => {
            handle_stream_error(shared, reassembler, frame);
            false
        }
        Frame::RequestN {
            stream_id,
            request_n,
        } => {
            if !shared.registry.grant(stream_id, request_n) {
                shared.report_violation(&format!("REQUEST_N for unknown stream {stream_id}"));
            }
            false
        }
        Frame::Cancel { stream_id } => {
            handle_cancel(shared, reassembler, stream_id);
            false
        }
        Frame::Extension(frame) => {
            shared.report_violation(&format!(
                "ignoring EXTENSION frame (extended type 0x{:08X}) on stream {}",
                frame.extended_type, frame.stream_id
            ));
            false
        }
        Frame::Request(frame) => {
            let Some(logical) = reassembler.push(frame) else {
                return false;
            };
            if logical.frame_type == FrameType::Payload {
                handle_payload(shared, logical);
            } else {
                responder::accept_request(shared, responder, logical);
            }
            false
        }
    }
}

fn handle_payload(shared: &Arc<ConnectionShared>, frame: RequestFrame) {
    let stream_id = frame.stream_id;
    if !frame.next && !frame.complete {
        shared.report_violation(&format!(
            "PAYLOAD frame without NEXT or COMPLETE on stream {stream_id}"
        ));
        return;
    }

    let complete = frame.complete;
    let known = if frame.next {
        shared
            .registry
            .deliver(stream_id, StreamEvent::Payload(frame.payload))
    } else {
        shared.registry.contains(stream_id)
    };
    if !known {
        shared.report_violation(&format!("PAYLOAD frame for unknown stream {stream_id}"));
        return;
    }

    if complete {
        shared.registry.deliver(stream_id, StreamEvent::Complete);
        if shared.registry.finish_inbound(stream_id) == FinishResult::Terminated {
            tracing::trace!(stream_id, "stream terminated");
        }
    }
}

fn handle_stream_error(
    shared: &Arc<ConnectionShared>,
    reassembler: &mut Reassembler,
    frame: ErrorFrame,
) {
    let stream_id = frame.stream_id;
    reassembler.evict(stream_id);
    match shared.registry.remove_errored(stream_id) {
        Some(entry) => {
            if let Some(limiter) = &entry.limiter {
                limiter.fail_errored(frame.code, frame.message.clone());
            }
            if let Some(task) = &entry.responder_task {
                task.abort();
            }
            if let Some(events) = &entry.events {
                let _ = events.send(StreamEvent::Error(RSocketError::from_frame(
                    stream_id,
                    frame.code,
                    frame.message,
                )));
            }
        }
        None => shared.report_violation(&format!("ERROR frame for unknown stream {stream_id}")),
    }
}

fn handle_cancel(shared: &Arc<ConnectionShared>, reassembler: &mut Reassembler, stream_id: u32) {
    reassembler.evict(stream_id);
    match shared.registry.remove_cancelled(stream_id) {
        Some(entry) => {
            if let Some(limiter) = &entry.limiter {
                limiter.fail_cancelled();
            }
            if let Some(task) = &entry.responder_task {
                task.abort();
            }
            if let Some(events) = &entry.events {
                let _ = events.send(StreamEvent::Cancelled);
            }
        }
        None => shared.report_violation(&format!("CANCEL for unknown stream {stream_id}")),
    }
}
