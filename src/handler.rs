//! Application-facing responder surface.
//!
//! A [`Responder`] handles the peer's requests: one function per
//! interaction model plus metadata push, each with a default
//! implementation answering `Rejected: ... not implemented`, so a handler
//! implements only the capabilities it has. [`RequestHandler`] assembles
//! a responder from closures without writing an impl block.
//!
//! [`PayloadSink`] and [`PayloadStream`] are the two halves of a payload
//! stream as seen by application code:
//!
//! - a sink emits payloads under flow control - `send` suspends while the
//!   peer has granted no credit;
//! - a stream consumes payloads and grants credit back, either through
//!   its [`RequestStrategy`] or through explicit
//!   [`request_n`](PayloadStream::request_n) calls.
//!
//! # Example
//!
//! ```ignore
//! let handler = RequestHandler::builder()
//!     .request_response(|payload| async move {
//!         Ok(Payload::from_data("pong"))
//!     })
//!     .request_stream(|_payload, mut sink| async move {
//!         for i in 0u32..5 {
//!             sink.send(Payload::from_data(i.to_string())).await?;
//!         }
//!         sink.complete().await
//!     })
//!     .build();
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::ConnectionShared;
use crate::error::{RSocketError, Result};
use crate::flow_control::{Limiter, RequestStrategy};
use crate::frame::{Frame, RequestFrame};
use crate::payload::Payload;
use crate::registry::StreamEvent;

/// Boxed future used by the closure-based handler slots.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

fn not_implemented(what: &str) -> RSocketError {
    RSocketError::rejected(format!("{what} not implemented"))
}

/// Per-connection request handler with four optional capability slots.
///
/// The connection engine invokes exactly the matching function when the
/// first frame of a new stream arrives; the defaults reject the request
/// on that stream only.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    /// Connection-level metadata, no response.
    async fn metadata_push(&self, metadata: Bytes) -> Result<()> {
        let _ = metadata;
        Err(not_implemented("metadata-push"))
    }

    /// Fire-and-forget: no stream state survives the dispatch.
    async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        let _ = payload;
        Err(not_implemented("fire-and-forget"))
    }

    /// Request-response: exactly one payload or an error.
    async fn request_response(&self, payload: Payload) -> Result<Payload> {
        let _ = payload;
        Err(not_implemented("request-response"))
    }

    /// Request-stream: emit into `responses` under the requester's
    /// credit; returning `Ok` completes the stream if the sink did not.
    async fn request_stream(&self, payload: Payload, responses: PayloadSink) -> Result<()> {
        let _ = (payload, responses);
        Err(not_implemented("request-stream"))
    }

    /// Request-channel: consume `requests` and emit into `responses`,
    /// both directions flow-controlled independently.
    async fn request_channel(
        &self,
        payload: Payload,
        requests: PayloadStream,
        responses: PayloadSink,
    ) -> Result<()> {
        let _ = (payload, requests, responses);
        Err(not_implemented("request-channel"))
    }
}

type MetadataPushFn = Box<dyn Fn(Bytes) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type FireAndForgetFn = Box<dyn Fn(Payload) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type RequestResponseFn = Box<dyn Fn(Payload) -> BoxFuture<'static, Result<Payload>> + Send + Sync>;
type RequestStreamFn =
    Box<dyn Fn(Payload, PayloadSink) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type RequestChannelFn = Box<
    dyn Fn(Payload, PayloadStream, PayloadSink) -> BoxFuture<'static, Result<()>> + Send + Sync,
>;

/// Closure-backed [`Responder`]; unset slots keep the rejecting defaults.
#[derive(Default)]
pub struct RequestHandler {
    metadata_push: Option<MetadataPushFn>,
    fire_and_forget: Option<FireAndForgetFn>,
    request_response: Option<RequestResponseFn>,
    request_stream: Option<RequestStreamFn>,
    request_channel: Option<RequestChannelFn>,
}

impl RequestHandler {
    /// Start building a handler.
    pub fn builder() -> RequestHandlerBuilder {
        RequestHandlerBuilder {
            handler: RequestHandler::default(),
        }
    }
}

/// Fluent builder for [`RequestHandler`].
pub struct RequestHandlerBuilder {
    handler: RequestHandler,
}

impl RequestHandlerBuilder {
    /// Handle connection-level metadata pushes.
    pub fn metadata_push<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handler.metadata_push = Some(Box::new(move |metadata| Box::pin(f(metadata))));
        self
    }

    /// Handle fire-and-forget requests.
    pub fn fire_and_forget<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handler.fire_and_forget = Some(Box::new(move |payload| Box::pin(f(payload))));
        self
    }

    /// Handle request-response requests.
    pub fn request_response<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.handler.request_response = Some(Box::new(move |payload| Box::pin(f(payload))));
        self
    }

    /// Handle request-stream requests.
    pub fn request_stream<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Payload, PayloadSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handler.request_stream = Some(Box::new(move |payload, sink| Box::pin(f(payload, sink))));
        self
    }

    /// Handle request-channel requests.
    pub fn request_channel<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Payload, PayloadStream, PayloadSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handler.request_channel =
            Some(Box::new(move |payload, stream, sink| Box::pin(f(payload, stream, sink))));
        self
    }

    pub fn build(self) -> RequestHandler {
        self.handler
    }

    /// Build directly into the `Arc` the engine wants.
    pub fn build_arc(self) -> Arc<dyn Responder> {
        Arc::new(self.handler)
    }
}

#[async_trait]
impl Responder for RequestHandler {
    async fn metadata_push(&self, metadata: Bytes) -> Result<()> {
        match &self.metadata_push {
            Some(f) => f(metadata).await,
            None => Err(not_implemented("metadata-push")),
        }
    }

    async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        match &self.fire_and_forget {
            Some(f) => f(payload).await,
            None => Err(not_implemented("fire-and-forget")),
        }
    }

    async fn request_response(&self, payload: Payload) -> Result<Payload> {
        match &self.request_response {
            Some(f) => f(payload).await,
            None => Err(not_implemented("request-response")),
        }
    }

    async fn request_stream(&self, payload: Payload, responses: PayloadSink) -> Result<()> {
        match &self.request_stream {
            Some(f) => f(payload, responses).await,
            None => Err(not_implemented("request-stream")),
        }
    }

    async fn request_channel(
        &self,
        payload: Payload,
        requests: PayloadStream,
        responses: PayloadSink,
    ) -> Result<()> {
        match &self.request_channel {
            Some(f) => f(payload, requests, responses).await,
            None => Err(not_implemented("request-channel")),
        }
    }
}

/// Flow-controlled outbound half of a payload stream.
///
/// [`send`](PayloadSink::send) suspends while the peer has granted no
/// credit; the waiting task is resumed when a REQUEST_N frame arrives,
/// and woken with an error when the stream or connection terminates.
pub struct PayloadSink {
    stream_id: u32,
    shared: Arc<ConnectionShared>,
    limiter: Arc<Limiter>,
    finished: bool,
    complete_on_drop: bool,
}

impl PayloadSink {
    pub(crate) fn new(
        stream_id: u32,
        shared: Arc<ConnectionShared>,
        limiter: Arc<Limiter>,
        complete_on_drop: bool,
    ) -> Self {
        Self {
            stream_id,
            shared,
            limiter,
            finished: false,
            complete_on_drop,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Emit one payload, suspending until the peer has granted credit.
    pub async fn send(&mut self, payload: Payload) -> Result<()> {
        if self.finished {
            return Err(RSocketError::invalid("payload sink already completed"));
        }
        self.limiter.acquire().await?;
        self.shared
            .send_request_frame(RequestFrame::next(self.stream_id, payload))
            .await
    }

    /// Complete this direction of the stream.
    pub async fn complete(mut self) -> Result<()> {
        self.finished = true;
        self.shared.complete_outbound(self.stream_id).await
    }

    /// Terminate the stream with an error.
    pub async fn error(mut self, error: RSocketError) -> Result<()> {
        self.finished = true;
        self.shared.error_outbound(self.stream_id, &error).await
    }
}

impl Drop for PayloadSink {
    fn drop(&mut self) {
        if self.complete_on_drop && !self.finished {
            self.shared.complete_outbound_sync(self.stream_id);
        }
    }
}

/// Inbound half of a payload stream.
///
/// Yields payloads in arrival order and grants credit back to the peer
/// through the stream's [`RequestStrategy`]. Dropping a requester-side
/// stream before it finished cancels the stream.
pub struct PayloadStream {
    stream_id: u32,
    shared: Arc<ConnectionShared>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    strategy: Box<dyn RequestStrategy>,
    grant_initial: bool,
    cancel_on_drop: bool,
    done: bool,
}

impl PayloadStream {
    pub(crate) fn new(
        stream_id: u32,
        shared: Arc<ConnectionShared>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        strategy: Box<dyn RequestStrategy>,
        grant_initial: bool,
        cancel_on_drop: bool,
    ) -> Self {
        Self {
            stream_id,
            shared,
            events,
            strategy,
            grant_initial,
            cancel_on_drop,
            done: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Next payload: `None` on completion, `Some(Err(..))` on stream
    /// error or cancellation.
    pub async fn next(&mut self) -> Option<Result<Payload>> {
        if self.done {
            return None;
        }
        if self.grant_initial {
            // Responder-side channel inbound: the initial credit was not
            // carried in a request frame, grant it on first consumption.
            self.grant_initial = false;
            let initial = self.strategy.first_request();
            if initial > 0 {
                if let Err(err) = self.send_request_n(initial).await {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        match self.events.recv().await {
            Some(StreamEvent::Payload(payload)) => {
                let refill = self.strategy.next_request();
                if refill > 0 {
                    if let Err(err) = self.send_request_n(refill).await {
                        tracing::debug!(
                            stream_id = self.stream_id,
                            %err,
                            "could not grant credit"
                        );
                    }
                }
                Some(Ok(payload))
            }
            Some(StreamEvent::Complete) | None => {
                self.done = true;
                None
            }
            Some(StreamEvent::Error(err)) => {
                self.done = true;
                Some(Err(err))
            }
            Some(StreamEvent::Cancelled) => {
                self.done = true;
                Some(Err(RSocketError::canceled("stream was cancelled by peer")))
            }
        }
    }

    /// Explicitly grant the peer `n` more payloads of credit.
    pub async fn request_n(&self, n: u32) -> Result<()> {
        if n == 0 || self.done {
            return Ok(());
        }
        self.send_request_n(n).await
    }

    async fn send_request_n(&self, n: u32) -> Result<()> {
        self.shared
            .send_frame(Frame::RequestN {
                stream_id: self.stream_id,
                request_n: n,
            })
            .await
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        if self.cancel_on_drop && !self.done {
            self.shared.cancel_local(self.stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unset_slots_reject() {
        let handler = RequestHandler::builder().build();

        let err = handler
            .request_response(Payload::from_static(b"x"))
            .await
            .unwrap_err();
        match err {
            RSocketError::Stream { code, message } => {
                assert_eq!(code, crate::error::ErrorCode::REJECTED);
                assert!(message.contains("not implemented"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(handler
            .fire_and_forget(Payload::empty())
            .await
            .unwrap_err()
            .to_string()
            .contains("not implemented"));
        assert!(handler
            .metadata_push(Bytes::new())
            .await
            .unwrap_err()
            .to_string()
            .contains("not implemented"));
    }

    #[tokio::test]
    async fn test_configured_slot_is_invoked() {
        let handler = RequestHandler::builder()
            .request_response(|payload| async move {
                assert_eq!(&payload.data[..], b"ping");
                Ok(Payload::from_static(b"pong"))
            })
            .fire_and_forget(|_| async { Ok(()) })
            .build();

        let response = handler
            .request_response(Payload::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(&response.data[..], b"pong");
        handler.fire_and_forget(Payload::empty()).await.unwrap();
    }
}
