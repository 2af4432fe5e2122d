//! Requester side of a connection: issuing requests to the peer.
//!
//! [`RSocketRequester`] is the application-facing handle for the four
//! interaction models plus metadata push. It is cheaply cloneable and
//! usable from any task; every request allocates a fresh stream id,
//! registers the stream, and enqueues the (possibly fragmented) request
//! frame.
//!
//! Cancellation is tied to ownership: dropping a pending
//! `request_response` future or an unfinished [`PayloadStream`] cancels
//! the stream, which evicts it locally and sends one CANCEL frame to the
//! peer.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::ConnectionShared;
use crate::error::{RSocketError, Result};
use crate::flow_control::{Limiter, RequestStrategy};
use crate::frame::{Frame, RequestFrame};
use crate::handler::{PayloadSink, PayloadStream};
use crate::operation::{InteractionModel, Operation, Role};
use crate::payload::Payload;
use crate::registry::{StreamEntry, StreamEvent};

/// Handle for issuing requests on an established connection.
#[derive(Clone)]
pub struct RSocketRequester {
    shared: Arc<ConnectionShared>,
}

impl RSocketRequester {
    pub(crate) fn new(shared: Arc<ConnectionShared>) -> Self {
        Self { shared }
    }

    /// Whether the connection still accepts requests.
    pub fn is_active(&self) -> bool {
        self.shared.ensure_active().is_ok()
    }

    /// Push connection-level metadata; no stream, no response.
    pub async fn metadata_push(&self, metadata: Bytes) -> Result<()> {
        self.shared.ensure_active()?;
        self.shared.send_frame(Frame::MetadataPush { metadata }).await
    }

    /// Fire-and-forget: one frame out, the stream is terminal as soon as
    /// it is sent. Delivery is not guaranteed and no responder state
    /// survives the dispatch.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        self.shared.ensure_active()?;
        let stream_id = self.shared.next_stream_id()?;
        self.shared
            .send_request_frame(RequestFrame::fire_and_forget(stream_id, payload))
            .await?;
        tracing::trace!(stream_id, "fire-and-forget sent");
        Ok(())
    }

    /// Request-response: exactly one payload or a typed failure.
    ///
    /// Dropping the returned future before it resolves cancels the
    /// request; the responder stops producing and the result is
    /// discarded.
    pub async fn request_response(&self, payload: Payload) -> Result<Payload> {
        self.shared.ensure_active()?;
        let stream_id = self.shared.next_stream_id()?;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        self.shared.registry.insert(
            stream_id,
            StreamEntry {
                operation: Operation::new(
                    stream_id,
                    InteractionModel::RequestResponse,
                    Role::Requester,
                ),
                events: Some(events_tx),
                limiter: None,
                responder_task: None,
                inbound_done: false,
                outbound_done: true,
            },
        )?;

        let mut guard = CancelGuard::new(self.shared.clone(), stream_id);
        if let Err(err) = self
            .shared
            .send_request_frame(RequestFrame::request_response(stream_id, payload))
            .await
        {
            guard.disarm();
            self.shared.registry.remove_errored(stream_id);
            return Err(err);
        }
        self.shared.registry.activate(stream_id);

        let outcome = match events_rx.recv().await {
            Some(StreamEvent::Payload(response)) => Ok(response),
            Some(StreamEvent::Complete) => Err(RSocketError::invalid(
                "request-response completed without a payload",
            )),
            Some(StreamEvent::Error(err)) => Err(err),
            Some(StreamEvent::Cancelled) => {
                Err(RSocketError::canceled("request was cancelled by peer"))
            }
            None => Err(RSocketError::ConnectionClosed),
        };
        guard.disarm();
        outcome
    }

    /// Request-stream with the connection's default demand strategy.
    pub async fn request_stream(&self, payload: Payload) -> Result<PayloadStream> {
        let strategy = self.shared.new_strategy();
        self.request_stream_with(payload, strategy).await
    }

    /// Request-stream with an explicit demand strategy; the strategy's
    /// first request becomes the frame's initial request count.
    pub async fn request_stream_with(
        &self,
        payload: Payload,
        strategy: impl RequestStrategy,
    ) -> Result<PayloadStream> {
        self.shared.ensure_active()?;
        let mut strategy: Box<dyn RequestStrategy> = Box::new(strategy);
        let initial_request = strategy.first_request();
        let stream_id = self.shared.next_stream_id()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.shared.registry.insert(
            stream_id,
            StreamEntry {
                operation: Operation::new(
                    stream_id,
                    InteractionModel::RequestStream,
                    Role::Requester,
                ),
                events: Some(events_tx),
                limiter: None,
                responder_task: None,
                inbound_done: false,
                outbound_done: true,
            },
        )?;

        if let Err(err) = self
            .shared
            .send_request_frame(RequestFrame::request_stream(
                stream_id,
                initial_request,
                payload,
            ))
            .await
        {
            self.shared.registry.remove_errored(stream_id);
            return Err(err);
        }
        self.shared.registry.activate(stream_id);

        Ok(PayloadStream::new(
            stream_id,
            self.shared.clone(),
            events_rx,
            strategy,
            false,
            true,
        ))
    }

    /// Request-channel with the connection's default demand strategy.
    pub async fn request_channel(&self, payload: Payload) -> Result<(PayloadSink, PayloadStream)> {
        let strategy = self.shared.new_strategy();
        self.request_channel_with(payload, strategy).await
    }

    /// Request-channel: returns the flow-controlled outbound sink and the
    /// inbound stream. The outbound direction starts with zero credit and
    /// waits for the responder's REQUEST_N; completing the sink
    /// half-closes the channel, and either side cancelling ends both
    /// directions.
    pub async fn request_channel_with(
        &self,
        payload: Payload,
        strategy: impl RequestStrategy,
    ) -> Result<(PayloadSink, PayloadStream)> {
        self.shared.ensure_active()?;
        let mut strategy: Box<dyn RequestStrategy> = Box::new(strategy);
        let initial_request = strategy.first_request();
        let stream_id = self.shared.next_stream_id()?;
        let limiter = Arc::new(Limiter::new(0));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.shared.registry.insert(
            stream_id,
            StreamEntry {
                operation: Operation::new(
                    stream_id,
                    InteractionModel::RequestChannel,
                    Role::Requester,
                ),
                events: Some(events_tx),
                limiter: Some(limiter.clone()),
                responder_task: None,
                inbound_done: false,
                outbound_done: false,
            },
        )?;

        if let Err(err) = self
            .shared
            .send_request_frame(RequestFrame::request_channel(
                stream_id,
                initial_request,
                payload,
            ))
            .await
        {
            self.shared.registry.remove_errored(stream_id);
            return Err(err);
        }
        self.shared.registry.activate(stream_id);

        let sink = PayloadSink::new(stream_id, self.shared.clone(), limiter, true);
        let stream = PayloadStream::new(
            stream_id,
            self.shared.clone(),
            events_rx,
            strategy,
            false,
            true,
        );
        Ok((sink, stream))
    }
}

/// Cancels the stream when a request future is dropped mid-flight.
struct CancelGuard {
    shared: Arc<ConnectionShared>,
    stream_id: u32,
    armed: bool,
}

impl CancelGuard {
    fn new(shared: Arc<ConnectionShared>, stream_id: u32) -> Self {
        Self {
            shared,
            stream_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cancel_local(self.stream_id);
        }
    }
}
