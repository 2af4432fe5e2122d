//! Responder side of a connection: executing the peer's requests.
//!
//! The dispatch loop hands every reassembled request frame to
//! [`accept_request`], which validates the stream id, registers the
//! operation, and spawns the task that drives the matching [`Responder`]
//! function. The task's outcome decides the terminal frame: `Ok` sends
//! COMPLETE (or the single terminal payload for request-response), `Err`
//! sends an ERROR frame scoped to that stream. A CANCEL from the peer
//! aborts the task; a request-response result that arrives after
//! cancellation is discarded.

use std::sync::Arc;

use crate::connection::ConnectionShared;
use crate::flow_control::Limiter;
use crate::frame::RequestFrame;
use crate::handler::{PayloadSink, PayloadStream, Responder};
use crate::operation::{InteractionModel, Operation, Role};
use crate::registry::{StreamEntry, StreamEvent};

/// Route the first frame of a new stream to the responder.
pub(crate) fn accept_request(
    shared: &Arc<ConnectionShared>,
    responder: &Arc<dyn Responder>,
    frame: RequestFrame,
) {
    let stream_id = frame.stream_id;

    // Request frames must come from the peer's half of the id space.
    if shared.side().owns(stream_id) {
        shared.report_violation(&format!(
            "request frame on own-parity stream id {stream_id}"
        ));
        return;
    }
    if shared.registry.contains(stream_id) {
        shared.report_violation(&format!(
            "request frame for already active stream {stream_id}"
        ));
        return;
    }

    let Some(model) = InteractionModel::from_frame_type(frame.frame_type) else {
        shared.report_violation(&format!(
            "frame type {:?} cannot open a stream",
            frame.frame_type
        ));
        return;
    };

    tracing::debug!(stream_id, ?model, "incoming request");
    match model {
        InteractionModel::FireAndForget => spawn_fire_and_forget(responder, frame),
        InteractionModel::RequestResponse => spawn_request_response(shared, responder, frame),
        InteractionModel::RequestStream => spawn_request_stream(shared, responder, frame),
        InteractionModel::RequestChannel => spawn_request_channel(shared, responder, frame),
    }
}

/// No stream state survives the dispatch; handler failures are logged
/// and dropped, there is no one to tell.
fn spawn_fire_and_forget(responder: &Arc<dyn Responder>, frame: RequestFrame) {
    let responder = responder.clone();
    let stream_id = frame.stream_id;
    tokio::spawn(async move {
        if let Err(err) = responder.fire_and_forget(frame.payload).await {
            tracing::debug!(stream_id, %err, "fire-and-forget handler failed");
        }
    });
}

fn spawn_request_response(
    shared: &Arc<ConnectionShared>,
    responder: &Arc<dyn Responder>,
    frame: RequestFrame,
) {
    let stream_id = frame.stream_id;
    let mut operation = Operation::new(stream_id, InteractionModel::RequestResponse, Role::Responder);
    let _ = operation.activate();
    if shared
        .registry
        .insert(
            stream_id,
            StreamEntry {
                operation,
                events: None,
                limiter: None,
                responder_task: None,
                inbound_done: true,
                outbound_done: false,
            },
        )
        .is_err()
    {
        return;
    }

    let task_shared = shared.clone();
    let responder = responder.clone();
    let task = tokio::spawn(async move {
        match responder.request_response(frame.payload).await {
            Ok(response) => {
                // Already evicted means the requester cancelled while the
                // handler ran: stop and discard the result.
                if task_shared.registry.remove_completed(stream_id).is_some() {
                    if let Err(err) = task_shared
                        .send_request_frame(RequestFrame::next_complete(stream_id, response))
                        .await
                    {
                        tracing::debug!(stream_id, %err, "could not send response");
                    }
                }
            }
            Err(err) => {
                let _ = task_shared.error_outbound(stream_id, &err).await;
            }
        }
    });
    shared.registry.set_responder_task(stream_id, task.abort_handle());
}

fn spawn_request_stream(
    shared: &Arc<ConnectionShared>,
    responder: &Arc<dyn Responder>,
    frame: RequestFrame,
) {
    let stream_id = frame.stream_id;
    let limiter = Arc::new(Limiter::new(frame.initial_request));
    let mut operation = Operation::new(stream_id, InteractionModel::RequestStream, Role::Responder);
    let _ = operation.activate();
    if shared
        .registry
        .insert(
            stream_id,
            StreamEntry {
                operation,
                events: None,
                limiter: Some(limiter.clone()),
                responder_task: None,
                inbound_done: true,
                outbound_done: false,
            },
        )
        .is_err()
    {
        return;
    }

    let task_shared = shared.clone();
    let responder = responder.clone();
    let task = tokio::spawn(async move {
        let sink = PayloadSink::new(stream_id, task_shared.clone(), limiter, false);
        match responder.request_stream(frame.payload, sink).await {
            // Idempotent when the handler completed the sink itself.
            Ok(()) => {
                let _ = task_shared.complete_outbound(stream_id).await;
            }
            Err(err) => {
                let _ = task_shared.error_outbound(stream_id, &err).await;
            }
        }
    });
    shared.registry.set_responder_task(stream_id, task.abort_handle());
}

fn spawn_request_channel(
    shared: &Arc<ConnectionShared>,
    responder: &Arc<dyn Responder>,
    frame: RequestFrame,
) {
    let stream_id = frame.stream_id;
    let limiter = Arc::new(Limiter::new(frame.initial_request));
    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut operation = Operation::new(stream_id, InteractionModel::RequestChannel, Role::Responder);
    let _ = operation.activate();
    if shared
        .registry
        .insert(
            stream_id,
            StreamEntry {
                operation,
                events: Some(events_tx),
                limiter: Some(limiter.clone()),
                responder_task: None,
                inbound_done: false,
                outbound_done: false,
            },
        )
        .is_err()
    {
        return;
    }

    // The requester may half-close its direction on the request frame
    // itself.
    if frame.complete {
        shared.registry.deliver(stream_id, StreamEvent::Complete);
        shared.registry.finish_inbound(stream_id);
    }

    let task_shared = shared.clone();
    let responder = responder.clone();
    let task = tokio::spawn(async move {
        // The inbound stream grants its initial credit lazily via
        // REQUEST_N on first consumption; it does not cancel on drop -
        // the responder finishing without draining the requester's
        // payloads is not a cancellation.
        let requests = PayloadStream::new(
            stream_id,
            task_shared.clone(),
            events_rx,
            task_shared.new_strategy(),
            true,
            false,
        );
        let sink = PayloadSink::new(stream_id, task_shared.clone(), limiter, false);
        match responder.request_channel(frame.payload, requests, sink).await {
            Ok(()) => {
                let _ = task_shared.complete_outbound(stream_id).await;
            }
            Err(err) => {
                let _ = task_shared.error_outbound(stream_id, &err).await;
            }
        }
    });
    shared.registry.set_responder_task(stream_id, task.abort_handle());
}
