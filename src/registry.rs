//! Per-connection stream registry.
//!
//! Maps stream ids to their live operation state: the event channel the
//! consuming task reads from, the outbound credit limiter, the responder
//! task handle, and the per-direction completion flags used by
//! request-channel termination (the stream is terminal only once both
//! directions are done; every other model starts with one direction
//! already closed).
//!
//! Membership changes are atomic: insertion happens when a stream starts,
//! removal exactly once when it reaches a terminal state. Each entry is
//! only ever mutated by the inbound dispatch loop plus the single task
//! driving its operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::{RSocketError, Result};
use crate::flow_control::Limiter;
use crate::operation::Operation;
use crate::payload::Payload;

/// Event delivered to the task consuming a stream's inbound direction.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Payload(Payload),
    Complete,
    Error(RSocketError),
    Cancelled,
}

/// Live state of one registered stream.
pub(crate) struct StreamEntry {
    pub operation: Operation,
    /// Where inbound payload/terminal events are routed; `None` when this
    /// side consumes nothing (responder of request-response/stream).
    pub events: Option<mpsc::UnboundedSender<StreamEvent>>,
    /// Credit for this side's outbound payloads; `None` when this side
    /// emits nothing.
    pub limiter: Option<Arc<Limiter>>,
    /// Responder task driving the operation, aborted on cancel.
    pub responder_task: Option<AbortHandle>,
    /// Peer-to-local direction has terminated.
    pub inbound_done: bool,
    /// Local-to-peer direction has terminated.
    pub outbound_done: bool,
}

/// Outcome of marking one direction of a stream finished.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FinishResult {
    /// No such stream (already terminal).
    Unknown,
    /// Direction marked done; the other direction is still open.
    Open,
    /// Both directions done; the entry was evicted.
    Terminated,
}

/// Map from stream id to the active operation, shared between the
/// dispatch loop and operation tasks.
#[derive(Default)]
pub(crate) struct StreamRegistry {
    streams: Mutex<HashMap<u32, StreamEntry>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically add a stream; fails on duplicate ids.
    pub fn insert(&self, stream_id: u32, entry: StreamEntry) -> Result<()> {
        let mut streams = self.streams.lock().unwrap();
        if streams.contains_key(&stream_id) {
            return Err(RSocketError::ProtocolViolation(format!(
                "stream {stream_id} already active"
            )));
        }
        streams.insert(stream_id, entry);
        Ok(())
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.streams.lock().unwrap().contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Mark the operation active (request frame on the wire).
    pub fn activate(&self, stream_id: u32) {
        if let Some(entry) = self.streams.lock().unwrap().get_mut(&stream_id) {
            if let Err(err) = entry.operation.activate() {
                tracing::debug!(stream_id, %err, "ignoring activation");
            }
        }
    }

    /// Attach the responder task handle to a freshly inserted entry.
    pub fn set_responder_task(&self, stream_id: u32, task: AbortHandle) {
        if let Some(entry) = self.streams.lock().unwrap().get_mut(&stream_id) {
            entry.responder_task = Some(task);
        }
    }

    /// Route an inbound event to the stream's consumer.
    ///
    /// Returns `false` for unknown streams. A consumer that has gone away
    /// (receiver dropped) counts as known: the event is discarded.
    pub fn deliver(&self, stream_id: u32, event: StreamEvent) -> bool {
        let streams = self.streams.lock().unwrap();
        match streams.get(&stream_id) {
            Some(entry) => {
                if let Some(events) = &entry.events {
                    if events.send(event).is_err() {
                        tracing::trace!(stream_id, "consumer gone, dropping event");
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Grant outbound credit from a REQUEST_N frame.
    ///
    /// Returns `false` for unknown streams.
    pub fn grant(&self, stream_id: u32, n: u32) -> bool {
        let streams = self.streams.lock().unwrap();
        match streams.get(&stream_id) {
            Some(entry) => {
                if let Some(limiter) = &entry.limiter {
                    limiter.grant(n);
                }
                true
            }
            None => false,
        }
    }

    /// Mark the peer-to-local direction finished.
    pub fn finish_inbound(&self, stream_id: u32) -> FinishResult {
        self.finish(stream_id, true)
    }

    /// Mark the local-to-peer direction finished.
    pub fn finish_outbound(&self, stream_id: u32) -> FinishResult {
        self.finish(stream_id, false)
    }

    fn finish(&self, stream_id: u32, inbound: bool) -> FinishResult {
        let mut streams = self.streams.lock().unwrap();
        let Some(entry) = streams.get_mut(&stream_id) else {
            return FinishResult::Unknown;
        };
        if inbound {
            entry.inbound_done = true;
        } else {
            entry.outbound_done = true;
        }
        if entry.inbound_done && entry.outbound_done {
            let mut entry = streams.remove(&stream_id).expect("entry present");
            let _ = entry.operation.terminate();
            FinishResult::Terminated
        } else {
            let _ = entry.operation.begin_completion();
            FinishResult::Open
        }
    }

    /// Remove a stream that was cancelled (either side).
    pub fn remove_cancelled(&self, stream_id: u32) -> Option<StreamEntry> {
        self.remove_with(stream_id, |op| op.cancel())
    }

    /// Remove a stream terminated by an error.
    pub fn remove_errored(&self, stream_id: u32) -> Option<StreamEntry> {
        self.remove_with(stream_id, |op| op.fail())
    }

    /// Remove a stream that completed with a single terminal frame
    /// (request-response).
    pub fn remove_completed(&self, stream_id: u32) -> Option<StreamEntry> {
        self.remove_with(stream_id, |op| op.terminate())
    }

    fn remove_with(
        &self,
        stream_id: u32,
        transition: impl FnOnce(&mut Operation) -> Result<()>,
    ) -> Option<StreamEntry> {
        let mut entry = self.streams.lock().unwrap().remove(&stream_id)?;
        if let Err(err) = transition(&mut entry.operation) {
            tracing::debug!(stream_id, %err, "terminal transition");
        }
        Some(entry)
    }

    /// Take every live entry out of the registry (connection failure).
    pub fn drain(&self) -> Vec<(u32, StreamEntry)> {
        let mut streams = self.streams.lock().unwrap();
        streams.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{InteractionModel, Role};

    fn entry(stream_id: u32, bidirectional: bool) -> (StreamEntry, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let model = if bidirectional {
            InteractionModel::RequestChannel
        } else {
            InteractionModel::RequestStream
        };
        (
            StreamEntry {
                operation: Operation::new(stream_id, model, Role::Requester),
                events: Some(tx),
                limiter: Some(Arc::new(Limiter::new(0))),
                responder_task: None,
                inbound_done: false,
                outbound_done: !bidirectional,
            },
            rx,
        )
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let registry = StreamRegistry::new();
        let (e1, _rx1) = entry(1, false);
        let (e2, _rx2) = entry(1, false);
        registry.insert(1, e1).unwrap();
        assert!(registry.insert(1, e2).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deliver_and_unknown_stream() {
        let registry = StreamRegistry::new();
        let (e, mut rx) = entry(3, false);
        registry.insert(3, e).unwrap();

        assert!(registry.deliver(3, StreamEvent::Payload(Payload::from_static(b"x"))));
        assert!(matches!(rx.try_recv(), Ok(StreamEvent::Payload(_))));

        assert!(!registry.deliver(5, StreamEvent::Complete));
        assert!(!registry.grant(5, 1));
    }

    #[test]
    fn test_unidirectional_stream_terminates_on_inbound_finish() {
        let registry = StreamRegistry::new();
        let (e, _rx) = entry(3, false);
        registry.insert(3, e).unwrap();
        registry.activate(3);

        assert_eq!(registry.finish_inbound(3), FinishResult::Terminated);
        assert!(!registry.contains(3));
        assert_eq!(registry.finish_inbound(3), FinishResult::Unknown);
    }

    #[test]
    fn test_channel_needs_both_directions() {
        let registry = StreamRegistry::new();
        let (e, _rx) = entry(7, true);
        registry.insert(7, e).unwrap();
        registry.activate(7);

        assert_eq!(registry.finish_inbound(7), FinishResult::Open);
        assert!(registry.contains(7));
        assert_eq!(registry.finish_outbound(7), FinishResult::Terminated);
        assert!(!registry.contains(7));
    }

    #[test]
    fn test_remove_cancelled_is_idempotent() {
        let registry = StreamRegistry::new();
        let (e, _rx) = entry(9, true);
        registry.insert(9, e).unwrap();
        registry.activate(9);

        // Concurrent cancel of both directions removes the entry exactly
        // once.
        assert!(registry.remove_cancelled(9).is_some());
        assert!(registry.remove_cancelled(9).is_none());
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = StreamRegistry::new();
        let (e1, _rx1) = entry(1, false);
        let (e3, _rx3) = entry(3, true);
        registry.insert(1, e1).unwrap();
        registry.insert(3, e3).unwrap();

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.len(), 0);
    }
}
