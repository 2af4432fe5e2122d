//! Prioritized outbound frame queue and the dedicated writer task.
//!
//! All outbound frames funnel through one queue drained by a single
//! writer task, so wire order is deterministic: stream-0 frames (setup,
//! keepalive, connection errors) drain before stream frames, FIFO within
//! each class.
//!
//! # Architecture
//!
//! ```text
//! Requester ──┐
//! Responder ──┼─► FrameQueue ─► writer task ─► TransportSink
//! Keepalive ──┘    (stream-0 channel has priority)
//! ```
//!
//! Channel-based rather than mutex-based: producers suspend when the
//! queue is full, which is one of the engine's three sanctioned
//! suspension points.

use tokio::sync::{mpsc, watch};

use crate::error::{RSocketError, Result};
use crate::frame::{self, Frame};
use crate::transport::TransportSink;

/// Default capacity of each queue class.
pub const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 256;

/// Handle for enqueueing outbound frames; cheaply cloneable.
#[derive(Clone)]
pub(crate) struct FrameQueue {
    priority_tx: mpsc::Sender<Frame>,
    stream_tx: mpsc::Sender<Frame>,
}

/// Receiving end drained by the writer task.
pub(crate) struct FrameQueueReceiver {
    priority_rx: mpsc::Receiver<Frame>,
    stream_rx: mpsc::Receiver<Frame>,
}

/// Create a connected queue with the given per-class capacity.
pub(crate) fn frame_queue(capacity: usize) -> (FrameQueue, FrameQueueReceiver) {
    let (priority_tx, priority_rx) = mpsc::channel(capacity);
    let (stream_tx, stream_rx) = mpsc::channel(capacity);
    (
        FrameQueue {
            priority_tx,
            stream_tx,
        },
        FrameQueueReceiver {
            priority_rx,
            stream_rx,
        },
    )
}

impl FrameQueue {
    fn class(&self, frame: &Frame) -> &mpsc::Sender<Frame> {
        if frame.stream_id() == 0 {
            &self.priority_tx
        } else {
            &self.stream_tx
        }
    }

    /// Enqueue a frame, suspending while the queue is full.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.class(&frame)
            .send(frame)
            .await
            .map_err(|_| RSocketError::ConnectionClosed)
    }

    /// Enqueue without suspending; `false` when full or closed.
    ///
    /// Used from teardown paths that cannot await.
    pub fn try_send(&self, frame: Frame) -> bool {
        self.class(&frame).try_send(frame).is_ok()
    }
}

impl FrameQueueReceiver {
    /// Next frame to write: stream-0 frames first, then FIFO.
    pub async fn recv(&mut self) -> Option<Frame> {
        if let Ok(frame) = self.priority_rx.try_recv() {
            return Some(frame);
        }
        tokio::select! {
            biased;
            priority = self.priority_rx.recv() => match priority {
                Some(frame) => Some(frame),
                None => self.stream_rx.recv().await,
            },
            stream = self.stream_rx.recv() => match stream {
                Some(frame) => Some(frame),
                None => self.priority_rx.recv().await,
            },
        }
    }

    /// Drain whatever is already queued, priority first, without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        if let Ok(frame) = self.priority_rx.try_recv() {
            return Some(frame);
        }
        self.stream_rx.try_recv().ok()
    }
}

/// Writer loop: encode and write frames until the queue closes or the
/// connection shuts down.
///
/// On shutdown the already-queued frames (at most one of which is the
/// final stream-0 ERROR frame) are flushed before exiting.
pub(crate) async fn writer_loop<S: TransportSink>(
    mut sink: S,
    mut queue: FrameQueueReceiver,
    mut closed: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            maybe = queue.recv() => match maybe {
                Some(out) => {
                    tracing::trace!(
                        frame_type = ?out.frame_type(),
                        stream_id = out.stream_id(),
                        "writing frame"
                    );
                    sink.send(frame::encode(&out)).await?;
                }
                None => return Ok(()),
            },
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
        }
    }

    // Connection closing: flush what is already queued, then stop.
    while let Some(out) = queue.try_recv() {
        sink.send(frame::encode(&out)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ErrorFrame, KeepAliveFrame, RequestFrame};
    use crate::payload::Payload;
    use crate::transport::{local_pair, Transport, TransportStream};
    use crate::error::ErrorCode;
    use bytes::Bytes;

    fn stream_frame(stream_id: u32) -> Frame {
        Frame::Request(RequestFrame::next(stream_id, Payload::from_static(b"x")))
    }

    fn keepalive_frame() -> Frame {
        Frame::KeepAlive(KeepAliveFrame {
            respond: true,
            last_position: 0,
            data: Bytes::new(),
        })
    }

    #[tokio::test]
    async fn test_stream_zero_takes_priority() {
        let (queue, mut rx) = frame_queue(16);

        queue.send(stream_frame(1)).await.unwrap();
        queue.send(stream_frame(3)).await.unwrap();
        queue.send(keepalive_frame()).await.unwrap();

        // The keepalive was enqueued last but drains first.
        assert_eq!(rx.recv().await.unwrap().stream_id(), 0);
        assert_eq!(rx.recv().await.unwrap().stream_id(), 1);
        assert_eq!(rx.recv().await.unwrap().stream_id(), 3);
    }

    #[tokio::test]
    async fn test_fifo_within_stream_class() {
        let (queue, mut rx) = frame_queue(16);
        for id in [1u32, 3, 5, 7] {
            queue.send(stream_frame(id)).await.unwrap();
        }
        for id in [1u32, 3, 5, 7] {
            assert_eq!(rx.recv().await.unwrap().stream_id(), id);
        }
    }

    #[tokio::test]
    async fn test_recv_none_after_senders_drop() {
        let (queue, mut rx) = frame_queue(4);
        queue.send(stream_frame(1)).await.unwrap();
        drop(queue);

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_writes_encoded_frames() {
        let (a, b) = local_pair(16);
        let (sink, _) = a.split();
        let (_, mut peer) = b.split();
        let (queue, rx) = frame_queue(16);
        let (_closed_tx, closed_rx) = watch::channel(false);

        let writer = tokio::spawn(writer_loop(sink, rx, closed_rx));

        let sent = stream_frame(9);
        queue.send(sent.clone()).await.unwrap();

        let bytes = peer.receive().await.unwrap().unwrap();
        assert_eq!(frame::decode(bytes).unwrap(), sent);

        drop(queue);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_writer_flushes_queued_error_frame_on_shutdown() {
        let (a, b) = local_pair(16);
        let (sink, _) = a.split();
        let (_, mut peer) = b.split();
        let (queue, rx) = frame_queue(16);
        let (closed_tx, closed_rx) = watch::channel(false);

        let writer = tokio::spawn(writer_loop(sink, rx, closed_rx));

        assert!(queue.try_send(Frame::Error(ErrorFrame {
            stream_id: 0,
            code: ErrorCode::CONNECTION_ERROR,
            message: "going down".into(),
        })));
        closed_tx.send(true).unwrap();

        let bytes = peer.receive().await.unwrap().unwrap();
        match frame::decode(bytes).unwrap() {
            Frame::Error(err) => assert_eq!(err.code, ErrorCode::CONNECTION_ERROR),
            other => panic!("unexpected frame: {other:?}"),
        }
        writer.await.unwrap().unwrap();
    }
}
