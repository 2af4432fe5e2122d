//! Transport seam: how the engine talks to the outside world.
//!
//! A transport is any duplex, message-oriented byte channel: it accepts
//! whole encoded frames for sending and yields whole encoded frames on
//! receive. TCP, WebSocket and similar adapters live outside this crate;
//! the engine only ever sees the two halves below. No blocking I/O
//! happens here - both operations are asynchronous suspension points.
//!
//! [`local_pair`] provides the in-process transport used by the tests
//! and by same-process client/server wiring: two channel-backed endpoints
//! whose send side feeds the peer's receive side.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Outbound half of a transport: accepts one encoded frame per call.
#[async_trait]
pub trait TransportSink: Send + 'static {
    async fn send(&mut self, frame: Bytes) -> std::io::Result<()>;
}

/// Inbound half of a transport: yields whole encoded frames, `None` on
/// end-of-stream.
#[async_trait]
pub trait TransportStream: Send + 'static {
    async fn receive(&mut self) -> std::io::Result<Option<Bytes>>;
}

/// A duplex frame transport, split into its two halves by the engine.
pub trait Transport: Send + 'static {
    type Sink: TransportSink;
    type Stream: TransportStream;

    fn split(self) -> (Self::Sink, Self::Stream);
}

/// In-process transport endpoint backed by bounded channels.
pub struct LocalTransport {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

/// Send half of a [`LocalTransport`].
pub struct LocalSink {
    tx: mpsc::Sender<Bytes>,
}

/// Receive half of a [`LocalTransport`].
pub struct LocalStream {
    rx: mpsc::Receiver<Bytes>,
}

/// Create a connected pair of in-process transports.
///
/// `capacity` bounds the number of frames in flight per direction;
/// senders suspend when the peer is slow.
pub fn local_pair(capacity: usize) -> (LocalTransport, LocalTransport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        LocalTransport { tx: a_tx, rx: b_rx },
        LocalTransport { tx: b_tx, rx: a_rx },
    )
}

impl Transport for LocalTransport {
    type Sink = LocalSink;
    type Stream = LocalStream;

    fn split(self) -> (LocalSink, LocalStream) {
        (LocalSink { tx: self.tx }, LocalStream { rx: self.rx })
    }
}

#[async_trait]
impl TransportSink for LocalSink {
    async fn send(&mut self, frame: Bytes) -> std::io::Result<()> {
        self.tx.send(frame).await.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer transport closed")
        })
    }
}

#[async_trait]
impl TransportStream for LocalStream {
    async fn receive(&mut self) -> std::io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_pair_crosses_frames() {
        let (a, b) = local_pair(4);
        let (mut a_sink, mut a_stream) = a.split();
        let (mut b_sink, mut b_stream) = b.split();

        a_sink.send(Bytes::from_static(b"to-b")).await.unwrap();
        b_sink.send(Bytes::from_static(b"to-a")).await.unwrap();

        assert_eq!(
            b_stream.receive().await.unwrap(),
            Some(Bytes::from_static(b"to-b"))
        );
        assert_eq!(
            a_stream.receive().await.unwrap(),
            Some(Bytes::from_static(b"to-a"))
        );
    }

    #[tokio::test]
    async fn test_dropped_peer_yields_eof_and_send_error() {
        let (a, b) = local_pair(4);
        let (mut a_sink, mut a_stream) = a.split();
        drop(b);

        assert!(a_sink.send(Bytes::from_static(b"x")).await.is_err());
        assert_eq!(a_stream.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frames_preserve_order() {
        let (a, b) = local_pair(8);
        let (mut sink, _) = a.split();
        let (_, mut stream) = b.split();

        for i in 0u8..5 {
            sink.send(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0u8..5 {
            assert_eq!(stream.receive().await.unwrap(), Some(Bytes::from(vec![i])));
        }
    }
}
