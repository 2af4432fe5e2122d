//! Fragmentation and reassembly of large payloads.
//!
//! Outbound, [`Fragmenter`] splits one logical frame into a chain of
//! frames carrying at most `max_fragment_size` payload bytes each:
//! metadata is split first, then data; every frame but the last sets the
//! Follows flag and carries no terminal semantics; the first frame keeps
//! the request type and initial request count, later fragments travel as
//! Payload frames; the last frame carries the original Complete flag.
//!
//! Inbound, [`Reassembler`] keeps an explicit table of per-stream
//! accumulation buffers keyed by stream id. Follows-flagged frames append
//! to the buffers; the first frame without Follows completes the logical
//! frame. Entries are evicted on completion, and eagerly on stream
//! cancellation/error or connection teardown, so an unterminated chain
//! never leaks its buffers.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::frame::{FrameType, RequestFrame};
use crate::payload::Payload;

/// Splits outbound frames into fragment chains.
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    max_fragment_size: usize,
}

impl Fragmenter {
    /// A fragment size of 0 disables fragmentation.
    pub fn new(max_fragment_size: usize) -> Self {
        Self { max_fragment_size }
    }

    /// Whether outbound frames may be split at all.
    pub fn is_enabled(&self) -> bool {
        self.max_fragment_size > 0
    }

    /// Split `frame` into a chain of frames, each carrying at most the
    /// configured number of payload bytes. Returns the frame unchanged
    /// when it fits or fragmentation is disabled.
    pub fn fragment(&self, frame: RequestFrame) -> Vec<RequestFrame> {
        let budget = self.max_fragment_size;
        if budget == 0 || !frame.frame_type.is_fragmentable() || frame.payload.len() <= budget {
            return vec![frame];
        }

        let RequestFrame {
            frame_type,
            stream_id,
            complete,
            initial_request,
            payload,
            ..
        } = frame;
        let mut metadata = payload.metadata;
        let mut data = payload.data;

        let mut frames = Vec::new();
        let mut first = true;
        loop {
            let mut remaining = budget;

            let fragment_metadata = match metadata.as_mut() {
                Some(meta) if !meta.is_empty() => {
                    let take = meta.len().min(remaining);
                    remaining -= take;
                    Some(meta.split_to(take))
                }
                // Keep an empty-but-present metadata section observable on
                // the first fragment so reassembly reproduces the payload
                // exactly.
                Some(_) if first => Some(Bytes::new()),
                _ => None,
            };

            let fragment_data = if remaining > 0 && !data.is_empty() {
                let take = data.len().min(remaining);
                data.split_to(take)
            } else {
                Bytes::new()
            };

            let follows =
                metadata.as_ref().map_or(false, |meta| !meta.is_empty()) || !data.is_empty();
            let fragment_type = if first && frame_type.is_request() {
                frame_type
            } else {
                FrameType::Payload
            };

            frames.push(RequestFrame {
                frame_type: fragment_type,
                stream_id,
                follows,
                complete: complete && !follows,
                next: !fragment_type.is_request(),
                initial_request: if first { initial_request } else { 0 },
                payload: Payload {
                    data: fragment_data,
                    metadata: fragment_metadata,
                },
            });

            if !follows {
                return frames;
            }
            first = false;
        }
    }
}

#[derive(Debug)]
struct Accumulator {
    frame_type: FrameType,
    initial_request: u32,
    next: bool,
    data: BytesMut,
    metadata: BytesMut,
    has_metadata: bool,
}

/// Per-stream reassembly table for inbound fragment chains.
#[derive(Debug, Default)]
pub struct Reassembler {
    entries: HashMap<u32, Accumulator>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound frame.
    ///
    /// Returns the completed logical frame once per chain: immediately for
    /// unfragmented frames, or when the terminating (non-Follows) frame of
    /// an accumulated chain arrives. Returns `None` while a chain is still
    /// accumulating.
    pub fn push(&mut self, frame: RequestFrame) -> Option<RequestFrame> {
        let stream_id = frame.stream_id;
        if !frame.follows && !self.entries.contains_key(&stream_id) {
            // Unfragmented fast path.
            return Some(frame);
        }

        let entry = self
            .entries
            .entry(stream_id)
            .or_insert_with(|| Accumulator {
                frame_type: frame.frame_type,
                initial_request: frame.initial_request,
                next: false,
                data: BytesMut::new(),
                metadata: BytesMut::new(),
                has_metadata: false,
            });
        entry.next |= frame.next;
        entry.data.extend_from_slice(&frame.payload.data);
        if let Some(meta) = &frame.payload.metadata {
            entry.has_metadata = true;
            entry.metadata.extend_from_slice(meta);
        }

        if frame.follows {
            return None;
        }

        let entry = self
            .entries
            .remove(&stream_id)
            .expect("accumulator inserted above");
        Some(RequestFrame {
            frame_type: entry.frame_type,
            stream_id,
            follows: false,
            complete: frame.complete,
            next: entry.next,
            initial_request: entry.initial_request,
            payload: Payload {
                data: entry.data.freeze(),
                metadata: if entry.has_metadata {
                    Some(entry.metadata.freeze())
                } else {
                    None
                },
            },
        })
    }

    /// Release the accumulation buffers of a stream that terminated early.
    pub fn evict(&mut self, stream_id: u32) -> bool {
        self.entries.remove(&stream_id).is_some()
    }

    /// Release every accumulation buffer (connection teardown).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of streams with an in-progress chain.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble_chain(frames: Vec<RequestFrame>) -> RequestFrame {
        let mut reassembler = Reassembler::new();
        let total = frames.len();
        for (i, frame) in frames.into_iter().enumerate() {
            match reassembler.push(frame) {
                Some(logical) => {
                    assert_eq!(i, total - 1, "chain completed early");
                    assert!(reassembler.is_empty(), "entry must be evicted on completion");
                    return logical;
                }
                None => assert!(i < total - 1, "chain never completed"),
            }
        }
        panic!("no logical frame produced");
    }

    #[test]
    fn test_small_frame_passes_through() {
        let fragmenter = Fragmenter::new(64);
        let frame = RequestFrame::next(1, Payload::from_static(b"small"));
        let frames = fragmenter.fragment(frame.clone());
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_disabled_fragmenter_never_splits() {
        let fragmenter = Fragmenter::new(0);
        assert!(!fragmenter.is_enabled());
        let frame = RequestFrame::next(1, Payload::from_data(vec![0u8; 4096]));
        assert_eq!(fragmenter.fragment(frame).len(), 1);
    }

    #[test]
    fn test_fragment_reassemble_roundtrip() {
        let fragmenter = Fragmenter::new(16);
        let original = RequestFrame::next_complete(
            9,
            Payload::from_data(vec![0xAB; 100]).with_metadata(vec![0xCD; 37]),
        );
        let frames = fragmenter.fragment(original.clone());
        assert!(frames.len() > 1);

        for frame in &frames {
            assert!(
                frame.payload.len() <= 16,
                "fragment exceeds budget: {} bytes",
                frame.payload.len()
            );
        }
        let last = frames.len() - 1;
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.follows, i != last);
            assert_eq!(frame.complete, i == last);
        }

        assert_eq!(reassemble_chain(frames), original);
    }

    #[test]
    fn test_metadata_is_split_before_data() {
        let fragmenter = Fragmenter::new(10);
        let original = RequestFrame::next(
            3,
            Payload::from_data(vec![0x01; 20]).with_metadata(vec![0x02; 25]),
        );
        let frames = fragmenter.fragment(original);

        // First two fragments are pure metadata, the third mixes the
        // metadata tail with data.
        assert_eq!(frames[0].payload.metadata.as_ref().unwrap().len(), 10);
        assert!(frames[0].payload.data.is_empty());
        assert_eq!(frames[1].payload.metadata.as_ref().unwrap().len(), 10);
        assert!(frames[1].payload.data.is_empty());
        assert_eq!(frames[2].payload.metadata.as_ref().unwrap().len(), 5);
        assert_eq!(frames[2].payload.data.len(), 5);
    }

    #[test]
    fn test_request_frame_keeps_type_and_initial_request() {
        let fragmenter = Fragmenter::new(8);
        let original = RequestFrame::request_stream(5, 42, Payload::from_data(vec![0u8; 30]));
        let frames = fragmenter.fragment(original.clone());

        assert_eq!(frames[0].frame_type, FrameType::RequestStream);
        assert_eq!(frames[0].initial_request, 42);
        assert!(!frames[0].next);
        for frame in &frames[1..] {
            assert_eq!(frame.frame_type, FrameType::Payload);
            assert_eq!(frame.initial_request, 0);
            assert!(frame.next);
        }

        let logical = reassemble_chain(frames);
        assert_eq!(logical.frame_type, FrameType::RequestStream);
        assert_eq!(logical.initial_request, 42);
        assert_eq!(logical.payload, original.payload);
    }

    #[test]
    fn test_interleaved_streams_reassemble_independently() {
        let fragmenter = Fragmenter::new(8);
        let a = RequestFrame::next_complete(1, Payload::from_data(vec![0xAA; 20]));
        let b = RequestFrame::next_complete(2, Payload::from_data(vec![0xBB; 20]));
        let a_frames = fragmenter.fragment(a.clone());
        let b_frames = fragmenter.fragment(b.clone());

        let mut reassembler = Reassembler::new();
        let mut done = Vec::new();
        for pair in a_frames.into_iter().zip(b_frames) {
            for frame in [pair.0, pair.1] {
                if let Some(logical) = reassembler.push(frame) {
                    done.push(logical);
                }
            }
        }
        assert_eq!(done, vec![a, b]);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_evict_releases_partial_chain() {
        let fragmenter = Fragmenter::new(8);
        let frames = fragmenter.fragment(RequestFrame::next(7, Payload::from_data(vec![0u8; 40])));

        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(frames[0].clone()).is_none());
        assert_eq!(reassembler.len(), 1);

        assert!(reassembler.evict(7));
        assert!(reassembler.is_empty());
        assert!(!reassembler.evict(7));
    }

    #[test]
    fn test_clear_releases_everything() {
        let fragmenter = Fragmenter::new(4);
        let mut reassembler = Reassembler::new();
        for id in [1u32, 3, 5] {
            let frames = fragmenter.fragment(RequestFrame::next(id, Payload::from_data(vec![0u8; 16])));
            assert!(reassembler.push(frames[0].clone()).is_none());
        }
        assert_eq!(reassembler.len(), 3);
        reassembler.clear();
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_exact_budget_multiple() {
        // Payload is an exact multiple of the budget: no empty tail frame.
        let fragmenter = Fragmenter::new(10);
        let original = RequestFrame::next_complete(11, Payload::from_data(vec![0x7F; 30]));
        let frames = fragmenter.fragment(original.clone());
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.payload.len() == 10));
        assert_eq!(reassemble_chain(frames), original);
    }
}
