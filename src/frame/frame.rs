//! Frame structs with typed accessors and constructors.
//!
//! [`Frame`] is a tagged union over every wire frame. The four request
//! types and Payload share one shape, [`RequestFrame`]: they differ only
//! in which flags and fields are meaningful, and the fragmenter and
//! reassembler treat them uniformly.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use super::types::{flags, FrameType};
use crate::error::ErrorCode;
use crate::payload::Payload;

/// Protocol version, packed into a `u32` as `major << 16 | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    /// Version 1.0, the only version this engine speaks.
    pub const V1_0: Version = Version { major: 1, minor: 0 };

    /// Unpack from the wire word.
    pub fn from_u32(word: u32) -> Self {
        Self {
            major: (word >> 16) as u16,
            minor: (word & 0xFFFF) as u16,
        }
    }

    /// Pack into the wire word.
    pub fn to_u32(self) -> u32 {
        (u32::from(self.major) << 16) | u32::from(self.minor)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// SETUP frame: the connection-establishing handshake, stream 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupFrame {
    pub version: Version,
    /// Client requests lease-based admission control (not honored here).
    pub honor_lease: bool,
    /// Keepalive probe interval.
    pub keep_alive_interval: Duration,
    /// Silence longer than this is fatal to the connection.
    pub keep_alive_max_lifetime: Duration,
    /// Opaque resume token (resumption is an interface point only).
    pub resume_token: Option<Bytes>,
    /// MIME type for metadata buffers, US-ASCII.
    pub metadata_mime_type: String,
    /// MIME type for data buffers, US-ASCII.
    pub data_mime_type: String,
    /// Setup payload handed to the acceptor.
    pub payload: Payload,
}

/// LEASE frame, stream 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseFrame {
    pub ttl_millis: u32,
    pub number_of_requests: u32,
    pub metadata: Option<Bytes>,
}

/// KEEPALIVE frame, stream 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveFrame {
    /// The receiver must echo this frame back with `respond` cleared.
    pub respond: bool,
    /// Resumption position; always 0 without resumption support.
    pub last_position: u64,
    /// Opaque data echoed back by the peer.
    pub data: Bytes,
}

/// The shared shape of the four request types plus Payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// One of the four request types, or [`FrameType::Payload`].
    pub frame_type: FrameType,
    pub stream_id: u32,
    /// More fragments of this logical frame follow.
    pub follows: bool,
    /// Terminates the sender's direction of the stream.
    pub complete: bool,
    /// A payload (or payload fragment) is present.
    pub next: bool,
    /// Initial credit; only meaningful for RequestStream/RequestChannel.
    pub initial_request: u32,
    pub payload: Payload,
}

impl RequestFrame {
    /// REQUEST_FNF frame.
    pub fn fire_and_forget(stream_id: u32, payload: Payload) -> Self {
        Self {
            frame_type: FrameType::RequestFnf,
            stream_id,
            follows: false,
            complete: false,
            next: false,
            initial_request: 0,
            payload,
        }
    }

    /// REQUEST_RESPONSE frame.
    pub fn request_response(stream_id: u32, payload: Payload) -> Self {
        Self {
            frame_type: FrameType::RequestResponse,
            stream_id,
            follows: false,
            complete: false,
            next: false,
            initial_request: 0,
            payload,
        }
    }

    /// REQUEST_STREAM frame with initial credit.
    pub fn request_stream(stream_id: u32, initial_request: u32, payload: Payload) -> Self {
        Self {
            frame_type: FrameType::RequestStream,
            stream_id,
            follows: false,
            complete: false,
            next: false,
            initial_request,
            payload,
        }
    }

    /// REQUEST_CHANNEL frame with initial credit.
    pub fn request_channel(stream_id: u32, initial_request: u32, payload: Payload) -> Self {
        Self {
            frame_type: FrameType::RequestChannel,
            stream_id,
            follows: false,
            complete: false,
            next: false,
            initial_request,
            payload,
        }
    }

    /// PAYLOAD frame carrying a next payload.
    pub fn next(stream_id: u32, payload: Payload) -> Self {
        Self {
            frame_type: FrameType::Payload,
            stream_id,
            follows: false,
            complete: false,
            next: true,
            initial_request: 0,
            payload,
        }
    }

    /// PAYLOAD frame completing the stream without a payload.
    pub fn complete(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Payload,
            stream_id,
            follows: false,
            complete: true,
            next: false,
            initial_request: 0,
            payload: Payload::empty(),
        }
    }

    /// PAYLOAD frame carrying the terminal payload (Next + Complete).
    pub fn next_complete(stream_id: u32, payload: Payload) -> Self {
        Self {
            frame_type: FrameType::Payload,
            stream_id,
            follows: false,
            complete: true,
            next: true,
            initial_request: 0,
            payload,
        }
    }

    /// Flags word for this frame.
    pub fn flags(&self) -> u16 {
        let mut word = 0;
        if self.payload.metadata.is_some() {
            word |= flags::METADATA;
        }
        if self.follows {
            word |= flags::FOLLOWS;
        }
        if self.complete {
            word |= flags::COMPLETE;
        }
        if self.next {
            word |= flags::NEXT;
        }
        word
    }
}

/// ERROR frame; terminates a stream, or the connection on stream 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub stream_id: u32,
    pub code: ErrorCode,
    pub message: String,
}

/// RESUME frame (interface point only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeFrame {
    pub version: Version,
    pub resume_token: Bytes,
    pub last_received_server_position: u64,
    pub first_available_client_position: u64,
}

/// EXTENSION frame with a custom extended type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionFrame {
    pub stream_id: u32,
    pub extended_type: u32,
    pub payload: Payload,
}

/// A complete decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Setup(SetupFrame),
    Lease(LeaseFrame),
    KeepAlive(KeepAliveFrame),
    MetadataPush { metadata: Bytes },
    Request(RequestFrame),
    RequestN { stream_id: u32, request_n: u32 },
    Cancel { stream_id: u32 },
    Error(ErrorFrame),
    Resume(ResumeFrame),
    ResumeOk { last_received_client_position: u64 },
    Extension(ExtensionFrame),
}

impl Frame {
    /// The stream this frame belongs to; 0 for connection-level frames.
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Setup(_)
            | Frame::Lease(_)
            | Frame::KeepAlive(_)
            | Frame::MetadataPush { .. }
            | Frame::Resume(_)
            | Frame::ResumeOk { .. } => 0,
            Frame::Request(f) => f.stream_id,
            Frame::RequestN { stream_id, .. } => *stream_id,
            Frame::Cancel { stream_id } => *stream_id,
            Frame::Error(f) => f.stream_id,
            Frame::Extension(f) => f.stream_id,
        }
    }

    /// The wire type of this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Setup(_) => FrameType::Setup,
            Frame::Lease(_) => FrameType::Lease,
            Frame::KeepAlive(_) => FrameType::KeepAlive,
            Frame::MetadataPush { .. } => FrameType::MetadataPush,
            Frame::Request(f) => f.frame_type,
            Frame::RequestN { .. } => FrameType::RequestN,
            Frame::Cancel { .. } => FrameType::Cancel,
            Frame::Error(_) => FrameType::Error,
            Frame::Resume(_) => FrameType::Resume,
            Frame::ResumeOk { .. } => FrameType::ResumeOk,
            Frame::Extension(_) => FrameType::Extension,
        }
    }

    /// The flags word this frame encodes with.
    pub fn flags(&self) -> u16 {
        match self {
            Frame::Setup(f) => {
                let mut word = 0;
                if f.honor_lease {
                    word |= flags::SETUP_LEASE;
                }
                if f.resume_token.is_some() {
                    word |= flags::SETUP_RESUME;
                }
                if f.payload.metadata.is_some() {
                    word |= flags::METADATA;
                }
                word
            }
            Frame::Lease(f) => {
                if f.metadata.is_some() {
                    flags::METADATA
                } else {
                    0
                }
            }
            Frame::KeepAlive(f) => {
                if f.respond {
                    flags::KEEPALIVE_RESPOND
                } else {
                    0
                }
            }
            Frame::MetadataPush { .. } => flags::METADATA,
            Frame::Request(f) => f.flags(),
            Frame::Extension(f) => {
                let mut word = flags::IGNORE;
                if f.payload.metadata.is_some() {
                    word |= flags::METADATA;
                }
                word
            }
            Frame::RequestN { .. }
            | Frame::Cancel { .. }
            | Frame::Error(_)
            | Frame::Resume(_)
            | Frame::ResumeOk { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_packing() {
        assert_eq!(Version::V1_0.to_u32(), 0x0001_0000);
        assert_eq!(Version::from_u32(0x0001_0000), Version::V1_0);
        let v = Version { major: 2, minor: 7 };
        assert_eq!(Version::from_u32(v.to_u32()), v);
        assert_eq!(v.to_string(), "2.7");
    }

    #[test]
    fn test_request_frame_flags() {
        let f = RequestFrame::next_complete(1, Payload::from_static(b"x"));
        assert!(flags::has(f.flags(), flags::NEXT));
        assert!(flags::has(f.flags(), flags::COMPLETE));
        assert!(!flags::has(f.flags(), flags::FOLLOWS));
        assert!(!flags::has(f.flags(), flags::METADATA));

        let f = RequestFrame::next(1, Payload::from_data("x").with_metadata("m"));
        assert!(flags::has(f.flags(), flags::METADATA));
        assert!(!flags::has(f.flags(), flags::COMPLETE));
    }

    #[test]
    fn test_connection_level_stream_ids() {
        let keepalive = Frame::KeepAlive(KeepAliveFrame {
            respond: true,
            last_position: 0,
            data: Bytes::new(),
        });
        assert_eq!(keepalive.stream_id(), 0);
        assert_eq!(keepalive.frame_type(), FrameType::KeepAlive);

        let cancel = Frame::Cancel { stream_id: 9 };
        assert_eq!(cancel.stream_id(), 9);
        assert_eq!(cancel.flags(), 0);
    }

    #[test]
    fn test_setup_flags() {
        let setup = Frame::Setup(SetupFrame {
            version: Version::V1_0,
            honor_lease: true,
            keep_alive_interval: Duration::from_secs(20),
            keep_alive_max_lifetime: Duration::from_secs(90),
            resume_token: Some(Bytes::from_static(b"tok")),
            metadata_mime_type: "application/octet-stream".into(),
            data_mime_type: "application/octet-stream".into(),
            payload: Payload::empty(),
        });
        let word = setup.flags();
        assert!(flags::has(word, flags::SETUP_LEASE));
        assert!(flags::has(word, flags::SETUP_RESUME));
        assert!(!flags::has(word, flags::METADATA));
    }

    #[test]
    fn test_constructors_set_expected_types() {
        assert_eq!(
            RequestFrame::fire_and_forget(1, Payload::empty()).frame_type,
            FrameType::RequestFnf
        );
        assert_eq!(
            RequestFrame::request_response(1, Payload::empty()).frame_type,
            FrameType::RequestResponse
        );
        assert_eq!(
            RequestFrame::request_stream(1, 8, Payload::empty()).initial_request,
            8
        );
        let complete = RequestFrame::complete(3);
        assert!(complete.complete && !complete.next);
        assert!(complete.payload.is_empty());
    }
}
