//! Binary frame encoding and decoding.
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//! ┌────────────┬───────────────────────┬──────────────────┐
//! │ Stream ID  │ (type << 10) | flags  │ type-specific    │
//! │ 4 bytes    │ 2 bytes               │ body             │
//! └────────────┴───────────────────────┴──────────────────┘
//! ```
//!
//! Metadata sections are prefixed with a 3-byte length, MIME types with a
//! 1-byte length, resume tokens with a 2-byte length; trailing data runs
//! to the end of the frame.
//!
//! Decoding is a pure function: the same bytes always yield an equal
//! [`Frame`], and `decode(encode(f)) == f` for every constructible frame.
//! Truncated bodies and unknown types fail with `MalformedFrame`; a
//! metadata flag on a type that forbids it, or a frame on the wrong side
//! of the stream-0 boundary, fails with `ProtocolViolation`.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::frame::{
    ErrorFrame, ExtensionFrame, Frame, KeepAliveFrame, LeaseFrame, RequestFrame, ResumeFrame,
    SetupFrame, Version,
};
use super::types::{flags, FrameType, FRAME_TYPE_SHIFT};
use crate::error::{ErrorCode, RSocketError, Result};
use crate::payload::Payload;

/// Frame header size in bytes (fixed, exactly 6).
pub const HEADER_SIZE: usize = 6;

/// Maximum metadata length encodable in the 3-byte length prefix.
pub const MAX_METADATA_LEN: usize = (1 << 24) - 1;

/// Mask of the reserved top bit of the stream-id word.
const STREAM_ID_RESERVED_BIT: u32 = 0x8000_0000;

/// Encode a frame into a fresh buffer.
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
    buf.put_u32(frame.stream_id());
    buf.put_u16((frame.frame_type().encoded() << FRAME_TYPE_SHIFT) | frame.flags());

    match frame {
        Frame::Setup(f) => {
            buf.put_u32(f.version.to_u32());
            buf.put_u32(f.keep_alive_interval.as_millis() as u32);
            buf.put_u32(f.keep_alive_max_lifetime.as_millis() as u32);
            if let Some(token) = &f.resume_token {
                buf.put_u16(token.len() as u16);
                buf.put_slice(token);
            }
            put_mime_type(&mut buf, &f.metadata_mime_type);
            put_mime_type(&mut buf, &f.data_mime_type);
            put_payload(&mut buf, &f.payload);
        }
        Frame::Lease(f) => {
            buf.put_u32(f.ttl_millis);
            buf.put_u32(f.number_of_requests);
            if let Some(metadata) = &f.metadata {
                buf.put_slice(metadata);
            }
        }
        Frame::KeepAlive(f) => {
            buf.put_u64(f.last_position);
            buf.put_slice(&f.data);
        }
        Frame::MetadataPush { metadata } => {
            buf.put_slice(metadata);
        }
        Frame::Request(f) => {
            if f.frame_type.has_initial_request() {
                buf.put_u32(f.initial_request);
            }
            put_payload(&mut buf, &f.payload);
        }
        Frame::RequestN { request_n, .. } => {
            buf.put_u32(*request_n);
        }
        Frame::Cancel { .. } => {}
        Frame::Error(f) => {
            buf.put_u32(f.code.0);
            buf.put_slice(f.message.as_bytes());
        }
        Frame::Resume(f) => {
            buf.put_u32(f.version.to_u32());
            buf.put_u16(f.resume_token.len() as u16);
            buf.put_slice(&f.resume_token);
            buf.put_u64(f.last_received_server_position);
            buf.put_u64(f.first_available_client_position);
        }
        Frame::ResumeOk {
            last_received_client_position,
        } => {
            buf.put_u64(*last_received_client_position);
        }
        Frame::Extension(f) => {
            buf.put_u32(f.extended_type);
            put_payload(&mut buf, &f.payload);
        }
    }

    buf.freeze()
}

/// Decode one complete frame from `buf`.
pub fn decode(mut buf: Bytes) -> Result<Frame> {
    need(&buf, HEADER_SIZE, "frame header")?;
    let stream_id = buf.get_u32();
    if stream_id & STREAM_ID_RESERVED_BIT != 0 {
        return Err(RSocketError::ProtocolViolation(format!(
            "reserved stream id bit set (0x{stream_id:08X})"
        )));
    }
    let type_and_flags = buf.get_u16();
    let flag_word = type_and_flags & flags::MASK;
    let encoded_type = type_and_flags >> FRAME_TYPE_SHIFT;
    let frame_type = FrameType::from_encoded(encoded_type).ok_or_else(|| {
        RSocketError::MalformedFrame(format!("unknown frame type 0x{encoded_type:02X}"))
    })?;

    if flags::has(flag_word, flags::METADATA) && !frame_type.can_have_metadata() {
        return Err(RSocketError::ProtocolViolation(format!(
            "metadata flag set on {frame_type:?} frame (stream {stream_id})"
        )));
    }
    if frame_type.is_connection_level() && stream_id != 0 {
        return Err(RSocketError::ProtocolViolation(format!(
            "{frame_type:?} frame on stream {stream_id}, must be stream 0"
        )));
    }
    // ERROR frames live on both sides of the boundary; EXTENSION frames
    // may be connection-level by design of their extended type.
    if !frame_type.is_connection_level()
        && !matches!(frame_type, FrameType::Error | FrameType::Extension)
        && stream_id == 0
    {
        return Err(RSocketError::ProtocolViolation(format!(
            "{frame_type:?} frame on stream 0"
        )));
    }

    match frame_type {
        FrameType::Setup => {
            need(&buf, 12, "SETUP body")?;
            let version = Version::from_u32(buf.get_u32());
            let keep_alive_interval = Duration::from_millis(u64::from(buf.get_u32()));
            let keep_alive_max_lifetime = Duration::from_millis(u64::from(buf.get_u32()));
            let resume_token = if flags::has(flag_word, flags::SETUP_RESUME) {
                need(&buf, 2, "resume token length")?;
                let len = buf.get_u16() as usize;
                need(&buf, len, "resume token")?;
                Some(buf.copy_to_bytes(len))
            } else {
                None
            };
            let metadata_mime_type = get_mime_type(&mut buf)?;
            let data_mime_type = get_mime_type(&mut buf)?;
            let payload = get_payload(&mut buf, flag_word)?;
            Ok(Frame::Setup(SetupFrame {
                version,
                honor_lease: flags::has(flag_word, flags::SETUP_LEASE),
                keep_alive_interval,
                keep_alive_max_lifetime,
                resume_token,
                metadata_mime_type,
                data_mime_type,
                payload,
            }))
        }
        FrameType::Lease => {
            need(&buf, 8, "LEASE body")?;
            let ttl_millis = buf.get_u32();
            let number_of_requests = buf.get_u32();
            let metadata = if flags::has(flag_word, flags::METADATA) {
                Some(buf.copy_to_bytes(buf.remaining()))
            } else {
                None
            };
            Ok(Frame::Lease(LeaseFrame {
                ttl_millis,
                number_of_requests,
                metadata,
            }))
        }
        FrameType::KeepAlive => {
            need(&buf, 8, "KEEPALIVE body")?;
            let last_position = buf.get_u64();
            let data = buf.copy_to_bytes(buf.remaining());
            Ok(Frame::KeepAlive(KeepAliveFrame {
                respond: flags::has(flag_word, flags::KEEPALIVE_RESPOND),
                last_position,
                data,
            }))
        }
        FrameType::MetadataPush => Ok(Frame::MetadataPush {
            metadata: buf.copy_to_bytes(buf.remaining()),
        }),
        FrameType::RequestResponse
        | FrameType::RequestFnf
        | FrameType::RequestStream
        | FrameType::RequestChannel
        | FrameType::Payload => {
            let initial_request = if frame_type.has_initial_request() {
                need(&buf, 4, "initial request count")?;
                buf.get_u32()
            } else {
                0
            };
            let payload = get_payload(&mut buf, flag_word)?;
            Ok(Frame::Request(RequestFrame {
                frame_type,
                stream_id,
                follows: flags::has(flag_word, flags::FOLLOWS),
                complete: flags::has(flag_word, flags::COMPLETE),
                next: flags::has(flag_word, flags::NEXT),
                initial_request,
                payload,
            }))
        }
        FrameType::RequestN => {
            need(&buf, 4, "REQUEST_N body")?;
            Ok(Frame::RequestN {
                stream_id,
                request_n: buf.get_u32(),
            })
        }
        FrameType::Cancel => Ok(Frame::Cancel { stream_id }),
        FrameType::Error => {
            need(&buf, 4, "ERROR body")?;
            let code = ErrorCode(buf.get_u32());
            let message = String::from_utf8_lossy(&buf.copy_to_bytes(buf.remaining())).into_owned();
            Ok(Frame::Error(ErrorFrame {
                stream_id,
                code,
                message,
            }))
        }
        FrameType::Resume => {
            need(&buf, 4, "RESUME version")?;
            let version = Version::from_u32(buf.get_u32());
            need(&buf, 2, "resume token length")?;
            let len = buf.get_u16() as usize;
            need(&buf, len, "resume token")?;
            let resume_token = buf.copy_to_bytes(len);
            need(&buf, 16, "RESUME positions")?;
            Ok(Frame::Resume(ResumeFrame {
                version,
                resume_token,
                last_received_server_position: buf.get_u64(),
                first_available_client_position: buf.get_u64(),
            }))
        }
        FrameType::ResumeOk => {
            need(&buf, 8, "RESUME_OK body")?;
            Ok(Frame::ResumeOk {
                last_received_client_position: buf.get_u64(),
            })
        }
        FrameType::Extension => {
            need(&buf, 4, "EXTENSION type")?;
            let extended_type = buf.get_u32();
            let payload = get_payload(&mut buf, flag_word)?;
            Ok(Frame::Extension(ExtensionFrame {
                stream_id,
                extended_type,
                payload,
            }))
        }
    }
}

/// Peek the stream id of an encoded frame without decoding it.
///
/// Used for scoping decode failures; returns 0 when the buffer is too
/// short to carry one.
pub fn peek_stream_id(buf: &[u8]) -> u32 {
    if buf.len() < 4 {
        return 0;
    }
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) & !STREAM_ID_RESERVED_BIT
}

fn need(buf: &impl Buf, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(RSocketError::MalformedFrame(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_mime_type(buf: &mut BytesMut, mime_type: &str) {
    debug_assert!(mime_type.len() <= u8::MAX as usize);
    buf.put_u8(mime_type.len() as u8);
    buf.put_slice(mime_type.as_bytes());
}

fn get_mime_type(buf: &mut Bytes) -> Result<String> {
    need(buf, 1, "mime type length")?;
    let len = buf.get_u8() as usize;
    need(buf, len, "mime type")?;
    String::from_utf8(buf.copy_to_bytes(len).to_vec())
        .map_err(|_| RSocketError::MalformedFrame("mime type is not valid UTF-8".to_string()))
}

fn put_payload(buf: &mut BytesMut, payload: &Payload) {
    if let Some(metadata) = &payload.metadata {
        debug_assert!(metadata.len() <= MAX_METADATA_LEN);
        buf.put_uint(metadata.len() as u64, 3);
        buf.put_slice(metadata);
    }
    buf.put_slice(&payload.data);
}

fn get_payload(buf: &mut Bytes, flag_word: u16) -> Result<Payload> {
    let metadata = if flags::has(flag_word, flags::METADATA) {
        need(buf, 3, "metadata length")?;
        let len = buf.get_uint(3) as usize;
        need(buf, len, "metadata")?;
        Some(buf.copy_to_bytes(len))
    } else {
        None
    };
    let data = buf.copy_to_bytes(buf.remaining());
    Ok(Payload { data, metadata })
}
