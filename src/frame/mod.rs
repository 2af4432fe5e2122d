//! Frame module - wire format, frame types, and the binary codec.
//!
//! This module implements the binary protocol layer:
//! - frame type table and header flag constants
//! - the [`Frame`] tagged union with typed accessors
//! - pure encode/decode between frames and byte buffers

mod codec;
#[allow(clippy::module_inception)]
mod frame;
mod types;

pub use codec::{decode, encode, peek_stream_id, HEADER_SIZE, MAX_METADATA_LEN};
pub use frame::{
    ErrorFrame, ExtensionFrame, Frame, KeepAliveFrame, LeaseFrame, RequestFrame, ResumeFrame,
    SetupFrame, Version,
};
pub use types::{flags, FrameType, FRAME_TYPE_SHIFT};
