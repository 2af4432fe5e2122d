//! Frame types and header flag constants.
//!
//! The 6-byte frame header packs the type and flags into one big-endian
//! `u16`: `(encoded_type << 10) | flags`. The low 10 bits carry the flags,
//! so encoded types occupy the range `0x00..=0x3F`.
//!
//! Each frame type carries a small capability set (can it have metadata,
//! can it be fragmented, does its body start with an initial request
//! count) that both the codec and the engine consult.

/// Header flag constants (low 10 bits of the type-and-flags word).
pub mod flags {
    /// Payload frame carries a next payload (or fragment thereof).
    pub const NEXT: u16 = 0x0020;
    /// Payload frame completes the stream; on SETUP: lease requested.
    pub const COMPLETE: u16 = 0x0040;
    /// More fragments of this logical frame follow; on KEEPALIVE: the
    /// receiver must respond; on SETUP: a resume token is present.
    pub const FOLLOWS: u16 = 0x0080;
    /// A length-prefixed metadata section is present.
    pub const METADATA: u16 = 0x0100;
    /// The frame can be dropped by a receiver that does not understand it.
    pub const IGNORE: u16 = 0x0200;

    /// KEEPALIVE respond flag (shares the bit with FOLLOWS).
    pub const KEEPALIVE_RESPOND: u16 = FOLLOWS;
    /// SETUP honor-lease flag (shares the bit with COMPLETE).
    pub const SETUP_LEASE: u16 = COMPLETE;
    /// SETUP resume-token-present flag (shares the bit with FOLLOWS).
    pub const SETUP_RESUME: u16 = FOLLOWS;

    /// Mask covering all flag bits.
    pub const MASK: u16 = 0x03FF;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has(word: u16, flag: u16) -> bool {
        word & flag != 0
    }
}

/// Number of bits the encoded type is shifted left of the flags.
pub const FRAME_TYPE_SHIFT: u16 = 10;

/// The RSocket frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Connection setup, first frame on the wire (stream 0).
    Setup,
    /// Lease grant (stream 0); understood by the codec, not honored by the
    /// engine.
    Lease,
    /// Connection liveness probe (stream 0).
    KeepAlive,
    /// Single-response request.
    RequestResponse,
    /// Fire-and-forget request.
    RequestFnf,
    /// Stream request carrying initial credit.
    RequestStream,
    /// Bidirectional channel request carrying initial credit.
    RequestChannel,
    /// Credit grant for an active stream.
    RequestN,
    /// Requester-side termination of an active stream.
    Cancel,
    /// Payload on an active stream (Next/Complete semantics in flags).
    Payload,
    /// Error terminating a stream, or the connection on stream 0.
    Error,
    /// Connection-level metadata push (stream 0).
    MetadataPush,
    /// Resume request (stream 0); interface point only.
    Resume,
    /// Resume acknowledgement (stream 0); interface point only.
    ResumeOk,
    /// Extension frame with a custom extended type.
    Extension,
}

impl FrameType {
    /// The wire encoding of this type.
    pub fn encoded(self) -> u16 {
        match self {
            FrameType::Setup => 0x01,
            FrameType::Lease => 0x02,
            FrameType::KeepAlive => 0x03,
            FrameType::RequestResponse => 0x04,
            FrameType::RequestFnf => 0x05,
            FrameType::RequestStream => 0x06,
            FrameType::RequestChannel => 0x07,
            FrameType::RequestN => 0x08,
            FrameType::Cancel => 0x09,
            FrameType::Payload => 0x0A,
            FrameType::Error => 0x0B,
            FrameType::MetadataPush => 0x0C,
            FrameType::Resume => 0x0D,
            FrameType::ResumeOk => 0x0E,
            FrameType::Extension => 0x3F,
        }
    }

    /// Decode a wire type; `None` for unknown encodings.
    pub fn from_encoded(encoded: u16) -> Option<FrameType> {
        Some(match encoded {
            0x01 => FrameType::Setup,
            0x02 => FrameType::Lease,
            0x03 => FrameType::KeepAlive,
            0x04 => FrameType::RequestResponse,
            0x05 => FrameType::RequestFnf,
            0x06 => FrameType::RequestStream,
            0x07 => FrameType::RequestChannel,
            0x08 => FrameType::RequestN,
            0x09 => FrameType::Cancel,
            0x0A => FrameType::Payload,
            0x0B => FrameType::Error,
            0x0C => FrameType::MetadataPush,
            0x0D => FrameType::Resume,
            0x0E => FrameType::ResumeOk,
            0x3F => FrameType::Extension,
            _ => return None,
        })
    }

    /// May this type set the metadata flag?
    pub fn can_have_metadata(self) -> bool {
        matches!(
            self,
            FrameType::Setup
                | FrameType::Lease
                | FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
                | FrameType::Payload
                | FrameType::MetadataPush
                | FrameType::Extension
        )
    }

    /// May this type be split into a follows-flagged fragment chain?
    pub fn is_fragmentable(self) -> bool {
        matches!(
            self,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
                | FrameType::Payload
        )
    }

    /// Is this one of the four stream-opening request types?
    pub fn is_request(self) -> bool {
        matches!(
            self,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
        )
    }

    /// Does the body start with a 4-byte initial request count?
    pub fn has_initial_request(self) -> bool {
        matches!(self, FrameType::RequestStream | FrameType::RequestChannel)
    }

    /// Must this type be sent on stream 0?
    pub fn is_connection_level(self) -> bool {
        matches!(
            self,
            FrameType::Setup
                | FrameType::Lease
                | FrameType::KeepAlive
                | FrameType::MetadataPush
                | FrameType::Resume
                | FrameType::ResumeOk
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [FrameType; 15] = [
        FrameType::Setup,
        FrameType::Lease,
        FrameType::KeepAlive,
        FrameType::RequestResponse,
        FrameType::RequestFnf,
        FrameType::RequestStream,
        FrameType::RequestChannel,
        FrameType::RequestN,
        FrameType::Cancel,
        FrameType::Payload,
        FrameType::Error,
        FrameType::MetadataPush,
        FrameType::Resume,
        FrameType::ResumeOk,
        FrameType::Extension,
    ];

    #[test]
    fn test_encoded_roundtrip() {
        for t in ALL {
            assert_eq!(FrameType::from_encoded(t.encoded()), Some(t));
        }
    }

    #[test]
    fn test_unknown_encodings_rejected() {
        assert_eq!(FrameType::from_encoded(0x00), None);
        assert_eq!(FrameType::from_encoded(0x0F), None);
        assert_eq!(FrameType::from_encoded(0x3E), None);
    }

    #[test]
    fn test_request_capabilities() {
        assert!(FrameType::RequestStream.has_initial_request());
        assert!(FrameType::RequestChannel.has_initial_request());
        assert!(!FrameType::RequestResponse.has_initial_request());

        for t in [
            FrameType::RequestResponse,
            FrameType::RequestFnf,
            FrameType::RequestStream,
            FrameType::RequestChannel,
        ] {
            assert!(t.is_request());
            assert!(t.is_fragmentable());
            assert!(t.can_have_metadata());
        }
        assert!(FrameType::Payload.is_fragmentable());
        assert!(!FrameType::Payload.is_request());
    }

    #[test]
    fn test_metadata_forbidden_types() {
        for t in [
            FrameType::KeepAlive,
            FrameType::RequestN,
            FrameType::Cancel,
            FrameType::Error,
            FrameType::Resume,
            FrameType::ResumeOk,
        ] {
            assert!(!t.can_have_metadata(), "{t:?} must forbid metadata");
        }
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(flags::NEXT, 32);
        assert_eq!(flags::COMPLETE, 64);
        assert_eq!(flags::FOLLOWS, 128);
        assert_eq!(flags::METADATA, 256);
        assert_eq!(flags::IGNORE, 512);
        assert!(flags::has(flags::NEXT | flags::COMPLETE, flags::NEXT));
        assert!(!flags::has(flags::NEXT, flags::COMPLETE));
    }
}
