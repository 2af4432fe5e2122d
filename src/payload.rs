//! Payload type: an opaque data buffer plus optional metadata.
//!
//! Uses `bytes::Bytes` so handoff between codec, reassembler, operation
//! and application is a move of a refcounted handle, never a deep copy.
//! A payload is exclusively owned by whichever component currently holds
//! it and is consumed by move on every handoff.

use bytes::Bytes;

/// One application-level message: opaque `data` plus optional `metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    /// Opaque data bytes.
    pub data: Bytes,
    /// Optional opaque metadata bytes.
    pub metadata: Option<Bytes>,
}

impl Payload {
    /// Create a payload from data and optional metadata.
    pub fn new(data: Bytes, metadata: Option<Bytes>) -> Self {
        Self { data, metadata }
    }

    /// Create a data-only payload.
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: None,
        }
    }

    /// Create a payload from static byte slices.
    pub fn from_static(data: &'static [u8]) -> Self {
        Self {
            data: Bytes::from_static(data),
            metadata: None,
        }
    }

    /// The empty payload (no data, no metadata).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Attach metadata, consuming self.
    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Total number of payload bytes (data + metadata).
    pub fn len(&self) -> usize {
        self.data.len() + self.metadata.as_ref().map_or(0, Bytes::len)
    }

    /// True when there is neither data nor metadata.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.metadata.as_ref().map_or(true, Bytes::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_construction() {
        let p = Payload::from_static(b"ping");
        assert_eq!(&p.data[..], b"ping");
        assert!(p.metadata.is_none());
        assert_eq!(p.len(), 4);
    }

    #[test]
    fn test_payload_with_metadata() {
        let p = Payload::from_data("body").with_metadata("meta");
        assert_eq!(&p.data[..], b"body");
        assert_eq!(p.metadata.as_deref(), Some(&b"meta"[..]));
        assert_eq!(p.len(), 8);
    }

    #[test]
    fn test_empty_payload() {
        let p = Payload::empty();
        assert!(p.is_empty());
        assert_eq!(p.len(), 0);

        // Metadata present but empty still counts as empty.
        let p = Payload::new(Bytes::new(), Some(Bytes::new()));
        assert!(p.is_empty());
    }

    #[test]
    fn test_clone_is_shallow() {
        let data = Bytes::from_static(b"shared");
        let p = Payload::from_data(data.clone());
        let q = p.clone();
        assert_eq!(p.data.as_ptr(), q.data.as_ptr());
        assert_eq!(q.data.as_ptr(), data.as_ptr());
    }
}
