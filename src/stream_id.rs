//! Stream id allocation.
//!
//! Stream ids are 31-bit, parity-fixed per connection role: clients issue
//! odd ids starting at 1, servers even ids starting at 2. Id 0 is reserved
//! for connection-level frames. Ids are never reused within a connection;
//! running out of the 31-bit space fails the connection rather than
//! wrapping into ids that could still be live.

use crate::error::{RSocketError, Result};

/// Largest valid stream id (31 bits).
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Which side of the connection this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSide {
    /// Initiated the connection; allocates odd stream ids.
    Client,
    /// Accepted the connection; allocates even stream ids.
    Server,
}

impl ConnectionSide {
    /// Does `stream_id` belong to the id space of this side?
    pub fn owns(self, stream_id: u32) -> bool {
        match self {
            ConnectionSide::Client => stream_id % 2 == 1,
            ConnectionSide::Server => stream_id % 2 == 0 && stream_id != 0,
        }
    }
}

/// Issues monotonically increasing stream ids of one parity.
#[derive(Debug)]
pub struct StreamIdAllocator {
    next: u32,
}

impl StreamIdAllocator {
    /// Allocator for the given connection side.
    pub fn new(side: ConnectionSide) -> Self {
        Self {
            next: match side {
                ConnectionSide::Client => 1,
                ConnectionSide::Server => 2,
            },
        }
    }

    /// Jump ahead in the id space (tests only).
    #[cfg(test)]
    pub(crate) fn set_next(&mut self, next: u32) {
        self.next = next;
    }

    /// The next unused id of this connection's parity.
    ///
    /// Fails with [`RSocketError::StreamIdsExhausted`] once the 31-bit
    /// space is used up; ids are never reused.
    pub fn next(&mut self) -> Result<u32> {
        let id = self.next;
        if id > MAX_STREAM_ID {
            return Err(RSocketError::StreamIdsExhausted);
        }
        self.next += 2;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_sequence() {
        let mut ids = StreamIdAllocator::new(ConnectionSide::Client);
        let first: Vec<u32> = (0..5).map(|_| ids.next().unwrap()).collect();
        assert_eq!(first, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_server_sequence() {
        let mut ids = StreamIdAllocator::new(ConnectionSide::Server);
        let first: Vec<u32> = (0..5).map(|_| ids.next().unwrap()).collect();
        assert_eq!(first, vec![2, 4, 6, 8, 10]);
    }

    #[test]
    fn test_exhaustion_fails_instead_of_wrapping() {
        let mut ids = StreamIdAllocator {
            next: MAX_STREAM_ID - 2,
        };
        assert_eq!(ids.next().unwrap(), MAX_STREAM_ID - 2);
        assert_eq!(ids.next().unwrap(), MAX_STREAM_ID);
        assert!(matches!(
            ids.next().unwrap_err(),
            RSocketError::StreamIdsExhausted
        ));
        // Still exhausted on subsequent calls.
        assert!(ids.next().is_err());
    }

    #[test]
    fn test_side_ownership() {
        assert!(ConnectionSide::Client.owns(1));
        assert!(ConnectionSide::Client.owns(2147483647));
        assert!(!ConnectionSide::Client.owns(2));
        assert!(ConnectionSide::Server.owns(2));
        assert!(!ConnectionSide::Server.owns(0));
        assert!(!ConnectionSide::Server.owns(7));
    }
}
