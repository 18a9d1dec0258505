//! Owned datagram payload tagged with its peer endpoint.

use std::fmt;

use super::Endpoint;

/// One UDP message.
///
/// On receive, `endpoint` is the source. On a server send, it is the
/// destination; client sockets ignore it and always send to their peer.
///
/// `Clone` is a deep copy of the payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Datagram {
    endpoint: Option<Endpoint>,
    bytes: Box<[u8]>,
}

impl Datagram {
    /// Creates a datagram addressed to (or received from) `endpoint`.
    #[must_use]
    pub fn new(endpoint: Endpoint, bytes: impl Into<Box<[u8]>>) -> Self {
        Self {
            endpoint: Some(endpoint),
            bytes: bytes.into(),
        }
    }

    /// Creates an unaddressed datagram, for client sockets.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
        Self {
            endpoint: None,
            bytes: bytes.into(),
        }
    }

    /// Copy of this payload addressed to `endpoint`.
    ///
    /// Typical use is answering a received datagram while keeping it queued.
    #[must_use]
    pub fn readdressed(&self, endpoint: Endpoint) -> Self {
        Self {
            endpoint: Some(endpoint),
            bytes: self.bytes.clone(),
        }
    }

    /// Source or destination endpoint, if any.
    #[inline]
    #[must_use]
    pub const fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint
    }

    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consumes the datagram, returning the payload.
    #[must_use]
    pub fn into_bytes(self) -> Box<[u8]> {
        self.bytes
    }
}

impl fmt::Debug for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datagram")
            .field("endpoint", &self.endpoint)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_is_independent() {
        let original = Datagram::new(Endpoint::localhost(5051), b"mandarin".to_vec());
        let copy = original.clone();
        assert_eq!(copy, original);
        assert_ne!(copy.bytes().as_ptr(), original.bytes().as_ptr());
    }

    #[test]
    fn readdressed_keeps_payload() {
        let received = Datagram::new(Endpoint::localhost(40000), &b"request!"[..]);
        let reply = received.readdressed(Endpoint::localhost(40001));

        assert_eq!(reply.bytes(), b"request!");
        assert_eq!(reply.endpoint(), Some(Endpoint::localhost(40001)));
        assert_eq!(received.endpoint(), Some(Endpoint::localhost(40000)));
    }

    #[test]
    fn unaddressed_datagram() {
        let dgram = Datagram::from_bytes(Vec::new());
        assert!(dgram.endpoint().is_none());
        assert!(dgram.is_empty());
        assert_eq!(dgram.len(), 0);
        assert!(dgram.into_bytes().is_empty());
    }
}
