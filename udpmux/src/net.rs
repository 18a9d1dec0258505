//! Network transport primitives.
//!
//! UDP socket abstractions used by the engine's worker thread, the endpoint
//! value type with its resolver, and the owned [`Datagram`] moved through the
//! per-user queues.

pub mod datagram;
pub mod endpoint;
pub mod socket;

pub use datagram::Datagram;
pub use endpoint::{Endpoint, ResolveError, resolve};
pub use socket::{SocketId, UdpSocket};
