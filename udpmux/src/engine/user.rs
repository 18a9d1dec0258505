//! The capability interface implemented by parties attaching sockets.

use std::sync::Arc;

use crate::net::{Datagram, SocketId};
use crate::sync::BoundedQueue;

/// Queue type carrying datagrams between a user and the engine.
pub type DatagramQueue = BoundedQueue<Datagram>;

/// How an attached socket is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Bound to the attach address; replies go to each datagram's endpoint.
    Server,
    /// Bound to an ephemeral port; every datagram goes to the attach address.
    Client,
}

/// A party owning one socket of a [`SocketMultiplexEngine`].
///
/// Both callbacks run while the engine's registration table is locked, on
/// the caller's thread or on the worker thread. They must return promptly and
/// must not call back into the engine.
///
/// [`SocketMultiplexEngine`]: super::SocketMultiplexEngine
pub trait UdpUser: Send + Sync {
    /// Called once after a successful attach.
    ///
    /// `input` receives datagrams read from the socket; datagrams pushed to
    /// `output` are sent by the worker. This is the only moment the queues are
    /// handed out.
    fn set_up(&self, socket: SocketId, input: Arc<DatagramQueue>, output: Arc<DatagramQueue>);

    /// The socket is gone, by detach, eviction, or engine shutdown.
    fn notify_invalid(&self);
}

/// Identity of an attached user: the address of the user object.
///
/// Two distinct live users never share a key. Equality of their addresses or
/// contents is irrelevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct UserKey(usize);

impl UserKey {
    pub(crate) fn of<U: ?Sized>(user: &U) -> Self {
        Self(std::ptr::from_ref(user).cast::<()>() as usize)
    }
}
