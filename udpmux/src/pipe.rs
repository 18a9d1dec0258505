//! Blocking datagram pipe over a [`SocketMultiplexEngine`].
//!
//! A [`UdpPipe`] is a ready-made [`UdpUser`]: it attaches one socket and
//! exposes timeout-bounded read and write calls on the queues the engine
//! hands it. The [`PipeEnd::Read`] end listens on an address, the
//! [`PipeEnd::Write`] end talks to one.
//!
//! ```no_run
//! use udpmux::engine::{EngineConfig, SocketMultiplexEngine};
//! use udpmux::net::Datagram;
//! use udpmux::pipe::{PipeEnd, UdpPipe};
//! use udpmux::sync::Timeout;
//! use std::time::Duration;
//!
//! let engine = SocketMultiplexEngine::new(EngineConfig::default())?;
//! engine.start_up(Timeout::Infinite)?;
//!
//! let reader = UdpPipe::open(&engine, PipeEnd::Read, "127.0.0.1", 6000)?;
//! let writer = UdpPipe::open(&engine, PipeEnd::Write, "127.0.0.1", 6000)?;
//!
//! writer.write_datagram(Datagram::from_bytes(&b"hello"[..]), Timeout::Infinite)?;
//! let dgram = reader.read_datagram(Duration::from_millis(500).into())?;
//! assert_eq!(dgram.bytes(), b"hello");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use crate::Outcome;
use crate::engine::{DatagramQueue, EngineError, Role, SocketId, SocketMultiplexEngine, UdpUser};
use crate::net::Datagram;
use crate::sync::Timeout;
use crate::trace::debug;

/// Which side of a pipe to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    /// Bound to the address, receiving from anyone ([`Role::Server`]).
    Read,
    /// Sending to the address from an ephemeral port ([`Role::Client`]).
    Write,
}

impl PipeEnd {
    const fn role(self) -> Role {
        match self {
            Self::Read => Role::Server,
            Self::Write => Role::Client,
        }
    }
}

/// Error from a pipe operation.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// The pipe was closed, or the engine invalidated its socket.
    #[error("pipe is closed")]
    Closed,
    /// Nothing arrived, or the output queue stayed full, within the timeout.
    #[error("pipe operation timed out")]
    Timeout,
    /// Attaching or detaching the socket failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Clone)]
struct Queues {
    input: Arc<DatagramQueue>,
    output: Arc<DatagramQueue>,
}

/// The registered half of a pipe; the engine holds it while attached.
#[derive(Default)]
struct Link {
    socket: Mutex<Option<SocketId>>,
    queues: Mutex<Option<Queues>>,
}

impl Link {
    fn queues(&self) -> Option<Queues> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl UdpUser for Link {
    fn set_up(&self, socket: SocketId, input: Arc<DatagramQueue>, output: Arc<DatagramQueue>) {
        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(socket);
        *self.queues.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Queues { input, output });
    }

    fn notify_invalid(&self) {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// One end of a datagram pipe. Detaches its socket when dropped.
pub struct UdpPipe<'e> {
    engine: &'e SocketMultiplexEngine,
    link: Arc<Link>,
    end: PipeEnd,
}

impl<'e> UdpPipe<'e> {
    /// Resolves `host:port` and attaches a socket for the requested end.
    ///
    /// # Errors
    ///
    /// [`PipeError::Engine`] if resolution or attach fails.
    pub fn open(
        engine: &'e SocketMultiplexEngine,
        end: PipeEnd,
        host: &str,
        port: u16,
    ) -> Result<Self, PipeError> {
        let link = Arc::new(Link::default());
        engine.attach_socket_at(link.clone(), end.role(), host, port)?;
        debug!(?end, host, port, "pipe opened");
        Ok(Self { engine, link, end })
    }

    /// Which end this pipe is.
    #[must_use]
    pub const fn end(&self) -> PipeEnd {
        self.end
    }

    /// `false` once closed or invalidated by the engine.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.link.queues().is_some()
    }

    /// Socket id assigned at attach, while open.
    #[must_use]
    pub fn socket_id(&self) -> Option<SocketId> {
        *self
            .link
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the next inbound datagram. Its endpoint is the sender.
    ///
    /// # Errors
    ///
    /// [`PipeError::Closed`] if the pipe is not open, [`PipeError::Timeout`]
    /// if nothing arrived in time.
    pub fn read_datagram(&self, timeout: Timeout) -> Result<Datagram, PipeError> {
        let queues = self.link.queues().ok_or(PipeError::Closed)?;
        queues.input.pop_blocking(timeout).ok_or(PipeError::Timeout)
    }

    /// Queues `dgram` for sending, waiting for room up to `timeout`.
    ///
    /// On the read end the datagram's endpoint is the destination, so a
    /// received datagram written back is a reply to its sender.
    ///
    /// # Errors
    ///
    /// [`PipeError::Closed`] if the pipe is not open, [`PipeError::Timeout`]
    /// if the output queue stayed full.
    pub fn write_datagram(&self, dgram: Datagram, timeout: Timeout) -> Result<(), PipeError> {
        let queues = self.link.queues().ok_or(PipeError::Closed)?;
        queues
            .output
            .push_blocking(dgram, timeout)
            .map_err(|_| PipeError::Timeout)
    }

    /// Detaches the socket. Closing twice returns [`Outcome::Already`].
    ///
    /// # Errors
    ///
    /// Propagates engine errors other than "not attached".
    pub fn close(&self) -> Result<Outcome, PipeError> {
        match self.engine.detach_socket(&*self.link) {
            Ok(outcome) => Ok(outcome),
            Err(EngineError::NotAttached) => Ok(Outcome::Already),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for UdpPipe<'_> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for UdpPipe<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpPipe")
            .field("end", &self.end)
            .field("socket", &self.socket_id())
            .finish_non_exhaustive()
    }
}
