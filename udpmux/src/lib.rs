//! UDP socket multiplexing engine.
//!
//! A single background worker polls any number of attached UDP sockets and
//! moves datagrams between them and per-socket wait-free queues:
//!
//! - [`sync::BoundedQueue`]: bounded lock-free MPMC queue
//! - [`runtime::ManagedWorker`]: idempotent, race-free start/stop of one thread
//! - [`engine::SocketMultiplexEngine`]: the socket table and readiness loop
//! - [`pipe::UdpPipe`]: blocking read/write ends built on the engine
//!
//! Enable the `tracing` feature for structured logs and call
//! [`init_tracing`] at startup.

pub mod engine;
pub mod fatal;
pub(crate) mod mpmc;
pub mod net;
pub mod pipe;
pub mod runtime;
pub mod sync;
mod trace;

pub use engine::{EngineConfig, EngineError, Role, SocketMultiplexEngine, UdpUser};
pub use trace::{init_tracing, init_tracing_with};

/// Successful result of an idempotent operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// This call performed the operation.
    Done,
    /// The operation's effect already held; nothing was done.
    Already,
}
