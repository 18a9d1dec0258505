//! Socket multiplexing engine.
//!
//! One background worker drives any number of attached UDP sockets through a
//! single readiness poll. Each attached party (a [`UdpUser`]) gets an input
//! and an output [`DatagramQueue`]; callers push and pop on those queues from
//! any thread while the worker moves bytes between them and the kernel.
//!
//! # Architecture
//!
//! ```text
//!   caller threads                     worker thread
//!   ──────────────                     ─────────────
//!   output.push(dgram) ──┐        ┌──> poll (bounded wait)
//!                        ├─ queues┤    per ready socket:
//!   input.pop()  <───────┘        └──    one send  (leftovers first)
//!                                        one receive (drop if input full)
//!   attach / detach ── table mutex ──── held for the whole step
//! ```
//!
//! Sends and receives are bounded to one each per socket per step so a busy
//! socket cannot starve the others within a poll cycle.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use udpmux::engine::{EngineConfig, Role, SocketMultiplexEngine, UdpUser};
//! use udpmux::net::Endpoint;
//! use udpmux::sync::Timeout;
//! # fn user() -> Arc<dyn UdpUser> { unimplemented!() }
//!
//! let engine = SocketMultiplexEngine::new(EngineConfig::default())?;
//! engine.start_up(Timeout::Infinite)?;
//! engine.attach_socket(user(), Role::Server, Endpoint::any(5051))?;
//! // ... exchange datagrams through the queues handed to the user ...
//! engine.tear_down(Timeout::Infinite)?;
//! # Ok::<(), udpmux::engine::EngineError>(())
//! ```

mod stats;
mod table;
mod user;

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::Outcome;
use crate::net::{Endpoint, ResolveError, UdpSocket, resolve};
use crate::runtime::{ManagedWorker, Step, WorkerConfig, WorkerError};
use crate::sync::Timeout;
use crate::trace::{debug, error, info, warn};

pub use stats::StatsSnapshot;
pub use user::{DatagramQueue, Role, UdpUser};

pub use crate::net::SocketId;

use stats::Stats;
use table::Table;
use user::UserKey;

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Requested capacity of each input and output queue (rounded up to a
    /// power of two).
    pub queue_capacity: usize,
    /// Receive buffer size; longer datagrams are truncated.
    pub max_datagram_size: usize,
    /// Upper bound of one readiness wait.
    pub poll_timeout: Duration,
    /// Readiness wait while some socket is writable but nothing is queued.
    pub flush_interval: Duration,
    /// Pause taken by a step when no socket is attached.
    pub idle_interval: Duration,
    /// Users whose descriptor is at or above this value are evicted.
    pub descriptor_limit: usize,
    /// Readiness events collected per poll.
    pub events_capacity: usize,
    /// `SO_SNDBUF` for attached sockets; `None` keeps the OS default.
    pub send_buffer_size: Option<usize>,
    /// `SO_RCVBUF` for attached sockets; `None` keeps the OS default.
    pub recv_buffer_size: Option<usize>,
    /// Worker thread settings.
    pub worker: WorkerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 512,
            max_datagram_size: 1024,
            poll_timeout: Duration::from_secs(1),
            flush_interval: Duration::from_millis(1),
            idle_interval: Duration::from_millis(5),
            descriptor_limit: 1024,
            events_capacity: 1024,
            send_buffer_size: None,
            recv_buffer_size: None,
            worker: WorkerConfig::default(),
        }
    }
}

/// Error from an engine operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Starting or stopping the worker failed or timed out.
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    /// The user is not attached.
    #[error("user is not attached")]
    NotAttached,
    /// The socket could not be created or bound.
    #[error("failed to open socket for {address}: {source}")]
    Socket {
        address: Endpoint,
        #[source]
        source: io::Error,
    },
    /// The socket could not be added to the poll set.
    #[error("failed to register socket: {0}")]
    Register(#[source] io::Error),
    /// The poll instance could not be created.
    #[error("failed to create poll instance: {0}")]
    Poll(#[source] io::Error),
    /// Address resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// State shared between the engine handle and its worker's step function.
struct EngineCore {
    config: EngineConfig,
    table: Mutex<Table>,
    stats: Stats,
}

impl EngineCore {
    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn step(&self) -> Step {
        let mut table = self.lock_table();
        if table.is_empty() {
            drop(table);
            thread::sleep(self.config.idle_interval);
            return Step::Continue;
        }
        table.step(&self.config, &self.stats)
    }
}

/// Binds the socket for `role` and applies the configured buffer sizes.
fn open_socket(config: &EngineConfig, role: Role, address: Endpoint) -> io::Result<UdpSocket> {
    let socket = match role {
        Role::Server => UdpSocket::bind(address)?,
        Role::Client => UdpSocket::bind_client(address)?,
    };
    if let Some(size) = config.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = config.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    Ok(socket)
}

/// UDP socket multiplexer owning one worker thread.
///
/// Share it by reference or behind an [`Arc`]; every method takes `&self`.
pub struct SocketMultiplexEngine {
    core: Arc<EngineCore>,
    worker: ManagedWorker,
}

impl SocketMultiplexEngine {
    /// Creates a stopped engine with no sockets attached.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Poll`] if the OS poll instance cannot be created.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let table = Table::new(&config).map_err(EngineError::Poll)?;
        let core = Arc::new(EngineCore {
            config,
            table: Mutex::new(table),
            stats: Stats::default(),
        });

        let step_core = Arc::clone(&core);
        let worker = ManagedWorker::new(core.config.worker.clone(), move || step_core.step());

        Ok(Self { core, worker })
    }

    /// Starts the worker. See [`ManagedWorker::start`].
    ///
    /// # Errors
    ///
    /// [`EngineError::Worker`] on spawn failure or timeout.
    pub fn start_up(&self, timeout: Timeout) -> Result<Outcome, EngineError> {
        let outcome = self.worker.start(timeout)?;
        if outcome == Outcome::Done {
            info!(attached = self.attached_count(), "engine started");
        }
        Ok(outcome)
    }

    /// Stops the worker. Attached sockets stay attached. See
    /// [`ManagedWorker::stop`].
    ///
    /// # Errors
    ///
    /// [`EngineError::Worker`] on timeout.
    pub fn tear_down(&self, timeout: Timeout) -> Result<Outcome, EngineError> {
        let outcome = self.worker.stop(timeout)?;
        if outcome == Outcome::Done {
            info!("engine stopped");
        }
        Ok(outcome)
    }

    /// `true` unless the worker is down.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Opens a socket for `user` and starts multiplexing it.
    ///
    /// A [`Role::Server`] socket is bound to `address`; a [`Role::Client`]
    /// socket gets an ephemeral port and sends everything to `address`. On
    /// success the user's [`UdpUser::set_up`] receives the socket id and queue
    /// pair. Attaching a user that is already attached returns
    /// [`Outcome::Already`] and leaves it untouched.
    ///
    /// May block behind an in-flight poll for up to `poll_timeout`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Socket`] or [`EngineError::Register`]; no socket is left
    /// open and the user is not notified.
    pub fn attach_socket(
        &self,
        user: Arc<dyn UdpUser>,
        role: Role,
        address: Endpoint,
    ) -> Result<Outcome, EngineError> {
        let key = UserKey::of(&*user);
        let mut table = self.core.lock_table();
        if table.contains(key) {
            return Ok(Outcome::Already);
        }

        let socket = open_socket(&self.core.config, role, address).map_err(|source| {
            warn!(%address, ?role, error = %source, "failed to open socket");
            EngineError::Socket { address, source }
        })?;
        let _fd = socket.id();

        table
            .insert(key, user, role, address, socket, self.core.config.queue_capacity)
            .map_err(|e| {
                warn!(%address, fd = _fd, error = %e, "failed to register socket");
                EngineError::Register(e)
            })?;

        info!(%address, ?role, fd = _fd, "socket attached");
        Ok(Outcome::Done)
    }

    /// Resolves `host:port`, then attaches as [`attach_socket`](Self::attach_socket).
    ///
    /// # Errors
    ///
    /// [`EngineError::Resolve`] if the name does not resolve, otherwise as
    /// `attach_socket`.
    pub fn attach_socket_at(
        &self,
        user: Arc<dyn UdpUser>,
        role: Role,
        host: &str,
        port: u16,
    ) -> Result<Outcome, EngineError> {
        let address = resolve(host, port)?;
        self.attach_socket(user, role, address)
    }

    /// Detaches `user`: notifies it, closes its socket, drops its queues.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotAttached`] if `user` is not attached.
    pub fn detach_socket<U: UdpUser + ?Sized>(&self, user: &U) -> Result<Outcome, EngineError> {
        if self.core.lock_table().detach(UserKey::of(user)) {
            debug!("socket detached");
            Ok(Outcome::Done)
        } else {
            Err(EngineError::NotAttached)
        }
    }

    /// Number of attached users.
    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.core.lock_table().len()
    }

    /// Current worker counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }
}

impl Drop for SocketMultiplexEngine {
    fn drop(&mut self) {
        self.core.lock_table().clear();

        if self.worker.is_running() {
            warn!("dropping a running engine, forcing stop");
            if let Err(_e) = self.worker.stop(Timeout::Infinite) {
                error!(error = %_e, "failed to stop engine worker");
            }
        }
    }
}

impl std::fmt::Debug for SocketMultiplexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketMultiplexEngine")
            .field("state", &self.worker.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
