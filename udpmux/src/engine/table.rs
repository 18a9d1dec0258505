//! Registration table and the readiness step run by the worker.
//!
//! The table owns the mio [`Poll`], every attached socket and its queues. It
//! lives behind the engine's mutex; attach, detach and a whole step (poll plus
//! one send and one receive per ready socket) are mutually exclusive, so a
//! socket is never closed while readiness events referencing it are handled.
//!
//! mio is edge-triggered. Each user keeps sticky `readable`/`writable` flags
//! that events set and only a `WouldBlock` clears.

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};
use rustix::io::Errno;

use crate::fatal::fail_fast;
use crate::net::{Datagram, Endpoint, UdpSocket};
use crate::runtime::Step;
use crate::trace::{debug, trace, warn};

use super::EngineConfig;
use super::stats::Stats;
use super::user::{DatagramQueue, Role, UdpUser, UserKey};

fn token_of(socket: &UdpSocket) -> Token {
    Token(socket.id().unsigned_abs() as usize)
}

/// Everything the engine knows about one attached user.
pub(crate) struct UserData {
    user: Arc<dyn UdpUser>,
    address: Endpoint,
    role: Role,
    socket: UdpSocket,
    input: Arc<DatagramQueue>,
    output: Arc<DatagramQueue>,
    /// Datagrams whose send failed, oldest first. Drained before `output`.
    leftovers: VecDeque<Datagram>,
    readable: bool,
    writable: bool,
}

impl UserData {
    /// Attempts exactly one send: the oldest leftover, else the next queued datagram.
    fn send_one(&mut self, stats: &Stats) {
        let Some(dgram) = self.leftovers.pop_front().or_else(|| self.output.pop()) else {
            return;
        };

        let dest = match self.role {
            Role::Client => self.address,
            Role::Server => match dgram.endpoint() {
                Some(endpoint) => endpoint,
                None => {
                    warn!(fd = self.socket.id(), "server datagram without destination, dropped");
                    stats.record_send_failed();
                    return;
                }
            },
        };

        match self.socket.send_to(dgram.bytes(), dest) {
            Ok(_) => {
                trace!(fd = self.socket.id(), %dest, len = dgram.len(), "sent");
                stats.record_sent();
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.writable = false;
                self.leftovers.push_front(dgram);
            }
            Err(_e) => {
                debug!(fd = self.socket.id(), %dest, error = %_e, "send failed, kept for retry");
                stats.record_send_failed();
                self.leftovers.push_front(dgram);
            }
        }
    }

    /// Attempts exactly one receive into `buf`, queueing the result.
    fn receive_one(&mut self, buf: &mut [u8], stats: &Stats) {
        match self.socket.recv_from(buf) {
            Ok((len, source)) => {
                stats.record_received();
                trace!(fd = self.socket.id(), %source, len, "received");
                if len == buf.len() {
                    debug!(fd = self.socket.id(), %source, len, "datagram filled the receive buffer, may be truncated");
                    stats.record_truncated();
                }
                if self.input.push(Datagram::new(source, &buf[..len])).is_err() {
                    debug!(fd = self.socket.id(), %source, "input queue full, datagram dropped");
                    stats.record_input_dropped();
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => self.readable = false,
            Err(_e) => {
                debug!(fd = self.socket.id(), error = %_e, "receive failed");
                stats.record_receive_failed();
            }
        }
    }

    fn consume_error(&self) {
        match self.socket.take_error() {
            Ok(Some(_e)) => {
                warn!(fd = self.socket.id(), error = %_e, "socket error");
            }
            Ok(None) => {}
            Err(_e) => {
                warn!(fd = self.socket.id(), error = %_e, "failed to read socket error");
            }
        }
    }

    /// Has something to send right now.
    fn has_pending_send(&self) -> bool {
        self.writable && self.leftovers.is_empty() && !self.output.is_empty()
    }

    /// Tells the user its socket is gone, then closes the socket.
    fn invalidate(self) {
        self.user.notify_invalid();
    }

    /// Like [`invalidate`](Self::invalidate) for a descriptor that is no longer
    /// open. Its number may already belong to another file, so it is not closed.
    fn abandon(self) {
        let Self { user, socket, .. } = self;
        user.notify_invalid();
        std::mem::forget(socket);
    }
}

/// Attached users keyed by identity, plus the poll instance watching them.
pub(crate) struct Table {
    poll: Poll,
    events: Events,
    users: HashMap<UserKey, UserData>,
    tokens: HashMap<Token, UserKey>,
    recv_buf: Box<[u8]>,
}

impl Table {
    pub(crate) fn new(config: &EngineConfig) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(config.events_capacity.max(1)),
            users: HashMap::new(),
            tokens: HashMap::new(),
            recv_buf: vec![0u8; config.max_datagram_size].into_boxed_slice(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.users.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub(crate) fn contains(&self, key: UserKey) -> bool {
        self.users.contains_key(&key)
    }

    /// Registers `socket` for `user` and hands the user a fresh queue pair.
    ///
    /// On error the socket is closed and the user never hears about it.
    pub(crate) fn insert(
        &mut self,
        key: UserKey,
        user: Arc<dyn UdpUser>,
        role: Role,
        address: Endpoint,
        mut socket: UdpSocket,
        queue_capacity: usize,
    ) -> io::Result<()> {
        let token = token_of(&socket);
        self.poll
            .registry()
            .register(&mut socket, token, Interest::READABLE | Interest::WRITABLE)?;

        let input = Arc::new(DatagramQueue::with_capacity(queue_capacity));
        let output = Arc::new(DatagramQueue::with_capacity(queue_capacity));
        user.set_up(socket.id(), Arc::clone(&input), Arc::clone(&output));

        self.tokens.insert(token, key);
        self.users.insert(
            key,
            UserData {
                user,
                address,
                role,
                socket,
                input,
                output,
                leftovers: VecDeque::new(),
                // Readiness may predate registration; the first attempt settles it.
                readable: true,
                writable: true,
            },
        );
        Ok(())
    }

    fn remove(&mut self, key: UserKey) -> Option<UserData> {
        let mut data = self.users.remove(&key)?;
        self.tokens.remove(&token_of(&data.socket));
        if let Err(_e) = self.poll.registry().deregister(&mut data.socket) {
            debug!(fd = data.socket.id(), error = %_e, "deregister failed");
        }
        Some(data)
    }

    /// Removes `key`, notifying the user. `false` if it was not attached.
    pub(crate) fn detach(&mut self, key: UserKey) -> bool {
        match self.remove(key) {
            Some(data) => {
                data.invalidate();
                true
            }
            None => false,
        }
    }

    /// Detaches every user.
    pub(crate) fn clear(&mut self) {
        let keys: Vec<UserKey> = self.users.keys().copied().collect();
        for key in keys {
            self.detach(key);
        }
    }

    fn evict(&mut self, keys: Vec<UserKey>, _reason: &str, stats: &Stats) -> usize {
        let mut evicted = 0;
        for key in keys {
            if let Some(data) = self.remove(key) {
                warn!(fd = data.socket.id(), address = %data.address, reason = _reason, "evicting user");
                stats.record_evicted();
                data.invalidate();
                evicted += 1;
            }
        }
        evicted
    }

    /// Evicts users whose descriptor cannot be multiplexed.
    fn evict_beyond(&mut self, limit: usize, stats: &Stats) -> usize {
        let doomed: Vec<UserKey> = self
            .users
            .iter()
            .filter(|(_, data)| usize::try_from(data.socket.id()).map_or(true, |fd| fd >= limit))
            .map(|(key, _)| *key)
            .collect();
        if doomed.is_empty() {
            return 0;
        }
        self.evict(doomed, "descriptor beyond limit", stats)
    }

    /// Evicts users whose descriptor is no longer open.
    fn evict_bad_descriptors(&mut self, stats: &Stats) -> usize {
        let doomed: Vec<UserKey> = self
            .users
            .iter()
            .filter(|(_, data)| rustix::io::fcntl_getfd(&data.socket).is_err())
            .map(|(key, _)| *key)
            .collect();
        let mut evicted = 0;
        for key in doomed {
            if let Some(data) = self.remove(key) {
                warn!(fd = data.socket.id(), address = %data.address, "evicting user with bad descriptor");
                stats.record_evicted();
                data.abandon();
                evicted += 1;
            }
        }
        evicted
    }

    /// How long the next poll may block.
    fn wait_time(&self, config: &EngineConfig) -> Duration {
        let mut any_writable = false;
        for data in self.users.values() {
            if data.readable || data.has_pending_send() {
                return Duration::ZERO;
            }
            any_writable |= data.writable;
        }
        if any_writable {
            config.flush_interval.min(config.poll_timeout)
        } else {
            config.poll_timeout
        }
    }

    fn apply_events(&mut self) {
        for event in &self.events {
            let Some(data) = self
                .tokens
                .get(&event.token())
                .and_then(|key| self.users.get_mut(key))
            else {
                continue;
            };
            if event.is_readable() || event.is_read_closed() {
                data.readable = true;
            }
            if event.is_writable() || event.is_write_closed() {
                data.writable = true;
            }
            if event.is_error() {
                data.consume_error();
            }
        }
    }

    /// Handles a failed readiness poll.
    fn recover(&mut self, err: &io::Error, stats: &Stats) -> Step {
        match err.kind() {
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => Step::Continue,
            _ if err.raw_os_error() == Some(Errno::BADF.raw_os_error()) => {
                warn!(error = %err, "bad descriptor in poll set");
                self.evict_bad_descriptors(stats);
                Step::Continue
            }
            _ => fail_fast(&format!("readiness poll failed: {err}")),
        }
    }

    /// One iteration of the worker: poll, then at most one send and one
    /// receive per ready user.
    pub(crate) fn step(&mut self, config: &EngineConfig, stats: &Stats) -> Step {
        self.evict_beyond(config.descriptor_limit, stats);
        if self.users.is_empty() {
            return Step::Continue;
        }

        let wait = self.wait_time(config);
        if let Err(e) = self.poll.poll(&mut self.events, Some(wait)) {
            return self.recover(&e, stats);
        }
        self.apply_events();

        for data in self.users.values_mut() {
            if data.writable {
                data.send_one(stats);
            }
            if data.readable {
                data.receive_one(&mut self.recv_buf, stats);
            }
        }
        Step::Continue
    }
}
