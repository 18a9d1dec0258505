//! Lock-free bounded MPMC queue for in-process (inter-thread) communication.
//!
//! A wait-free bounded queue using a heap-allocated ring buffer with per-slot
//! sequence numbers.
//!
//! # Overview
//!
//! - Any number of threads may [`push`](BoundedQueue::push) and
//!   [`pop`](BoundedQueue::pop) concurrently through a shared reference
//! - No mutexes or syscalls in the hot path; a full or empty queue fails
//!   immediately instead of blocking
//! - Capacity is rounded up to a power of two; a zero capacity yields a
//!   permanently invalid queue
//!
//! # Example
//!
//! ```
//! use udpmux::sync::BoundedQueue;
//!
//! let queue = BoundedQueue::<u64>::with_capacity(1000);
//! assert_eq!(queue.capacity(), 1024);
//!
//! queue.push(42).expect("Queue full");
//! assert_eq!(queue.pop(), Some(42));
//! ```

use std::fmt;
use std::time::Duration;

use minstant::Instant;

use crate::mpmc::ring::Ring;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl Timeout {
    /// Converts the timeout into an absolute deadline measured from now.
    ///
    /// A duration too large to represent as an instant never expires.
    #[must_use]
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            // minstant truncates the nanosecond count to u64 before adding.
            Self::Duration(d) if u64::try_from(d.as_nanos()).is_err() => None,
            Self::Duration(d) => Instant::now().checked_add(d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Returns `true` once `deadline` has passed. `None` never expires.
#[inline]
pub(crate) fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|dl| Instant::now() >= dl)
}

/// Bounded wait-free queue shared between any number of threads.
///
/// Usually held behind an [`Arc`](std::sync::Arc); all operations take `&self`.
pub struct BoundedQueue<T> {
    ring: Ring<T>,
}

impl<T: Send> BoundedQueue<T> {
    /// Creates a queue able to hold at least `capacity` items.
    ///
    /// The real capacity is the next power of two. `capacity == 0` creates an
    /// invalid queue on which every push and pop fails.
    ///
    /// # Panics
    ///
    /// If the rounded capacity does not fit in a `usize`.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Ring::with_capacity(capacity),
        }
    }

    /// Number of items the queue can hold.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// `false` for a zero-capacity queue.
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.capacity() > 0
    }

    /// Approximate number of queued items.
    ///
    /// Exact only when no other thread is pushing or popping.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Approximate emptiness check, see [`len`](Self::len).
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to push an item onto the queue (wait-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full or invalid, allowing retry.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        self.ring.push(item)
    }

    /// Attempts to pop an item from the queue (wait-free).
    ///
    /// Returns `None` if the queue is empty or invalid.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        self.ring.pop()
    }

    /// Spins until space is available, then pushes.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` on timeout, or immediately if the queue is invalid.
    pub fn push_blocking(&self, mut item: T, timeout: Timeout) -> Result<(), T> {
        if !self.is_valid() {
            return Err(item);
        }
        let deadline = timeout.deadline();
        loop {
            match self.push(item) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    item = returned;
                    if expired(deadline) {
                        return Err(item);
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Spins until an item is available, then pops.
    ///
    /// Returns `None` on timeout, or immediately if the queue is invalid.
    #[must_use]
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<T> {
        if !self.is_valid() {
            return None;
        }
        let deadline = timeout.deadline();
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if expired(deadline) {
                return None;
            }
            std::hint::spin_loop();
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.ring.capacity())
            .field("len", &self.ring.len())
            .finish()
    }
}
