//! Core lock-free MPMC ring buffer algorithm.
//!
//! This module provides a bounded wait-free MPMC (Multi-Producer Multi-Consumer)
//! ring buffer using per-slot sequence numbers for synchronization.
//!
//! # Algorithm
//!
//! The algorithm is Dmitry Vyukov's bounded MPMC queue:
//!
//! - Each slot has an atomic sequence number
//! - Producers CAS the enqueue cursor to claim exclusive write positions
//! - After writing, producers publish by setting `slot.seq = pos + 1`
//! - Consumers CAS the dequeue cursor once `slot.seq == pos + 1`
//! - After reading, consumers release the slot by setting `slot.seq = pos + N`
//!
//! Cursors are monotonic counters; a slot can only be claimed again once the
//! opposite side has moved its sequence a full lap ahead, so overwrites and
//! ABA are impossible.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A slot in the ring buffer with sequence number for synchronization.
#[repr(C)]
#[repr(align(64))] // Each slot on its own cache line to avoid false sharing between producers
pub(crate) struct Slot<T> {
    /// Sequence number for synchronization.
    /// - Initial: slot index (0, 1, 2, ..., N-1)
    /// - After producer write: position + 1 (signals "data ready")
    /// - After consumer read: position + N (signals "slot free")
    seq: AtomicUsize,

    /// The actual data stored in this slot.
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new(seq: usize) -> Self {
        Self {
            seq: AtomicUsize::new(seq),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// A claim cursor padded to its own cache line.
///
/// The enqueue and dequeue cursors are hammered by different threads, so they
/// must never share a line.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct Cursor {
    pos: AtomicUsize,
}

impl Cursor {
    const fn new() -> Self {
        Self {
            pos: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn load(&self) -> usize {
        self.pos.load(Ordering::Relaxed)
    }

    #[inline]
    fn claim(&self, pos: usize) -> Result<usize, usize> {
        self.pos
            .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
    }
}

/// Rounds a requested capacity up to the ring's real capacity.
///
/// Zero stays zero: such a ring rejects every operation.
///
/// # Panics
///
/// If no power of two `>= requested` fits in a `usize`.
pub(crate) const fn ring_capacity(requested: usize) -> usize {
    if requested == 0 {
        return 0;
    }
    match requested.checked_next_power_of_two() {
        Some(capacity) => capacity,
        None => panic!("ring capacity overflows usize"),
    }
}

/// Core MPMC ring buffer structure.
pub(crate) struct Ring<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    enqueue: Cursor,
    dequeue: Cursor,
}

impl<T> Ring<T> {
    /// Allocates a ring holding at least `requested` items.
    pub(crate) fn with_capacity(requested: usize) -> Self {
        let capacity = ring_capacity(requested);
        debug_assert!(capacity == 0 || capacity.is_power_of_two());
        let buffer = (0..capacity).map(Slot::new).collect();
        Self {
            buffer,
            mask: capacity.wrapping_sub(1),
            enqueue: Cursor::new(),
            dequeue: Cursor::new(),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to push an item onto the queue.
    ///
    /// Returns `Err(item)` if the queue is full or has zero capacity.
    #[inline]
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        if self.buffer.is_empty() {
            return Err(item);
        }

        let mut pos = self.enqueue.load();
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);

            // Handles wrapping correctly.
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match self.enqueue.claim(pos) {
                    Ok(_) => {
                        // SAFETY: We have exclusive write access because:
                        // - CAS succeeded, so no other producer can claim this slot
                        // - seq == pos means the consumer of the previous lap released it
                        unsafe {
                            (*slot.value.get()).write(item);
                        }
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // seq < pos: the slot still holds last lap's item. Queue is full.
                return Err(item);
            } else {
                // Another producer took this position.
                pos = self.enqueue.load();
            }
        }
    }

    /// Attempts to pop an item from the queue.
    #[inline]
    pub(crate) fn pop(&self) -> Option<T> {
        if self.buffer.is_empty() {
            return None;
        }

        let mut pos = self.dequeue.load();
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.dequeue.claim(pos) {
                    Ok(_) => {
                        // SAFETY: The Acquire load of seq == pos + 1 synchronizes with
                        // the producer's Release store, so the value is initialized,
                        // and the CAS gives this consumer sole ownership of it.
                        let item = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq
                            .store(pos.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
                        return Some(item);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue.load();
            }
        }
    }

    /// Approximate number of queued items. Exact only when quiescent.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        let tail = self.dequeue.load();
        let head = self.enqueue.load();
        head.wrapping_sub(tail).min(self.capacity())
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

// SAFETY: Ring is Send because it owns its items and all other fields are Send.
unsafe impl<T: Send> Send for Ring<T> {}

// SAFETY: Ring is Sync because concurrent access is mediated by atomics:
// - Producers and consumers claim positions via CAS on their cursor
// - Per-slot sequence numbers order the payload write before the read
unsafe impl<T: Send> Sync for Ring<T> {}
