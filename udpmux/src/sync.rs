//! Synchronization primitives for in-process communication.
//!
//! This module provides the thread-safe bounded queue used as the datagram
//! mailbox between caller threads and the engine worker.

pub mod queue;

pub use queue::{BoundedQueue, Timeout};
