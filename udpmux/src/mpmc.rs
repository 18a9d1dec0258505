//! Core MPMC (Multi-Producer Multi-Consumer) queue primitives.
//!
//! This module contains the bounded wait-free ring buffer algorithm shared by
//! the public queue types.
//!
//! Used by:
//! - [`crate::sync::queue`] - In-process datagram mailboxes and general queues

pub(crate) mod ring;
