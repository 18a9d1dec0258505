//! Diagnostic counters of the engine's worker.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters, bumped by the worker thread only.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    sent: AtomicU64,
    received: AtomicU64,
    send_failed: AtomicU64,
    receive_failed: AtomicU64,
    input_dropped: AtomicU64,
    truncated: AtomicU64,
    evicted: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Stats {
    counter! {
        record_sent => sent,
        record_received => received,
        record_send_failed => send_failed,
        record_receive_failed => receive_failed,
        record_input_dropped => input_dropped,
        record_truncated => truncated,
        record_evicted => evicted,
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            send_failed: self.send_failed.load(Ordering::Relaxed),
            receive_failed: self.receive_failed.load(Ordering::Relaxed),
            input_dropped: self.input_dropped.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters.
///
/// Counters are read independently, so a snapshot taken while the worker runs
/// is not atomic across fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Datagrams handed to the kernel.
    pub sent: u64,
    /// Datagrams read from sockets, including dropped ones.
    pub received: u64,
    /// Send attempts that failed with an error other than `WouldBlock`.
    pub send_failed: u64,
    /// Receive attempts that failed with an error other than `WouldBlock`.
    pub receive_failed: u64,
    /// Received datagrams discarded because the input queue was full.
    pub input_dropped: u64,
    /// Received datagrams that filled the receive buffer and may have been
    /// cut to `max_datagram_size`.
    pub truncated: u64,
    /// Users removed by the engine rather than by detach.
    pub evicted: u64,
}
