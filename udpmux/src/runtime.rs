//! Runtime scaffolding for the engine's background thread.
//!
//! - `worker`: idempotent, race-free start/stop of a single step-driven thread.

pub mod worker;

pub use worker::{ManagedWorker, Step, WorkerConfig, WorkerError, WorkerState};
