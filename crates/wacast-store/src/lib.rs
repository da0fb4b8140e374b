//! # Wacast Store
//!
//! The Durable Store: one JSON document on disk, safely shared by the
//! gateway process and the worker process. An advisory lock directory
//! with staleness detection and a heartbeat makes multi-process
//! read-modify-write safe; every write is an atomic temp-file + rename.

pub mod lock;
pub mod store;

pub use lock::{DocumentLock, LockOptions};
pub use store::DurableStore;
