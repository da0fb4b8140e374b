//! # Wacast Worker
//!
//! The scheduling half of Wacast: a polling loop that advances every
//! active job through its state machine. Status broadcasts move through
//! timed delivery windows with in-window retries; message flows step
//! through delay / wait-reply / send blocks with a fixed retry budget.
//! All document mutation goes through the Durable Store's guarded
//! transactions using a decide / act / record protocol.

pub mod claim;
pub mod flow;
pub mod phase;
pub mod runtime;
pub mod worker;

pub use claim::{ClaimedWork, FlowAction, StatusSend};
pub use flow::{RetryDecision, compute_retry_decision, matches_wait_reply, normalize_reply_text};
pub use phase::{Phase, active_window_end, compute_next_retry, determine_phase};
pub use runtime::WorkerRuntime;
pub use worker::{run, tick};
