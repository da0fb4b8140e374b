//! The decide/act/record protocol's handoff type.
//!
//! A tick decides what to do for a job inside one guarded store
//! transaction (marking the job claimed), performs the slow messaging
//! call with the lock released, then records the outcome in a second
//! transaction that re-checks the job is still active. `ClaimedWork`
//! carries the decide phase's snapshot into act and record.
//!
//! Caveat: a crash between act and record can leave a send delivered but
//! unrecorded; the next tick re-claims the job and may send again. This
//! is at-least-once delivery, accepted because the messaging backend
//! offers no idempotent send.

use wacast_core::types::{Audience, MediaInfo, PendingStage, WaitingReply};

/// Work claimed for one job during the decide phase.
#[derive(Debug, Clone)]
pub struct ClaimedWork<T> {
    pub job_id: String,
    pub user_id: String,
    pub work: T,
}

/// Snapshot for one status-broadcast delivery attempt.
#[derive(Debug, Clone)]
pub struct StatusSend {
    pub media: MediaInfo,
    pub caption: Option<String>,
    pub audience: Audience,
    /// End of the window the attempt was claimed in; bounds the retry.
    pub window_end_ms: i64,
}

/// What a flow tick decided to do outside the lock.
#[derive(Debug, Clone)]
pub enum FlowAction {
    /// Nothing due this tick (delay pending, retry not due, wait armed).
    Idle,
    /// Deliver one message to the flow's destination.
    Send {
        stage: PendingStage,
        block_index: Option<usize>,
        jid: String,
        text: String,
        media: Option<MediaInfo>,
    },
    /// Poll inbound messages against an open wait.
    CheckReply { jid: String, wait: WaitingReply },
}
