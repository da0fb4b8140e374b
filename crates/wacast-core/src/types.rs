//! The persisted document model — users, jobs, WhatsApp status, log.
//!
//! Everything in this file round-trips through the single JSON document
//! guarded by `wacast-store`. Timestamps are epoch milliseconds (`i64`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current schema version of the document.
pub const SCHEMA_VERSION: u32 = 2;

/// Maximum retained log entries (most-recent-first ring buffer).
pub const LOG_CAP: usize = 1000;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancel,
}

impl JobStatus {
    /// Terminal statuses are frozen — the worker never touches them again.
    /// `Failed` is NOT terminal: failed jobs stay eligible for retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Cancel)
    }
}

/// Media kind for uploaded status/message attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
}

/// An uploaded media file referenced by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub original_name: String,
    /// Path relative to the data directory, e.g. `media/user_1/abc.jpg`.
    pub relative_path: String,
    pub mime: String,
    pub kind: MediaKind,
    pub size_bytes: u64,
}

/// Who receives a status broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Audience {
    MyContacts,
    /// All contacts except the listed numbers (digits only, no `+`).
    MyContactsExcluded { numbers: Vec<String> },
    /// Only the listed numbers.
    OnlyShareWith { numbers: Vec<String> },
}

/// The two timed delivery windows of a status-broadcast job, fixed at
/// creation time: 2 minutes each, separated by a 10-minute cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryWindow {
    pub window1_start_ms: i64,
    pub window1_end_ms: i64,
    pub window2_start_ms: i64,
    pub window2_end_ms: i64,
}

/// Wait-reply matching mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    Any,
    Exact,
}

/// Hour/minute/second triple used by delay blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SmallDuration {
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

impl SmallDuration {
    /// Convert to milliseconds, clamping negative components to zero.
    pub fn to_ms(self) -> i64 {
        let h = self.hours.max(0);
        let m = self.minutes.max(0);
        let s = self.seconds.max(0);
        (h * 3600 + m * 60 + s) * 1000
    }
}

/// One step of a send-message flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    /// Pause the flow for a fixed duration. Zero is invalid and fails the
    /// job at execution time.
    Delay { id: String, duration: SmallDuration },
    /// Park the flow until a matching reply arrives (24h timeout).
    WaitReply {
        id: String,
        mode: ReplyMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_text: Option<String>,
    },
    /// Send another message text to the same destination.
    Send { id: String, text: String },
}

/// Which send a `PendingSend` tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStage {
    Initial,
    Block,
}

/// An in-flight or retrying send attempt inside a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSend {
    pub stage: PendingStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_index: Option<usize>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// An open wait-for-reply installed by a `WaitReply` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingReply {
    pub mode: ReplyMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_text: Option<String>,
    pub started_at_ms: i64,
    pub timeout_at_ms: i64,
    pub block_index: usize,
}

/// Mutable cursor of a send-message flow. At most one of `pending_send`
/// and `waiting_reply` is set; neither set means "advance to next block".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowProgress {
    #[serde(default)]
    pub initial_sent: bool,
    #[serde(default)]
    pub next_block_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_send: Option<PendingSend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_reply: Option<WaitingReply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reply_match_ms: Option<i64>,
}

/// A templated multi-step direct-message job body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFlow {
    /// Destination number, digits only (e.g. `62812xxxx`).
    pub destination: String,
    pub initial_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaInfo>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub progress: FlowProgress,
}

/// The kind-specific half of a job. Tagged so the two kinds' mutually
/// exclusive fields cannot coexist in one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    StatusBroadcast {
        window: DeliveryWindow,
        media: MediaInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        audience: Audience,
    },
    MessageFlow { flow: MessageFlow },
}

/// One scheduled WhatsApp action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// May be empty in pre-v2 documents; normalization re-owns such jobs.
    #[serde(default)]
    pub user_id: String,
    pub created_at_ms: i64,
    /// Target time computed at creation (`now + requested duration`).
    pub target_ms: i64,
    pub status: JobStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    #[serde(flatten)]
    pub payload: JobPayload,
}

impl Job {
    /// Active jobs are everything the worker may still touch.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Terminal failure: record the error and freeze retry scheduling.
    pub fn fail_terminal(&mut self, message: impl Into<String>, now_ms: i64) {
        self.status = JobStatus::Failed;
        self.last_error = Some(message.into());
        self.finished_at_ms = Some(now_ms);
        self.next_retry_at_ms = None;
    }

    /// Mark the job done.
    pub fn succeed(&mut self, now_ms: i64) {
        self.status = JobStatus::Success;
        self.finished_at_ms = Some(now_ms);
        self.last_error = None;
        self.next_retry_at_ms = None;
    }

    /// All media paths this job references (for GC once terminal).
    pub fn media_paths(&self) -> Vec<String> {
        match &self.payload {
            JobPayload::StatusBroadcast { media, .. } => vec![media.relative_path.clone()],
            JobPayload::MessageFlow { flow } => flow
                .media
                .as_ref()
                .map(|m| vec![m.relative_path.clone()])
                .unwrap_or_default(),
        }
    }

    pub fn as_flow_mut(&mut self) -> Option<&mut MessageFlow> {
        match &mut self.payload {
            JobPayload::MessageFlow { flow } => Some(flow),
            _ => None,
        }
    }

    pub fn as_flow(&self) -> Option<&MessageFlow> {
        match &self.payload {
            JobPayload::MessageFlow { flow } => Some(flow),
            _ => None,
        }
    }
}

/// Connection state of a user's WhatsApp session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnStatus {
    Offline,
    Connecting,
    Connected,
    LoggedOut,
}

/// Per-user WhatsApp connection record, written by the worker and read by
/// the gateway/UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaStatus {
    pub status: ConnStatus,
    #[serde(default)]
    pub qr: Option<String>,
    pub last_update_ms: i64,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl WaStatus {
    /// Fresh offline record, used when backfilling missing users.
    pub fn offline(now_ms: i64) -> Self {
        Self {
            status: ConnStatus::Offline,
            qr: None,
            last_update_ms: now_ms,
            number: None,
            note: None,
        }
    }
}

/// Where a user account came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserSource {
    Env,
    Register,
}

/// A dashboard user account. Credential verification itself lives in the
/// HTTP layer; the store only keeps the digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub name: String,
    pub name_lower: String,
    pub password_hash: String,
    pub created_at_ms: i64,
    pub source: UserSource,
}

/// One log line in the bounded, most-recent-first log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// The single root document persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub version: u32,
    #[serde(default)]
    pub users: Vec<UserAccount>,
    #[serde(default)]
    pub wa_by_user: BTreeMap<String, WaStatus>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

impl Document {
    /// Empty document at the current schema version.
    pub fn empty() -> Self {
        Self {
            version: SCHEMA_VERSION,
            users: Vec::new(),
            wa_by_user: BTreeMap::new(),
            jobs: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn find_job_mut(&mut self, job_id: &str, user_id: &str) -> Option<&mut Job> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.user_id == user_id)
    }

    pub fn find_job(&self, job_id: &str, user_id: &str) -> Option<&Job> {
        self.jobs
            .iter()
            .find(|j| j.id == job_id && j.user_id == user_id)
    }

    /// Prepend a log entry and truncate to the ring-buffer cap.
    pub fn push_log(&mut self, entry: LogEntry) {
        self.log.insert(0, entry);
        self.log.truncate(LOG_CAP);
    }
}

/// An inbound direct message observed by the messaging adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingReply {
    pub jid: String,
    pub text: String,
    pub at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Cancel.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_small_duration_clamps_negative() {
        let d = SmallDuration { hours: -1, minutes: 2, seconds: -30 };
        assert_eq!(d.to_ms(), 2 * 60 * 1000);
        assert_eq!(SmallDuration::default().to_ms(), 0);
    }

    #[test]
    fn test_job_payload_tagged_roundtrip() {
        let job = Job {
            id: "job-1".into(),
            user_id: "user_admin".into(),
            created_at_ms: 1,
            target_ms: 2,
            status: JobStatus::Queued,
            attempt_count: 0,
            last_attempt_at_ms: None,
            next_retry_at_ms: None,
            last_error: None,
            finished_at_ms: None,
            payload: JobPayload::MessageFlow {
                flow: MessageFlow {
                    destination: "62812000".into(),
                    initial_text: "hi".into(),
                    media: None,
                    blocks: vec![Block::WaitReply {
                        id: "b1".into(),
                        mode: ReplyMode::Exact,
                        expected_text: Some("ok".into()),
                    }],
                    progress: FlowProgress::default(),
                },
            },
        };

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["kind"], "message_flow");
        assert_eq!(json["flow"]["blocks"][0]["kind"], "wait_reply");

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_log_ring_buffer_cap() {
        let mut doc = Document::empty();
        for i in 0..(LOG_CAP + 5) {
            doc.push_log(LogEntry {
                id: format!("log-{i}"),
                at_ms: i as i64,
                user_id: None,
                kind: "job_created".into(),
                detail: serde_json::Value::Null,
            });
        }
        assert_eq!(doc.log.len(), LOG_CAP);
        // Most recent first.
        assert_eq!(doc.log[0].id, format!("log-{}", LOG_CAP + 4));
    }
}
