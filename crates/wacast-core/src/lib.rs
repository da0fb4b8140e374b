//! # Wacast Core
//!
//! Shared foundation for the Wacast scheduler: the persisted document
//! model, configuration, error taxonomy, time/window math, and the
//! `Messenger` seam to the WhatsApp protocol adapter.
//!
//! Two processes share the same on-disk document — the HTTP gateway and
//! the worker — so everything here is plain data plus pure helpers; all
//! mutation goes through `wacast-store`.

pub mod config;
pub mod error;
pub mod jid;
pub mod time;
pub mod traits;
pub mod types;

pub use config::WacastConfig;
pub use error::{Result, WacastError};
pub use traits::{Messenger, MessengerFactory};
pub use types::{
    Audience, Block, ConnStatus, DeliveryWindow, Document, FlowProgress, IncomingReply, Job,
    JobPayload, JobStatus, LogEntry, MediaInfo, MediaKind, MessageFlow, PendingSend, PendingStage,
    ReplyMode, SmallDuration, UserAccount, UserSource, WaStatus, WaitingReply,
};
