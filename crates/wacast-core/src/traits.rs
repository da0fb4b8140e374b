//! Seams to the external WhatsApp protocol adapter.
//!
//! The protocol client itself is a black box; the worker only speaks
//! through `Messenger`, and tests substitute a mock.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ConnStatus, IncomingReply, MediaInfo};

/// One user's live connection to the messaging backend.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Post a status broadcast to the resolved audience JIDs.
    async fn send_status_broadcast(
        &self,
        media: &MediaInfo,
        caption: Option<&str>,
        audience_jids: &[String],
    ) -> Result<()>;

    /// Send a direct message (optionally with media) to one JID.
    async fn send_direct_message(
        &self,
        jid: &str,
        text: &str,
        media: Option<&MediaInfo>,
    ) -> Result<()>;

    /// All contact JIDs of this user's account.
    async fn list_contact_jids(&self) -> Result<Vec<String>>;

    /// Inbound direct messages from `jid` observed since `since_ms`.
    /// Served from the adapter's in-memory cache; never blocks.
    fn incoming_since(&self, jid: &str, since_ms: i64) -> Vec<IncomingReply>;

    /// Current connection state.
    fn connection_status(&self) -> ConnStatus;
}

/// Lazily establishes per-user messengers for the worker runtime.
#[async_trait]
pub trait MessengerFactory: Send + Sync {
    async fn connect(&self, user_id: &str) -> Result<std::sync::Arc<dyn Messenger>>;
}
