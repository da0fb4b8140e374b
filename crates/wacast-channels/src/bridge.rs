//! WhatsApp sidecar bridge channel.
//!
//! The WhatsApp Web protocol client runs as a sidecar process sharing
//! the data directory; this adapter drives it over HTTP. Per user: a
//! connect call, send endpoints, a contacts listing, and a polled event
//! feed that carries connection status, the pairing QR, and inbound
//! direct messages. Inbound messages are cached in memory (bounded per
//! sender) so the worker's wait-reply checks never block on the network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use wacast_core::config::BridgeConfig;
use wacast_core::error::{Result, WacastError};
use wacast_core::time::now_ms;
use wacast_core::traits::{Messenger, MessengerFactory};
use wacast_core::types::{ConnStatus, IncomingReply, MediaInfo, MediaKind};
use wacast_store::DurableStore;

/// Cached inbound replies kept per sender JID.
const REPLY_CACHE_CAP: usize = 200;

/// One event-feed response from the sidecar.
#[derive(Debug, Deserialize)]
struct BridgeEvents {
    status: String,
    #[serde(default)]
    qr: Option<String>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    messages: Vec<IncomingReply>,
}

#[derive(Debug, Deserialize)]
struct ContactsResponse {
    jids: Vec<String>,
}

fn parse_conn_status(raw: &str) -> ConnStatus {
    match raw {
        "connecting" => ConnStatus::Connecting,
        "connected" => ConnStatus::Connected,
        "logged_out" => ConnStatus::LoggedOut,
        _ => ConnStatus::Offline,
    }
}

fn media_kind_str(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "photo",
        MediaKind::Video => "video",
    }
}

/// One user's connection to the WhatsApp sidecar.
pub struct WhatsAppBridge {
    client: reqwest::Client,
    base_url: String,
    token: String,
    user_id: String,
    store: DurableStore,
    status: Mutex<ConnStatus>,
    replies: Mutex<HashMap<String, VecDeque<IncomingReply>>>,
    /// Last status/qr pair written to the store, to skip no-op writes.
    last_written: Mutex<Option<(ConnStatus, Option<String>)>>,
}

impl WhatsAppBridge {
    fn new(config: &BridgeConfig, store: DurableStore, user_id: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            user_id: user_id.to_string(),
            store,
            status: Mutex::new(ConnStatus::Connecting),
            replies: Mutex::new(HashMap::new()),
            last_written: Mutex::new(None),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/users/{}/{}", self.base_url, self.user_id, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            request
        } else {
            request.header("Authorization", format!("Bearer {}", self.token))
        }
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let response = self
            .authorize(self.client.post(self.endpoint(path)))
            .json(&body)
            .send()
            .await
            .map_err(|e| WacastError::Channel(format!("bridge request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(WacastError::Channel(format!("bridge error {status}: {text}")));
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .authorize(self.client.get(self.endpoint(path)))
            .send()
            .await
            .map_err(|e| WacastError::Channel(format!("bridge request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(WacastError::Channel(format!("bridge error {status}: {text}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| WacastError::Channel(format!("invalid bridge response: {e}")))
    }

    fn media_body(&self, media: &MediaInfo) -> serde_json::Value {
        serde_json::json!({
            "path": self.store.resolve_relative(&media.relative_path),
            "mime": media.mime,
            "kind": media_kind_str(media.kind),
        })
    }

    fn record_replies(&self, incoming: Vec<IncomingReply>) {
        if incoming.is_empty() {
            return;
        }
        let Ok(mut cache) = self.replies.lock() else { return };
        for reply in incoming {
            let queue = cache.entry(reply.jid.clone()).or_default();
            queue.push_back(reply);
            while queue.len() > REPLY_CACHE_CAP {
                queue.pop_front();
            }
        }
    }

    /// One event-feed poll: refresh status, cache inbound messages, and
    /// mirror the connection record into the store when it changed.
    async fn poll_events(&self) -> Result<()> {
        let events: BridgeEvents = self.get_json("events").await?;
        let status = parse_conn_status(&events.status);

        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
        self.record_replies(events.messages);

        let already_written = self
            .last_written
            .lock()
            .map(|w| w.as_ref() == Some(&(status, events.qr.clone())))
            .unwrap_or(false);
        if already_written {
            return Ok(());
        }

        let user_id = self.user_id.clone();
        let qr = events.qr.clone();
        let number = events.number.clone();
        let note = events.note.clone();
        self.store
            .update(move |doc| {
                if let Some(wa) = doc.wa_by_user.get_mut(&user_id) {
                    wa.status = status;
                    wa.qr = qr;
                    wa.number = number;
                    wa.note = note;
                    wa.last_update_ms = now_ms();
                }
                Ok(())
            })
            .await?;
        if let Ok(mut written) = self.last_written.lock() {
            *written = Some((status, events.qr));
        }
        Ok(())
    }
}

#[async_trait]
impl Messenger for WhatsAppBridge {
    async fn send_status_broadcast(
        &self,
        media: &MediaInfo,
        caption: Option<&str>,
        audience_jids: &[String],
    ) -> Result<()> {
        self.post_json(
            "status",
            serde_json::json!({
                "media": self.media_body(media),
                "caption": caption,
                "jids": audience_jids,
            }),
        )
        .await?;
        tracing::debug!(user = %self.user_id, "status broadcast handed to bridge");
        Ok(())
    }

    async fn send_direct_message(
        &self,
        jid: &str,
        text: &str,
        media: Option<&MediaInfo>,
    ) -> Result<()> {
        self.post_json(
            "messages",
            serde_json::json!({
                "jid": jid,
                "text": text,
                "media": media.map(|m| self.media_body(m)),
            }),
        )
        .await?;
        tracing::debug!(user = %self.user_id, %jid, "message handed to bridge");
        Ok(())
    }

    async fn list_contact_jids(&self) -> Result<Vec<String>> {
        let contacts: ContactsResponse = self.get_json("contacts").await?;
        Ok(contacts.jids)
    }

    fn incoming_since(&self, jid: &str, since_ms: i64) -> Vec<IncomingReply> {
        self.replies
            .lock()
            .map(|cache| {
                cache
                    .get(jid)
                    .map(|queue| {
                        queue
                            .iter()
                            .filter(|r| r.at_ms >= since_ms)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn connection_status(&self) -> ConnStatus {
        self.status.lock().map(|s| *s).unwrap_or(ConnStatus::Offline)
    }
}

/// Establishes per-user bridge connections for the worker runtime.
pub struct BridgeFactory {
    config: BridgeConfig,
    store: DurableStore,
}

impl BridgeFactory {
    pub fn new(config: BridgeConfig, store: DurableStore) -> Self {
        Self { config, store }
    }
}

#[async_trait]
impl MessengerFactory for BridgeFactory {
    async fn connect(&self, user_id: &str) -> Result<Arc<dyn Messenger>> {
        let bridge = Arc::new(WhatsAppBridge::new(&self.config, self.store.clone(), user_id));
        bridge.post_json("connect", serde_json::json!({})).await?;
        tracing::info!(user = %user_id, "bridge session requested");

        // The poll loop lives as long as someone still holds the bridge.
        let weak: Weak<WhatsAppBridge> = Arc::downgrade(&bridge);
        let interval_ms = self.config.poll_interval_ms.max(200);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(bridge) = weak.upgrade() else { break };
                if let Err(e) = bridge.poll_events().await {
                    tracing::debug!(user = %bridge.user_id, "bridge poll failed: {e}");
                }
            }
        });

        Ok(bridge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wacast_core::config::LockConfig;

    fn bridge() -> WhatsAppBridge {
        let dir = std::env::temp_dir().join(format!("wacast-bridge-{}", std::process::id()));
        let store = DurableStore::with_paths(dir, LockConfig::default(), "admin", "admin123");
        WhatsAppBridge::new(&BridgeConfig::default(), store, "user_admin")
    }

    fn reply(jid: &str, text: &str, at_ms: i64) -> IncomingReply {
        IncomingReply { jid: jid.into(), text: text.into(), at_ms }
    }

    #[test]
    fn test_reply_cache_caps_per_jid() {
        let b = bridge();
        let batch: Vec<IncomingReply> = (0..250)
            .map(|i| reply("628110@s.whatsapp.net", &format!("m{i}"), i))
            .collect();
        b.record_replies(batch);

        let all = b.incoming_since("628110@s.whatsapp.net", 0);
        assert_eq!(all.len(), REPLY_CACHE_CAP);
        // Oldest entries evicted first.
        assert_eq!(all.first().unwrap().text, "m50");
        assert_eq!(all.last().unwrap().text, "m249");
    }

    #[test]
    fn test_incoming_since_filters_by_jid_and_time() {
        let b = bridge();
        b.record_replies(vec![
            reply("a@s.whatsapp.net", "early", 100),
            reply("a@s.whatsapp.net", "late", 300),
            reply("b@s.whatsapp.net", "other", 300),
        ]);

        let since = b.incoming_since("a@s.whatsapp.net", 200);
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].text, "late");
        assert!(b.incoming_since("c@s.whatsapp.net", 0).is_empty());
    }

    #[test]
    fn test_status_string_mapping() {
        assert_eq!(parse_conn_status("connected"), ConnStatus::Connected);
        assert_eq!(parse_conn_status("connecting"), ConnStatus::Connecting);
        assert_eq!(parse_conn_status("logged_out"), ConnStatus::LoggedOut);
        assert_eq!(parse_conn_status("offline"), ConnStatus::Offline);
        assert_eq!(parse_conn_status("???"), ConnStatus::Offline);
    }

    #[test]
    fn test_event_feed_parses() {
        let events: BridgeEvents = serde_json::from_str(
            r#"{
                "status": "connected",
                "number": "628110000001",
                "messages": [
                    {"jid": "628120@s.whatsapp.net", "text": "hi", "at_ms": 1000}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(parse_conn_status(&events.status), ConnStatus::Connected);
        assert_eq!(events.qr, None);
        assert_eq!(events.messages.len(), 1);
        assert_eq!(events.messages[0].text, "hi");
    }

    #[test]
    fn test_endpoint_layout() {
        let b = bridge();
        assert_eq!(
            b.endpoint("events"),
            "http://127.0.0.1:3500/users/user_admin/events"
        );
    }
}
