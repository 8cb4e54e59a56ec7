//! Phoenix channel frames spoken by the realtime service.

use crate::api::models::MessageRow;
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PHOENIX_TOPIC: &str = "phoenix";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl Frame {
    /// Join `realtime:<channel>` listening for inserts on `messages` rows of one conversation.
    pub fn join(channel: &str, conversation_id: &str, access_token: &str, reference: &str) -> Self {
        Self {
            topic: topic(channel),
            event: "phx_join".into(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [{
                        "event": "INSERT",
                        "schema": "public",
                        "table": "messages",
                        "filter": format!("conversation_id=eq.{}", conversation_id),
                    }],
                },
                "access_token": access_token,
            }),
            reference: Some(reference.to_string()),
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: PHOENIX_TOPIC.into(),
            event: "heartbeat".into(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    pub fn leave(channel: &str, reference: &str) -> Self {
        Self {
            topic: topic(channel),
            event: "phx_leave".into(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn topic(channel: &str) -> String {
    format!("realtime:{}", channel)
}

#[derive(Debug, PartialEq)]
pub enum IncomingEvent {
    /// Reply to a frame we sent, keyed by its ref.
    Reply { reference: String, ok: bool, detail: String },
    Insert(MessageRow),
    /// Server closed or errored the channel.
    ChannelClosed(String),
    Ignored,
}

pub fn decode(text: &str) -> Result<IncomingEvent> {
    let frame: Frame = serde_json::from_str(text)?;
    match frame.event.as_str() {
        "phx_reply" => {
            let status = frame.payload.get("status").and_then(|v| v.as_str()).unwrap_or("");
            let detail = frame
                .payload
                .get("response")
                .map(|v| v.to_string())
                .unwrap_or_default();
            Ok(IncomingEvent::Reply {
                reference: frame.reference.unwrap_or_default(),
                ok: status == "ok",
                detail,
            })
        }
        "postgres_changes" => {
            let data = frame
                .payload
                .get("data")
                .ok_or_else(|| ChatError::Realtime("postgres_changes without data".into()))?;
            let kind = data.get("type").and_then(|v| v.as_str()).unwrap_or("");
            let table = data.get("table").and_then(|v| v.as_str()).unwrap_or("");
            if kind != "INSERT" || table != "messages" {
                return Ok(IncomingEvent::Ignored);
            }
            let record = data
                .get("record")
                .cloned()
                .ok_or_else(|| ChatError::Realtime("insert without record".into()))?;
            Ok(IncomingEvent::Insert(serde_json::from_value(record)?))
        }
        "phx_close" | "phx_error" => Ok(IncomingEvent::ChannelClosed(frame.event)),
        _ => Ok(IncomingEvent::Ignored),
    }
}
