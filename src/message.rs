//! Canonical message envelope (spec.md §2 "Message Envelope", §6 "Wire envelope").

use crate::codec;
use crate::config::{BodyEncoding, TransportOptions};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// A 128-bit opaque identifier, unique per channel for its lifetime
/// (spec.md §3 "Delivery Tag").
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(Uuid);

impl DeliveryTag {
    pub fn new() -> DeliveryTag {
        DeliveryTag(Uuid::new_v4())
    }
}

impl Default for DeliveryTag {
    fn default() -> Self {
        DeliveryTag::new()
    }
}

impl fmt::Debug for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeliveryTag({})", self.0)
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `properties.delivery_info` (spec.md §6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub exchange: String,
    pub routing_key: String,
    #[serde(default)]
    pub redelivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_tag: Option<String>,
}

/// `properties` (spec.md §3 Data Model, §6 Wire envelope).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Properties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_tag: Option<DeliveryTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_info: Option<DeliveryInfo>,
}

/// The canonical in-memory message (spec.md §3 "Message").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Wire representation of the body: raw text, or base64 when
    /// `properties.body_encoding == "base64"`.
    pub body: String,
    #[serde(rename = "content-type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "content-encoding", default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub properties: Properties,
}

impl Message {
    /// Build a wire-ready envelope from a raw body, applying the
    /// configured body encoding (spec.md §4.2 publishing algorithm, step 3).
    pub fn from_body(body: &[u8], content_type: Option<String>, options: &TransportOptions) -> Message {
        let (encoded, content_encoding) =
            codec::encode_body(body, options.body_encoding, None);
        let body_encoding = match options.body_encoding {
            BodyEncoding::Base64 => Some("base64".to_owned()),
            BodyEncoding::Raw => None,
        };
        Message {
            body: encoded,
            content_type,
            content_encoding,
            headers: Map::new(),
            properties: Properties {
                body_encoding,
                priority: 0,
                ..Properties::default()
            },
        }
    }

    /// Decode this envelope's body back into raw bytes.
    pub fn decoded_body(&self) -> Vec<u8> {
        codec::decode_body(&self.body, self.content_encoding.as_deref())
    }

    /// Serialize to the canonical JSON wire form (spec.md §6).
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::ChannelError {
            reason: format!("failed to serialize envelope: {}", e),
        })
    }

    /// Deserialize a record read back from a backend.
    pub fn from_json(text: &str) -> Result<Message> {
        serde_json::from_str(text).map_err(|e| Error::ChannelError {
            reason: format!("failed to deserialize envelope: {}", e),
        })
    }

    /// Mark this message redelivered, the way restoration does
    /// (spec.md §4.3 `restore_visible`/`restore_unacked_once`).
    pub fn mark_redelivered(&mut self) {
        if let Some(info) = self.properties.delivery_info.as_mut() {
            info.redelivered = true;
        }
        self.headers.insert("redelivered".to_owned(), Value::Bool(true));
    }
}
