//! Inbound transport messages.
//!
//! The transport hands the client raw JSON text. A message names the channel
//! (or channels) it was published on and carries a JSON payload that usually,
//! but not always, names its owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// Payload fields that identify the owning entity, in lookup order.
pub const OWNER_FIELDS: [&str; 2] = ["ownerId", "userId"];

/// Maximum accepted size of a raw inbound message.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024; // 1 MiB

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Channels this message was published on.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Single-channel form used by some publishers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Backend event names (e.g. `documents.*.update`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,

    /// Publish time, when the backend supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Document payload.
    #[serde(default)]
    pub payload: Value,
}

impl InboundEvent {
    /// Builds a message for a single channel.
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            channels: vec![channel.into()],
            channel: None,
            events: Vec::new(),
            timestamp: Some(Utc::now()),
            payload,
        }
    }

    /// Parses a raw transport message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::DecodeFailed`] when the text is oversized,
    /// not JSON, or names no channel.
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        if raw.len() > MAX_MESSAGE_BYTES {
            return Err(TransportError::DecodeFailed {
                message: format!("message of {} bytes exceeds limit", raw.len()),
            });
        }
        let event: Self = serde_json::from_str(raw).map_err(|e| TransportError::DecodeFailed {
            message: e.to_string(),
        })?;
        if event.channel_ids().next().is_none() {
            return Err(TransportError::DecodeFailed {
                message: "message names no channel".to_string(),
            });
        }
        Ok(event)
    }

    /// Serializes the message to the raw wire form.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::DecodeFailed`] if the payload cannot be encoded.
    pub fn to_raw(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::DecodeFailed {
            message: e.to_string(),
        })
    }

    /// All channel identifiers carried by this message.
    pub fn channel_ids(&self) -> impl Iterator<Item = &str> {
        self.channels
            .iter()
            .map(String::as_str)
            .chain(self.channel.as_deref())
            .filter(|c| !c.is_empty())
    }

    /// Owner named by the payload, if any.
    ///
    /// Only string values count; a payload without an owner field is treated
    /// as unowned and delivered unfiltered.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        OWNER_FIELDS
            .iter()
            .find_map(|field| self.payload.get(*field).and_then(Value::as_str))
    }
}
