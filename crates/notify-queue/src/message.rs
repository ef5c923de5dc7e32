//! Message types for queue operations including core domain identifiers.

use crate::error::ConfigurationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Message metadata stored alongside the encoded payload
pub type Headers = BTreeMap<String, String>;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Store-assigned surrogate key of a queue row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(i64);

impl RowId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RowId {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|e| ConfigurationError::InvalidValue {
                key: "id".to_string(),
                message: e.to_string(),
            })
    }
}

/// Business key collapsing repeated sends for the same order into one pending row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for DedupKey {
    fn from(order_id: i64) -> Self {
        Self(order_id.to_string())
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Persisted Rows
// ============================================================================

/// A queue table row with its headers decoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRow {
    pub id: RowId,
    pub dedup_key: DedupKey,
    #[serde(with = "bytes_serde")]
    pub encoded_payload: Bytes,
    pub headers: Headers,
    pub provider_name: Option<String>,
    pub template_name: Option<String>,
    pub handled: bool,
    pub push_sent: bool,
    pub email_sent: bool,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Payload bytes are rendered as base64 in JSON output
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

// ============================================================================
// Work Items
// ============================================================================

/// Implemented by payload types that belong to an order
pub trait NotificationPayload {
    fn order_id(&self) -> i64;
}

/// An outbound notification: the work item carried by an [`Envelope`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Payload model identifier, written to the `type` header
    pub model: String,
    pub order_id: i64,
    pub payload: serde_json::Value,
}

impl Notification {
    /// Build a notification from a typed payload
    pub fn from_payload<T>(model: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error>
    where
        T: NotificationPayload + Serialize,
    {
        Ok(Self {
            model: model.into(),
            order_id: payload.order_id(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::from(self.order_id)
    }

    /// Deserialize the payload into its typed form
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ============================================================================
// Envelope and Stamps
// ============================================================================

/// Requested scheduling delay before the message becomes available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayStamp(pub Duration);

/// Provenance of an envelope taken from the queue table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedStamp {
    pub id: RowId,
}

/// Identifier of the row backing the message, set on send and receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportMessageIdStamp {
    pub id: RowId,
}

/// Delivery unit exchanged between the transport and its caller
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    message: Notification,
    delay: Option<DelayStamp>,
    received: Option<ReceivedStamp>,
    transport_message_id: Option<TransportMessageIdStamp>,
}

impl Envelope {
    pub fn new(message: Notification) -> Self {
        Self {
            message,
            delay: None,
            received: None,
            transport_message_id: None,
        }
    }

    /// Schedule the message to become available after `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(DelayStamp(delay));
        self
    }

    pub fn with_received(mut self, stamp: ReceivedStamp) -> Self {
        self.received = Some(stamp);
        self
    }

    pub fn with_transport_message_id(mut self, stamp: TransportMessageIdStamp) -> Self {
        self.transport_message_id = Some(stamp);
        self
    }

    pub fn message(&self) -> &Notification {
        &self.message
    }

    pub fn into_message(self) -> Notification {
        self.message
    }

    pub fn delay(&self) -> Option<DelayStamp> {
        self.delay
    }

    pub fn received(&self) -> Option<ReceivedStamp> {
        self.received
    }

    pub fn transport_message_id(&self) -> Option<TransportMessageIdStamp> {
        self.transport_message_id
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
