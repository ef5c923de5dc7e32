//! Payload encoding and schema-fallback decoding.
//!
//! Rows carry an opaque body plus headers. The `type` header names the payload
//! model that can read the body. When the transport is configured with a list of
//! payload models, decoding ignores the stored `type` and tries each model in
//! order instead; the first one that accepts the body wins.

use crate::error::{ConfigurationError, DecodeError, SerializationError};
use crate::message::{Headers, Notification, NotificationPayload, QueueRow};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

pub const TYPE_HEADER: &str = "type";
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Body and headers as stored in the queue table
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMessage {
    pub body: Bytes,
    pub headers: Headers,
}

/// A named payload shape the codec can decode
pub trait PayloadSchema: Send + Sync {
    /// Identifier written to and matched against the `type` header
    fn model(&self) -> &str;

    fn decode(&self, body: &[u8]) -> Result<Notification, DecodeError>;
}

/// Schema backed by a serde type
pub struct JsonSchema<T> {
    model: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> JsonSchema<T> {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            _payload: PhantomData,
        }
    }
}

impl<T> PayloadSchema for JsonSchema<T>
where
    T: DeserializeOwned + Serialize + NotificationPayload,
{
    fn model(&self) -> &str {
        &self.model
    }

    fn decode(&self, body: &[u8]) -> Result<Notification, DecodeError> {
        let payload: T = serde_json::from_slice(body).map_err(|source| DecodeError::Payload {
            model: self.model.clone(),
            source,
        })?;

        Notification::from_payload(self.model.clone(), &payload).map_err(|source| {
            DecodeError::Payload {
                model: self.model.clone(),
                source,
            }
        })
    }
}

/// Registry of payload schemas plus the encode/decode entry points
#[derive(Clone, Default)]
pub struct MessageCodec {
    schemas: HashMap<String, Arc<dyn PayloadSchema>>,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, replacing any schema with the same model name
    pub fn with_schema(mut self, schema: impl PayloadSchema + 'static) -> Self {
        self.register(Arc::new(schema));
        self
    }

    pub fn register(&mut self, schema: Arc<dyn PayloadSchema>) {
        self.schemas.insert(schema.model().to_string(), schema);
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.schemas.contains_key(model)
    }

    /// Fail if any configured model has no registered schema
    pub fn ensure_models(&self, models: &[String]) -> Result<(), ConfigurationError> {
        match models.iter().find(|m| !self.has_model(m)) {
            Some(model) => Err(ConfigurationError::UnregisteredModel {
                model: model.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn encode(&self, notification: &Notification) -> Result<EncodedMessage, SerializationError> {
        let body = serde_json::to_vec(&notification.payload)?;

        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER.to_string(), notification.model.clone());
        headers.insert(
            CONTENT_TYPE_HEADER.to_string(),
            JSON_CONTENT_TYPE.to_string(),
        );

        Ok(EncodedMessage {
            body: Bytes::from(body),
            headers,
        })
    }

    /// Decode using the schema named by the `type` header
    pub fn decode(&self, encoded: &EncodedMessage) -> Result<Notification, DecodeError> {
        let model = encoded
            .headers
            .get(TYPE_HEADER)
            .ok_or(DecodeError::MissingType)?;

        let schema = self
            .schemas
            .get(model)
            .ok_or_else(|| DecodeError::UnknownModel {
                model: model.clone(),
            })?;

        schema.decode(&encoded.body)
    }

    /// Decode a stored row, trying `models` in order.
    ///
    /// Returns the error of the last model tried when none of them match. An
    /// empty model list falls back to the row's own `type` header.
    pub fn decode_row(&self, row: &QueueRow, models: &[String]) -> Result<Notification, DecodeError> {
        let mut encoded = EncodedMessage {
            body: row.encoded_payload.clone(),
            headers: row.headers.clone(),
        };

        if models.is_empty() {
            return self.decode(&encoded);
        }

        let mut last_error = DecodeError::MissingType;
        for model in models {
            encoded
                .headers
                .insert(TYPE_HEADER.to_string(), model.clone());

            match self.decode(&encoded) {
                Ok(notification) => return Ok(notification),
                Err(e) => {
                    debug!(id = %row.id, model = %model, error = %e, "Payload model did not match");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut models: Vec<&String> = self.schemas.keys().collect();
        models.sort();
        f.debug_struct("MessageCodec").field("models", &models).finish()
    }
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
