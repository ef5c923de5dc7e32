//! Common test utilities for notify-queue integration tests
//!
//! This module provides:
//! - Payload types in two incompatible revisions
//! - Helpers building transports over the in-memory store
//! - Envelope builders

use notify_queue::{
    Envelope, InMemoryBackend, JsonSchema, MessageCodec, Notification, NotificationPayload,
    NotificationTransport, QueueStore, Transport, TransportConfig, TransportFactory,
    TransportOptions,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Environment variable naming a PostgreSQL database for the database tests
#[allow(dead_code)]
pub const DATABASE_URL_ENV: &str = "NOTIFY_QUEUE_TEST_DATABASE_URL";

// ============================================================================
// Payloads
// ============================================================================

/// Order SMS as written by current producers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSms {
    pub order_id: i64,
    pub body: String,
}

impl NotificationPayload for OrderSms {
    fn order_id(&self) -> i64 {
        self.order_id
    }
}

/// Newer revision; cannot read bodies written as [`OrderSms`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizedOrderSms {
    pub order_id: i64,
    pub text: String,
    pub locale: String,
}

impl NotificationPayload for LocalizedOrderSms {
    fn order_id(&self) -> i64 {
        self.order_id
    }
}

pub const SMS_MODEL: &str = "sms";
pub const LOCALIZED_SMS_MODEL: &str = "sms_localized";

// ============================================================================
// Transports
// ============================================================================

/// Codec knowing both payload revisions
pub fn codec() -> MessageCodec {
    MessageCodec::new()
        .with_schema(JsonSchema::<OrderSms>::new(SMS_MODEL))
        .with_schema(JsonSchema::<LocalizedOrderSms>::new(LOCALIZED_SMS_MODEL))
}

/// In-memory transport with non-blocking polls; `query` is appended to the DSN
pub async fn memory_transport(query: &str) -> NotificationTransport {
    let dsn = if query.is_empty() {
        "notification-sms://memory?receive_timeout=0".to_string()
    } else {
        format!("notification-sms://memory?receive_timeout=0&{}", query)
    };

    TransportFactory::create_transport(&dsn, &TransportOptions::new(), codec())
        .await
        .expect("Failed to create memory transport")
}

/// Transport over an existing backend, so several transports can share a table
#[allow(dead_code)]
pub fn shared_transport(
    backend: Arc<InMemoryBackend>,
    template_name: Option<&str>,
) -> NotificationTransport {
    let config = TransportConfig {
        template_name: template_name.map(str::to_string),
        receive_timeout: std::time::Duration::ZERO,
        ..TransportConfig::default()
    };
    let store = Arc::new(QueueStore::new(backend, config));
    NotificationTransport::new(store, Arc::new(codec()))
}

// ============================================================================
// Envelopes
// ============================================================================

pub fn sms(order_id: i64, body: &str) -> Envelope {
    let payload = OrderSms {
        order_id,
        body: body.to_string(),
    };
    let notification =
        Notification::from_payload(SMS_MODEL, &payload).expect("Failed to build notification");
    Envelope::new(notification)
}

#[allow(dead_code)]
pub fn localized_sms(order_id: i64, text: &str, locale: &str) -> Envelope {
    let payload = LocalizedOrderSms {
        order_id,
        text: text.to_string(),
        locale: locale.to_string(),
    };
    let notification = Notification::from_payload(LOCALIZED_SMS_MODEL, &payload)
        .expect("Failed to build notification");
    Envelope::new(notification)
}

/// Claim exactly one envelope or fail the test
#[allow(dead_code)]
pub async fn get_one(transport: &impl Transport) -> Envelope {
    let mut batch = transport.get().await.expect("get failed");
    assert_eq!(batch.len(), 1, "expected exactly one envelope");
    batch.remove(0)
}
