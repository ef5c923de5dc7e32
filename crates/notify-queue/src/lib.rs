//! # Notify Queue
//!
//! Database-backed notification queue transport. Notifications for an order are
//! written to a single table row that a pool of consumers claims, processes and
//! acknowledges. Sending again for an order whose notification is still pending
//! refreshes that row instead of adding another one.
//!
//! This library provides:
//! - DSN-driven configuration (`notification-sms://...`)
//! - Exclusive claims with time-based redelivery of unacknowledged rows
//! - Scheduled delivery through delay stamps
//! - Payload decoding with an ordered fallback over registered models
//! - Automatic table creation on first use
//! - PostgreSQL and in-memory backends
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Identifiers, stored rows, notifications and envelopes
//! - [`config`] - DSN resolution and transport configuration
//! - [`codec`] - Payload encoding and schema registry
//! - [`store`] - Queue table operations and backends
//! - [`receiver`] / [`sender`] - Consumer and producer halves
//! - [`transport`] - Transport trait, implementation and factory

pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod receiver;
pub mod sender;
pub mod store;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use codec::{EncodedMessage, JsonSchema, MessageCodec, PayloadSchema};
pub use config::{StoreLocator, TransportConfig, TransportOptions, DSN_SCHEME};
pub use error::{ConfigurationError, DecodeError, QueueError, SerializationError, StoreError};
pub use message::{
    DedupKey, DelayStamp, Envelope, Headers, Notification, NotificationPayload, QueueRow,
    ReceivedStamp, RowId, TransportMessageIdStamp,
};
pub use receiver::{Receiver, MAX_RETRIES};
pub use sender::Sender;
pub use store::{InMemoryBackend, PostgresBackend, QueueBackend, QueueStore, SchemaManager};
pub use transport::{NotificationTransport, Transport, TransportFactory};
