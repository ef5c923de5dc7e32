//! Transport facade and factory.
//!
//! [`Transport`] is the surface a message bus drives. [`NotificationTransport`]
//! is its single implementation; it builds the [`Receiver`] and [`Sender`] on
//! first use and delegates to them. [`TransportFactory`] turns a DSN into a
//! ready transport.

use crate::codec::MessageCodec;
use crate::config::{StoreLocator, TransportConfig, TransportOptions};
use crate::error::QueueError;
use crate::message::{Envelope, QueueRow, RowId};
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::store::{InMemoryBackend, PostgresBackend, QueueBackend, QueueStore};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::info;

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;

/// Operations a message bus performs against a queue
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueue an envelope; the result carries the stored row id
    async fn send(&self, envelope: Envelope) -> Result<Envelope, QueueError>;

    /// Claim at most one envelope
    async fn get(&self) -> Result<Vec<Envelope>, QueueError>;

    async fn ack(&self, envelope: &Envelope) -> Result<(), QueueError>;

    async fn reject(&self, envelope: &Envelope) -> Result<(), QueueError>;

    /// Number of rows currently eligible for delivery
    async fn message_count(&self) -> Result<u64, QueueError>;

    async fn all(&self, limit: Option<u32>) -> Result<Vec<QueueRow>, QueueError>;

    async fn find(&self, id: RowId) -> Result<Option<QueueRow>, QueueError>;

    /// Create the backing table if needed
    async fn setup(&self) -> Result<(), QueueError>;
}

/// Database-backed notification transport
pub struct NotificationTransport {
    store: Arc<QueueStore>,
    codec: Arc<MessageCodec>,
    receiver: OnceLock<Receiver>,
    sender: OnceLock<Sender>,
}

impl NotificationTransport {
    pub fn new(store: Arc<QueueStore>, codec: Arc<MessageCodec>) -> Self {
        Self {
            store,
            codec,
            receiver: OnceLock::new(),
            sender: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        self.store.config()
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Forget that the queue was observed empty
    pub fn reset(&self) {
        self.store.reset();
    }

    fn receiver(&self) -> &Receiver {
        self.receiver
            .get_or_init(|| Receiver::new(Arc::clone(&self.store), Arc::clone(&self.codec)))
    }

    fn sender(&self) -> &Sender {
        self.sender
            .get_or_init(|| Sender::new(Arc::clone(&self.store), Arc::clone(&self.codec)))
    }
}

impl std::fmt::Debug for NotificationTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationTransport")
            .field("config", self.store.config())
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for NotificationTransport {
    async fn send(&self, envelope: Envelope) -> Result<Envelope, QueueError> {
        self.sender().send(envelope).await
    }

    async fn get(&self) -> Result<Vec<Envelope>, QueueError> {
        self.receiver().get().await
    }

    async fn ack(&self, envelope: &Envelope) -> Result<(), QueueError> {
        self.receiver().ack(envelope).await
    }

    async fn reject(&self, envelope: &Envelope) -> Result<(), QueueError> {
        self.receiver().reject(envelope).await
    }

    async fn message_count(&self) -> Result<u64, QueueError> {
        self.receiver().message_count().await
    }

    async fn all(&self, limit: Option<u32>) -> Result<Vec<QueueRow>, QueueError> {
        self.receiver().all(limit).await
    }

    async fn find(&self, id: RowId) -> Result<Option<QueueRow>, QueueError> {
        self.receiver().find(id).await
    }

    async fn setup(&self) -> Result<(), QueueError> {
        self.store.setup().await.map_err(QueueError::transport)
    }
}

/// Factory for creating transports from DSNs
pub struct TransportFactory;

impl TransportFactory {
    /// Whether `dsn` selects the notification transport
    pub fn supports(dsn: &str) -> bool {
        TransportConfig::supports(dsn)
    }

    /// Resolve `dsn` and `options`, connect the backing store and build a transport
    pub async fn create_transport(
        dsn: &str,
        options: &TransportOptions,
        codec: MessageCodec,
    ) -> Result<NotificationTransport, QueueError> {
        let config = TransportConfig::from_dsn(dsn, options)?;
        Self::from_config(config, codec).await
    }

    /// Build a transport from an already resolved configuration
    pub async fn from_config(
        config: TransportConfig,
        codec: MessageCodec,
    ) -> Result<NotificationTransport, QueueError> {
        config.validate()?;
        codec.ensure_models(&config.payload_models)?;

        let backend: Arc<dyn QueueBackend> = match &config.store {
            StoreLocator::Memory => Arc::new(InMemoryBackend::new(config.table_name.clone())),
            StoreLocator::Postgres { url } => Arc::new(
                PostgresBackend::connect(url, &config)
                    .await
                    .map_err(QueueError::transport)?,
            ),
        };

        info!(
            store = %config.store.redacted(),
            table = %config.table_name,
            auto_setup = config.auto_setup,
            "Created notification transport"
        );

        let store = Arc::new(QueueStore::new(backend, config));
        Ok(NotificationTransport::new(store, Arc::new(codec)))
    }

    /// In-memory transport that returns immediately from empty polls
    pub fn create_test_transport(codec: MessageCodec) -> NotificationTransport {
        let config = TransportConfig {
            receive_timeout: Duration::ZERO,
            ..TransportConfig::default()
        };
        let backend = Arc::new(InMemoryBackend::new(config.table_name.clone()));
        let store = Arc::new(QueueStore::new(backend, config));
        NotificationTransport::new(store, Arc::new(codec))
    }
}
