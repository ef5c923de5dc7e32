//! Producer side of the transport.

use crate::codec::MessageCodec;
use crate::error::QueueError;
use crate::message::{Envelope, TransportMessageIdStamp};
use crate::store::QueueStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

#[derive(Debug)]
pub struct Sender {
    store: Arc<QueueStore>,
    codec: Arc<MessageCodec>,
}

impl Sender {
    pub fn new(store: Arc<QueueStore>, codec: Arc<MessageCodec>) -> Self {
        Self { store, codec }
    }

    /// Enqueue the envelope's notification, honouring its delay stamp.
    ///
    /// The returned envelope carries the id of the row written.
    pub async fn send(&self, envelope: Envelope) -> Result<Envelope, QueueError> {
        let encoded = self.codec.encode(envelope.message())?;
        let delay = envelope
            .delay()
            .map(|stamp| stamp.0)
            .unwrap_or(Duration::ZERO);

        let id = self
            .store
            .send(envelope.message(), encoded.body, &encoded.headers, delay)
            .await
            .map_err(QueueError::transport)?;

        debug!(id = %id, order_id = envelope.message().order_id, "Sent message");
        Ok(envelope.with_transport_message_id(TransportMessageIdStamp { id }))
    }
}
