//! Consumer side of the transport.
//!
//! Lock conflicts during a claim are absorbed: the poll returns an empty batch
//! and the caller simply polls again. Only after [`MAX_RETRIES`] consecutive
//! conflicts does the failure surface.

use crate::codec::MessageCodec;
use crate::error::{DecodeError, QueueError, StoreError};
use crate::message::{Envelope, QueueRow, ReceivedStamp, RowId, TransportMessageIdStamp};
use crate::store::QueueStore;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

/// Consecutive retryable failures tolerated before `get` reports an error
pub const MAX_RETRIES: u32 = 3;

pub struct Receiver {
    store: Arc<QueueStore>,
    codec: Arc<MessageCodec>,
    retrying_safety_counter: AtomicU32,
}

impl Receiver {
    pub fn new(store: Arc<QueueStore>, codec: Arc<MessageCodec>) -> Self {
        Self {
            store,
            codec,
            retrying_safety_counter: AtomicU32::new(0),
        }
    }

    /// Claim at most one message.
    ///
    /// An empty batch means either an empty queue or a conflict that will be
    /// retried on the next poll.
    pub async fn get(&self) -> Result<Vec<Envelope>, QueueError> {
        let row = match self.store.get().await {
            Ok(row) => {
                self.retrying_safety_counter.store(0, Ordering::SeqCst);
                row
            }
            // The claim went through; only the row's own bytes are bad.
            Err(StoreError::UnreadableHeaders { id, source }) => {
                self.retrying_safety_counter.store(0, Ordering::SeqCst);
                let err = DecodeError::Headers { source };
                self.discard(id, &err).await;
                return Err(QueueError::Decode(err));
            }
            Err(e) if e.is_retryable() => {
                let attempt = self.retrying_safety_counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt >= MAX_RETRIES {
                    self.retrying_safety_counter.store(0, Ordering::SeqCst);
                    error!(attempt, error = %e, "Giving up after repeated store conflicts");
                    return Err(QueueError::transport(e));
                }

                warn!(attempt, error = %e, "Store conflict while receiving; retrying on next poll");
                return Ok(Vec::new());
            }
            Err(e) => return Err(QueueError::transport(e)),
        };

        match row {
            Some(row) => Ok(vec![self.envelope_for(row).await?]),
            None => Ok(Vec::new()),
        }
    }

    pub async fn ack(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let id = received_id(envelope)?;
        self.store.ack(id).await.map_err(QueueError::transport)?;
        Ok(())
    }

    /// Reject is terminal: the row is marked handled, not requeued
    pub async fn reject(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let id = received_id(envelope)?;
        self.store.reject(id).await.map_err(QueueError::transport)?;
        Ok(())
    }

    pub async fn message_count(&self) -> Result<u64, QueueError> {
        self.store
            .message_count()
            .await
            .map_err(QueueError::transport)
    }

    /// Available rows, earliest first, without claiming them
    pub async fn all(&self, limit: Option<u32>) -> Result<Vec<QueueRow>, QueueError> {
        self.store
            .find_all(limit)
            .await
            .map_err(QueueError::transport)
    }

    pub async fn find(&self, id: RowId) -> Result<Option<QueueRow>, QueueError> {
        self.store.find(id).await.map_err(QueueError::transport)
    }

    /// Decode a claimed row; a row no configured model can read is rejected
    async fn envelope_for(&self, row: QueueRow) -> Result<Envelope, QueueError> {
        let models = &self.store.config().payload_models;

        match self.codec.decode_row(&row, models) {
            Ok(notification) => {
                debug!(id = %row.id, model = %notification.model, "Received message");
                Ok(Envelope::new(notification)
                    .with_received(ReceivedStamp { id: row.id })
                    .with_transport_message_id(TransportMessageIdStamp { id: row.id }))
            }
            Err(e) => {
                self.discard(row.id, &e).await;
                Err(QueueError::Decode(e))
            }
        }
    }

    /// Reject a claimed row that cannot be decoded so it is never redelivered
    async fn discard(&self, id: RowId, reason: &DecodeError) {
        warn!(id = %id, error = %reason, "Rejecting message that cannot be decoded");
        if let Err(reject_err) = self.store.reject(id).await {
            error!(id = %id, error = %reject_err, "Failed to reject undecodable message");
        }
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field(
                "retrying_safety_counter",
                &self.retrying_safety_counter.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

fn received_id(envelope: &Envelope) -> Result<RowId, QueueError> {
    envelope
        .received()
        .map(|stamp| stamp.id)
        .ok_or_else(|| QueueError::Logic {
            message: "No ReceivedStamp found on the Envelope.".to_string(),
        })
}
