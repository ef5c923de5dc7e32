//! Queue store: the table-level operations behind the transport.
//!
//! [`QueueStore`] owns the queue policy. It decides between insert and update on
//! send, computes the eligibility window, recovers once from a missing table,
//! throttles empty polls and decodes stored headers. The row primitives live
//! behind [`QueueBackend`], implemented by [`PostgresBackend`] and
//! [`InMemoryBackend`].
//!
//! A row is eligible for delivery when it is not handled, its `available_at` has
//! passed, and it was either never delivered or delivered longer ago than the
//! redeliver timeout. Only [`QueueStore::get`] takes an exclusive lock; the send
//! upsert reads then writes without one, so two concurrent sends for the same
//! order can both insert.

use crate::config::TransportConfig;
use crate::error::StoreError;
use crate::message::{DedupKey, Headers, Notification, QueueRow, RowId};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub mod memory;
pub mod postgres;
pub mod schema;

pub use memory::{Fault, InMemoryBackend};
pub use postgres::PostgresBackend;
pub use schema::SchemaManager;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

// ============================================================================
// Backend Row Types
// ============================================================================

/// A row as persisted, with headers still in their serialized form
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredRow {
    pub id: i64,
    pub dedup_key: String,
    pub encoded_payload: Vec<u8>,
    pub headers: String,
    pub provider_name: Option<String>,
    pub template_name: Option<String>,
    pub handled: bool,
    pub push_sent: bool,
    pub email_sent: bool,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Column values written by send, for both insert and in-place update
#[derive(Debug, Clone, PartialEq)]
pub struct NewRow {
    pub dedup_key: DedupKey,
    pub encoded_payload: Bytes,
    pub headers: String,
    pub provider_name: Option<String>,
    pub template_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}

/// Business key used to find the pending row a send collapses onto
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingKey {
    pub dedup_key: DedupKey,
    pub template_name: Option<String>,
}

/// Eligibility window evaluated at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub now: DateTime<Utc>,
    /// Rows delivered before this instant may be redelivered
    pub redeliver_before: DateTime<Utc>,
    pub provider_name: Option<String>,
    pub template_name: Option<String>,
}

impl Availability {
    /// Whether a row may be counted or listed as available
    pub fn matches(&self, row: &StoredRow) -> bool {
        !row.handled
            && row.available_at <= self.now
            && row
                .delivered_at
                .map_or(true, |delivered| delivered < self.redeliver_before)
            && row.provider_name == self.provider_name
            && row.template_name == self.template_name
    }

    /// Whether a row may be claimed by a consumer
    pub fn claimable(&self, row: &StoredRow) -> bool {
        self.matches(row) && !row.push_sent && !row.email_sent
    }
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Row primitives implemented by each storage engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Create the queue table if it does not exist
    async fn create_table(&self) -> Result<(), StoreError>;

    /// Find the non-handled row for a business key
    async fn find_pending(&self, key: &PendingKey) -> Result<Option<RowId>, StoreError>;

    async fn insert(&self, row: &NewRow) -> Result<RowId, StoreError>;

    async fn update(&self, id: RowId, row: &NewRow) -> Result<(), StoreError>;

    /// Lock the first claimable row, stamp `delivered_at = filter.now` and
    /// return it, all in one transaction
    async fn claim_next(&self, filter: &Availability) -> Result<Option<StoredRow>, StoreError>;

    /// Set `handled`; returns false when no pending row had that id
    async fn mark_handled(&self, id: RowId) -> Result<bool, StoreError>;

    async fn count_available(&self, filter: &Availability) -> Result<u64, StoreError>;

    async fn list_available(
        &self,
        filter: &Availability,
        limit: Option<u32>,
    ) -> Result<Vec<StoredRow>, StoreError>;

    async fn find(&self, id: RowId) -> Result<Option<StoredRow>, StoreError>;

    /// Block until new work may be available or `timeout` elapses.
    ///
    /// Returns true when woken early by a send.
    async fn wait_for_work(&self, timeout: Duration) -> Result<bool, StoreError> {
        tokio::time::sleep(timeout).await;
        Ok(false)
    }
}

// ============================================================================
// QueueStore
// ============================================================================

/// Table-level queue operations with auto-setup recovery
pub struct QueueStore {
    backend: Arc<dyn QueueBackend>,
    config: TransportConfig,
    queue_emptied_at: Mutex<Option<DateTime<Utc>>>,
}

impl QueueStore {
    pub fn new(backend: Arc<dyn QueueBackend>, config: TransportConfig) -> Self {
        Self {
            backend,
            config,
            queue_emptied_at: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// When the last poll found the queue empty, if it did
    pub fn queue_emptied_at(&self) -> Option<DateTime<Utc>> {
        *self
            .queue_emptied_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget the "queue observed empty" marker
    pub fn reset(&self) {
        self.set_queue_emptied_at(None);
    }

    /// Enqueue a notification, collapsing onto the pending row for the same order.
    ///
    /// Returns the id of the inserted or refreshed row.
    #[instrument(
        skip(self, notification, encoded_payload, headers),
        fields(order_id = notification.order_id, table = %self.config.table_name)
    )]
    pub async fn send(
        &self,
        notification: &Notification,
        encoded_payload: Bytes,
        headers: &Headers,
        delay: Duration,
    ) -> Result<RowId, StoreError> {
        let now = Utc::now();
        let available_at = now
            .checked_add_signed(to_time_delta(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let row = NewRow {
            dedup_key: notification.dedup_key(),
            encoded_payload,
            headers: serde_json::to_string(headers)?,
            provider_name: self.config.provider_name.clone(),
            template_name: self.config.template_name.clone(),
            created_at: now,
            available_at,
        };
        let key = PendingKey {
            dedup_key: row.dedup_key.clone(),
            template_name: row.template_name.clone(),
        };

        let backend = &self.backend;
        let (row, key) = (&row, &key);
        self.with_auto_setup(|| async move {
            match backend.find_pending(key).await? {
                Some(id) => {
                    backend.update(id, row).await?;
                    debug!(id = %id, "Refreshed pending message in place");
                    Ok(id)
                }
                None => {
                    let id = backend.insert(row).await?;
                    debug!(id = %id, "Inserted new message");
                    Ok(id)
                }
            }
        })
        .await
    }

    /// Claim the next eligible row, or idle-wait and return `None` when there is none
    #[instrument(skip(self), fields(table = %self.config.table_name))]
    pub async fn get(&self) -> Result<Option<QueueRow>, StoreError> {
        let store = self;
        let claimed = self
            .with_auto_setup(|| async move { store.backend.claim_next(&store.availability()).await })
            .await?;

        let Some(row) = claimed else {
            self.set_queue_emptied_at(Some(Utc::now()));
            info!("Current consuming cycle has reached the end; waiting for the next message");

            if !self.config.receive_timeout.is_zero() {
                let woken = self
                    .backend
                    .wait_for_work(self.config.receive_timeout)
                    .await?;
                debug!(woken, "Idle wait finished");
            }
            return Ok(None);
        };

        self.set_queue_emptied_at(None);
        let row = decode_row(row)?;
        debug!(id = %row.id, order = %row.dedup_key, "Claimed message");
        Ok(Some(row))
    }

    /// Mark a row handled. Returns false if nothing was pending under that id.
    #[instrument(skip(self), fields(table = %self.config.table_name))]
    pub async fn ack(&self, id: RowId) -> Result<bool, StoreError> {
        self.mark_handled(id).await
    }

    /// Mark a row handled; rejection is terminal, the row is not requeued
    #[instrument(skip(self), fields(table = %self.config.table_name))]
    pub async fn reject(&self, id: RowId) -> Result<bool, StoreError> {
        self.mark_handled(id).await
    }

    pub async fn message_count(&self) -> Result<u64, StoreError> {
        let store = self;
        self.with_auto_setup(|| async move {
            store
                .backend
                .count_available(&store.availability())
                .await
        })
        .await
    }

    /// Available rows, earliest `available_at` first
    pub async fn find_all(&self, limit: Option<u32>) -> Result<Vec<QueueRow>, StoreError> {
        let store = self;
        let rows = self
            .with_auto_setup(|| async move {
                store
                    .backend
                    .list_available(&store.availability(), limit)
                    .await
            })
            .await?;

        rows.into_iter().map(decode_row).collect()
    }

    /// Look a row up by id whatever its state
    pub async fn find(&self, id: RowId) -> Result<Option<QueueRow>, StoreError> {
        let backend = &self.backend;
        let row = self
            .with_auto_setup(|| async move { backend.find(id).await })
            .await?;

        row.map(decode_row).transpose()
    }

    /// Create the queue table; safe to call repeatedly
    pub async fn setup(&self) -> Result<(), StoreError> {
        self.backend.create_table().await?;
        info!(table = %self.config.table_name, "Queue table is set up");
        Ok(())
    }

    async fn mark_handled(&self, id: RowId) -> Result<bool, StoreError> {
        let backend = &self.backend;
        let affected = self
            .with_auto_setup(|| async move { backend.mark_handled(id).await })
            .await?;

        if !affected {
            debug!(id = %id, "No pending row to mark handled");
        }
        Ok(affected)
    }

    /// Run `operation`; if the table is missing and auto-setup is on, create
    /// it and run the operation exactly once more
    async fn with_auto_setup<T, F, Fut>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match operation().await {
            Err(e) if e.is_table_missing() && self.config.auto_setup => {
                warn!(table = %self.config.table_name, "Queue table missing; running setup");
                self.setup().await?;
                operation().await
            }
            result => result,
        }
    }

    fn availability(&self) -> Availability {
        let now = Utc::now();
        Availability {
            now,
            redeliver_before: now
                .checked_sub_signed(to_time_delta(self.config.redeliver_timeout))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            provider_name: self.config.provider_name.clone(),
            template_name: self.config.template_name.clone(),
        }
    }

    fn set_queue_emptied_at(&self, value: Option<DateTime<Utc>>) {
        *self
            .queue_emptied_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn to_time_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Turn a stored row into its public form, parsing the header map
fn decode_row(row: StoredRow) -> Result<QueueRow, StoreError> {
    let headers: Headers = if row.headers.is_empty() {
        Headers::new()
    } else {
        serde_json::from_str(&row.headers).map_err(|source| StoreError::UnreadableHeaders {
            id: RowId::new(row.id),
            source,
        })?
    };

    Ok(QueueRow {
        id: RowId::new(row.id),
        dedup_key: DedupKey::new(row.dedup_key),
        encoded_payload: Bytes::from(row.encoded_payload),
        headers,
        provider_name: row.provider_name,
        template_name: row.template_name,
        handled: row.handled,
        push_sent: row.push_sent,
        email_sent: row.email_sent,
        created_at: row.created_at,
        available_at: row.available_at,
        delivered_at: row.delivered_at,
    })
}
