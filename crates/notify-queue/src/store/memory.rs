//! In-memory queue backend for development and tests.
//!
//! Behaves like the PostgreSQL table: rows keep their ids after handling, the
//! table can be absent until [`QueueBackend::create_table`] runs, and sends wake
//! idle consumers the way NOTIFY does. Faults can be queued up front to
//! exercise the store's recovery paths.

use super::{Availability, NewRow, PendingKey, QueueBackend, StoredRow};
use crate::error::StoreError;
use crate::message::RowId;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Failure returned by the next backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Lock or serialization conflict
    Retryable,
    /// Any other database failure
    Fatal,
    /// The table is dropped with its rows; setup creates it again
    MissingTable,
}

struct MemoryTable {
    exists: bool,
    next_id: i64,
    rows: BTreeMap<i64, StoredRow>,
    faults: VecDeque<Fault>,
}

/// Queue table held in process memory
pub struct InMemoryBackend {
    table_name: String,
    state: Mutex<MemoryTable>,
    wakeup: Notify,
}

impl InMemoryBackend {
    /// Backend whose table does not exist yet
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            state: Mutex::new(MemoryTable {
                exists: false,
                next_id: 1,
                rows: BTreeMap::new(),
                faults: VecDeque::new(),
            }),
            wakeup: Notify::new(),
        }
    }

    /// Backend whose table is already created
    pub fn with_table(table_name: impl Into<String>) -> Self {
        let backend = Self::new(table_name);
        backend.lock().exists = true;
        backend
    }

    /// Queue a failure for the next backend call
    pub fn inject_fault(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    pub fn table_exists(&self) -> bool {
        self.lock().exists
    }

    /// Snapshot of every row, in id order
    pub fn rows(&self) -> Vec<StoredRow> {
        self.lock().rows.values().cloned().collect()
    }

    /// Record that another channel already delivered the order's notification
    pub fn mark_sent_elsewhere(&self, id: RowId, push_sent: bool, email_sent: bool) -> bool {
        match self.lock().rows.get_mut(&id.as_i64()) {
            Some(row) => {
                row.push_sent = push_sent;
                row.email_sent = email_sent;
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTable> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the table for one operation, surfacing injected faults first
    fn table(&self) -> Result<MutexGuard<'_, MemoryTable>, StoreError> {
        let mut state = self.lock();

        if let Some(fault) = state.faults.pop_front() {
            return Err(match fault {
                Fault::Retryable => {
                    StoreError::retryable("could not serialize access due to concurrent update")
                }
                Fault::Fatal => StoreError::backend("injected backend failure"),
                Fault::MissingTable => {
                    state.exists = false;
                    state.rows.clear();
                    StoreError::table_not_found(&self.table_name)
                }
            });
        }

        if !state.exists {
            return Err(StoreError::table_not_found(&self.table_name));
        }
        Ok(state)
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("table_name", &self.table_name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    async fn create_table(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        match state.faults.pop_front() {
            Some(Fault::Retryable) => Err(StoreError::retryable("lock timeout creating table")),
            Some(Fault::Fatal) => Err(StoreError::backend(format!(
                "cannot create table {}",
                self.table_name
            ))),
            Some(Fault::MissingTable) | None => {
                state.exists = true;
                Ok(())
            }
        }
    }

    async fn find_pending(&self, key: &PendingKey) -> Result<Option<RowId>, StoreError> {
        let state = self.table()?;
        Ok(state
            .rows
            .values()
            .find(|row| {
                !row.handled
                    && row.dedup_key == key.dedup_key.as_str()
                    && row.template_name == key.template_name
            })
            .map(|row| RowId::new(row.id)))
    }

    async fn insert(&self, row: &NewRow) -> Result<RowId, StoreError> {
        let id = {
            let mut state = self.table()?;
            let id = state.next_id;
            state.next_id += 1;
            state.rows.insert(
                id,
                StoredRow {
                    id,
                    dedup_key: row.dedup_key.to_string(),
                    encoded_payload: row.encoded_payload.to_vec(),
                    headers: row.headers.clone(),
                    provider_name: row.provider_name.clone(),
                    template_name: row.template_name.clone(),
                    handled: false,
                    push_sent: false,
                    email_sent: false,
                    created_at: row.created_at,
                    available_at: row.available_at,
                    delivered_at: None,
                },
            );
            id
        };

        self.wakeup.notify_waiters();
        Ok(RowId::new(id))
    }

    async fn update(&self, id: RowId, row: &NewRow) -> Result<(), StoreError> {
        {
            let mut state = self.table()?;
            if let Some(stored) = state.rows.get_mut(&id.as_i64()) {
                stored.dedup_key = row.dedup_key.to_string();
                stored.encoded_payload = row.encoded_payload.to_vec();
                stored.headers = row.headers.clone();
                stored.provider_name = row.provider_name.clone();
                stored.template_name = row.template_name.clone();
                stored.handled = false;
                stored.created_at = row.created_at;
                stored.available_at = row.available_at;
            }
        }

        self.wakeup.notify_waiters();
        Ok(())
    }

    async fn claim_next(&self, filter: &Availability) -> Result<Option<StoredRow>, StoreError> {
        let mut state = self.table()?;

        let next = state
            .rows
            .values()
            .filter(|row| filter.claimable(row))
            .min_by_key(|row| (row.available_at, row.id))
            .map(|row| row.id);

        Ok(next.and_then(|id| {
            state.rows.get_mut(&id).map(|row| {
                row.delivered_at = Some(filter.now);
                row.clone()
            })
        }))
    }

    async fn mark_handled(&self, id: RowId) -> Result<bool, StoreError> {
        let mut state = self.table()?;
        match state.rows.get_mut(&id.as_i64()) {
            Some(row) if !row.handled => {
                row.handled = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_available(&self, filter: &Availability) -> Result<u64, StoreError> {
        let state = self.table()?;
        Ok(state.rows.values().filter(|row| filter.matches(row)).count() as u64)
    }

    async fn list_available(
        &self,
        filter: &Availability,
        limit: Option<u32>,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let state = self.table()?;

        let mut rows: Vec<StoredRow> = state
            .rows
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.available_at, row.id));

        if let Some(limit) = limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn find(&self, id: RowId) -> Result<Option<StoredRow>, StoreError> {
        let state = self.table()?;
        Ok(state.rows.get(&id.as_i64()).cloned())
    }

    async fn wait_for_work(&self, timeout: Duration) -> Result<bool, StoreError> {
        Ok(tokio::time::timeout(timeout, self.wakeup.notified())
            .await
            .is_ok())
    }
}
