//! Integration tests for store failures seen through the transport
//!
//! These tests verify:
//! - Lock conflicts are absorbed until the retry limit is reached
//! - A dropped table is recreated on first use
//! - Rows already delivered through another channel are not claimed

mod common;

use common::{get_one, shared_transport, sms};
use notify_queue::store::Fault;
use notify_queue::{InMemoryBackend, QueueError, Transport, MAX_RETRIES};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

fn backend() -> Arc<InMemoryBackend> {
    Arc::new(InMemoryBackend::with_table("notification_sms"))
}

/// Verify that conflicts below the limit look like an empty queue
#[tokio::test]
async fn test_conflicts_below_limit_return_empty_batches() {
    let backend = backend();
    let transport = shared_transport(Arc::clone(&backend), None);
    assert_ok!(transport.send(sms(7001, "contended")).await);

    for _ in 1..MAX_RETRIES {
        backend.inject_fault(Fault::Retryable);
        assert!(assert_ok!(transport.get().await).is_empty());
    }

    // A successful poll resets the count
    let envelope = get_one(&transport).await;
    assert_eq!(envelope.message().order_id, 7001);

    backend.inject_fault(Fault::Retryable);
    assert!(assert_ok!(transport.get().await).is_empty());
}

/// Verify that repeated conflicts eventually surface as a transient error
#[tokio::test]
async fn test_repeated_conflicts_surface_as_transient_error() {
    let backend = backend();
    let transport = shared_transport(Arc::clone(&backend), None);

    for _ in 0..MAX_RETRIES {
        backend.inject_fault(Fault::Retryable);
    }
    for _ in 1..MAX_RETRIES {
        assert!(assert_ok!(transport.get().await).is_empty());
    }

    let err = assert_err!(transport.get().await);
    assert!(err.is_transient());
    assert!(matches!(err, QueueError::Transport { .. }));

    // The counter starts over after reporting
    backend.inject_fault(Fault::Retryable);
    assert!(assert_ok!(transport.get().await).is_empty());
}

/// Verify that a non-retryable failure is reported at once
#[tokio::test]
async fn test_fatal_failure_is_reported_immediately() {
    let backend = backend();
    let transport = shared_transport(Arc::clone(&backend), None);

    backend.inject_fault(Fault::Fatal);
    let err = assert_err!(transport.get().await);
    assert!(!err.is_transient());
}

/// Verify that a dropped table is recreated and the operation retried
#[tokio::test]
async fn test_dropped_table_is_recreated() {
    let backend = backend();
    let transport = shared_transport(Arc::clone(&backend), None);

    backend.inject_fault(Fault::MissingTable);
    assert_ok!(transport.send(sms(7002, "after drop")).await);

    assert!(backend.table_exists());
    assert_eq!(backend.rows().len(), 1);
    assert_eq!(get_one(&transport).await.message().order_id, 7002);
}

/// Verify that rows sent by push or email are counted but not claimed
#[tokio::test]
async fn test_rows_sent_elsewhere_are_not_claimed() {
    let backend = backend();
    let transport = shared_transport(Arc::clone(&backend), None);

    let sent = assert_ok!(transport.send(sms(7003, "already pushed")).await);
    assert!(backend.mark_sent_elsewhere(sent.transport_message_id().unwrap().id, true, false));

    assert_eq!(assert_ok!(transport.message_count().await), 1);
    assert!(assert_ok!(transport.get().await).is_empty());
}
