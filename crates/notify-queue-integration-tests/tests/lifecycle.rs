//! Integration tests for the send, receive, acknowledge cycle
//!
//! These tests verify:
//! - Provenance stamps link a received envelope to the sent row
//! - Acknowledged and rejected rows never surface again
//! - Handled rows stay inspectable by id
//! - Acknowledging requires a received envelope
//! - Concurrent consumers never claim the same row

mod common;

use common::{get_one, memory_transport, sms, OrderSms};
use notify_queue::{QueueError, RowId, Transport};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

/// Verify the full round trip of one message
#[tokio::test]
async fn test_round_trip_with_provenance() {
    let transport = memory_transport("").await;

    let sent = assert_ok!(transport.send(sms(4001, "Ready for pickup")).await);
    let id = sent.transport_message_id().expect("send stamps the row id").id;

    let received = get_one(&transport).await;
    assert_eq!(received.received().unwrap().id, id);
    assert_eq!(received.transport_message_id().unwrap().id, id);
    assert_eq!(received.message().model, common::SMS_MODEL);
    assert_eq!(
        received.message().payload_as::<OrderSms>().unwrap(),
        OrderSms {
            order_id: 4001,
            body: "Ready for pickup".to_string()
        }
    );

    assert_ok!(transport.ack(&received).await);
    assert_eq!(assert_ok!(transport.message_count().await), 0);

    let row = assert_ok!(transport.find(id).await).expect("handled rows are kept");
    assert!(row.handled);
    assert!(row.delivered_at.is_some());
    assert_eq!(row.dedup_key.as_str(), "4001");
    assert_eq!(row.headers.get("type").map(String::as_str), Some("sms"));
    assert_eq!(
        row.headers.get("Content-Type").map(String::as_str),
        Some("application/json")
    );
}

/// Verify that an acknowledged message is never delivered again
#[tokio::test]
async fn test_ack_removes_message_from_circulation() {
    let transport = memory_transport("redeliver_timeout=0").await;

    assert_ok!(transport.send(sms(4002, "done")).await);
    let envelope = get_one(&transport).await;
    assert_ok!(transport.ack(&envelope).await);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert!(assert_ok!(transport.get().await).is_empty());
    assert!(assert_ok!(transport.all(None).await).is_empty());
}

/// Verify that reject behaves exactly like ack
#[tokio::test]
async fn test_reject_is_terminal() {
    let transport = memory_transport("redeliver_timeout=0").await;

    let sent = assert_ok!(transport.send(sms(4003, "bad number")).await);
    let envelope = get_one(&transport).await;
    assert_ok!(transport.reject(&envelope).await);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert!(assert_ok!(transport.get().await).is_empty());
    assert_eq!(assert_ok!(transport.message_count().await), 0);

    let id = sent.transport_message_id().unwrap().id;
    let row = assert_ok!(transport.find(id).await).unwrap();
    assert!(row.handled);
}

/// Verify that an envelope that was never received cannot be acknowledged
#[tokio::test]
async fn test_ack_without_received_stamp_is_a_logic_error() {
    let transport = memory_transport("").await;

    let sent = assert_ok!(transport.send(sms(4004, "not claimed")).await);

    let err = assert_err!(transport.ack(&sent).await);
    assert!(matches!(err, QueueError::Logic { .. }));
    let err = assert_err!(transport.reject(&sent).await);
    assert!(matches!(err, QueueError::Logic { .. }));

    assert_eq!(assert_ok!(transport.message_count().await), 1);
}

/// Verify that listing returns available rows earliest first and honours the limit
#[tokio::test]
async fn test_all_lists_available_rows() {
    let transport = memory_transport("").await;

    for order in 1..=4 {
        assert_ok!(transport.send(sms(order, "hello")).await);
    }

    let rows = assert_ok!(transport.all(None).await);
    assert_eq!(rows.len(), 4);
    assert!(rows
        .windows(2)
        .all(|pair| pair[0].available_at <= pair[1].available_at));

    let limited = assert_ok!(transport.all(Some(2)).await);
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].id, rows[0].id);
}

/// Verify that looking up an unknown id is not an error
#[tokio::test]
async fn test_find_unknown_id_returns_none() {
    let transport = memory_transport("").await;
    assert!(assert_ok!(transport.find(notify_queue::RowId::new(999)).await).is_none());
}

/// Verify that setup can be run more than once
#[tokio::test]
async fn test_setup_is_idempotent() {
    let transport = memory_transport("auto_setup=false").await;

    assert_ok!(transport.setup().await);
    assert_ok!(transport.setup().await);
    assert_ok!(transport.send(sms(4005, "after setup")).await);
    assert_eq!(assert_ok!(transport.message_count().await), 1);
}

/// Verify that a missing table is an error when auto setup is off
#[tokio::test]
async fn test_missing_table_without_auto_setup_fails() {
    let transport = memory_transport("auto_setup=false").await;

    let err = assert_err!(transport.send(sms(4006, "nowhere to go")).await);
    assert!(matches!(err, QueueError::Transport { ref source, .. } if source.is_table_missing()));
    assert!(!err.is_transient());
}

/// Verify that consumers racing on one queue split the rows between them
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumers_never_share_a_row() {
    let transport = Arc::new(memory_transport("").await);
    for order in 0..20 {
        assert_ok!(transport.send(sms(4100 + order, "parallel")).await);
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let transport = Arc::clone(&transport);
        handles.push(tokio::spawn(async move {
            let mut claimed: Vec<RowId> = Vec::new();
            loop {
                let batch = transport.get().await.expect("get failed");
                if batch.is_empty() {
                    return claimed;
                }
                claimed.extend(batch.iter().map(|e| e.received().unwrap().id));
                tokio::task::yield_now().await;
            }
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.extend(handle.await.unwrap());
    }

    let unique: HashSet<RowId> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len(), "A row was claimed twice");
    assert_eq!(ids.len(), 20);

    // Claimed rows are in flight and no longer counted
    assert_eq!(assert_ok!(transport.message_count().await), 0);
}
