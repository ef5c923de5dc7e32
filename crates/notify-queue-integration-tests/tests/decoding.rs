//! Integration tests for payload decoding with model fallback
//!
//! These tests verify:
//! - The first configured model that accepts the body wins
//! - A row no configured model can read is rejected and reported
//! - Without configured models the stored `type` header decides

mod common;

use common::{get_one, localized_sms, memory_transport, sms, LocalizedOrderSms, OrderSms};
use notify_queue::{
    DecodeError, JsonSchema, MessageCodec, QueueError, Transport, TransportFactory,
    TransportOptions,
};
use tokio_test::{assert_err, assert_ok};

/// Verify that decoding falls through to a later model
#[tokio::test]
async fn test_later_model_decodes_when_earlier_fails() {
    let transport = memory_transport("payload.models=sms_localized,sms").await;

    assert_ok!(transport.send(sms(5001, "plain body")).await);

    let envelope = get_one(&transport).await;
    assert_eq!(envelope.message().model, common::SMS_MODEL);
    let payload: OrderSms = envelope.message().payload_as().unwrap();
    assert_eq!(payload.body, "plain body");
}

/// Verify that the first matching model wins even when a later one would also match
#[tokio::test]
async fn test_first_matching_model_wins() {
    let transport = memory_transport("payload.models=sms_localized,sms").await;

    assert_ok!(transport.send(localized_sms(5002, "Hallo", "de")).await);

    let envelope = get_one(&transport).await;
    assert_eq!(envelope.message().model, common::LOCALIZED_SMS_MODEL);
    let payload: LocalizedOrderSms = envelope.message().payload_as().unwrap();
    assert_eq!(payload.locale, "de");
}

/// Verify that bracketed model lists in the DSN are accepted
#[tokio::test]
async fn test_repeated_model_keys_keep_their_order() {
    let transport =
        memory_transport("payload[models][]=sms_localized&payload[models][]=sms").await;
    assert_eq!(
        transport.config().payload_models,
        vec!["sms_localized".to_string(), "sms".to_string()]
    );

    assert_ok!(transport.send(sms(5003, "still readable")).await);
    let envelope = get_one(&transport).await;
    assert_eq!(envelope.message().model, common::SMS_MODEL);
}

/// Verify that an undecodable row is rejected and the error reported
#[tokio::test]
async fn test_undecodable_row_is_rejected() {
    let transport = memory_transport("payload.models=sms_localized&redeliver_timeout=0").await;

    let sent = assert_ok!(transport.send(sms(5004, "old shape")).await);

    let err = assert_err!(transport.get().await);
    assert!(matches!(
        err,
        QueueError::Decode(DecodeError::Payload { ref model, .. }) if model == "sms_localized"
    ));

    let id = sent.transport_message_id().unwrap().id;
    let row = assert_ok!(transport.find(id).await).unwrap();
    assert!(row.handled, "Undecodable rows must not be redelivered");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(assert_ok!(transport.get().await).is_empty());
}

/// Verify that the stored type header is used when no models are configured
#[tokio::test]
async fn test_stored_type_header_is_used_without_models() {
    let transport = memory_transport("").await;

    assert_ok!(transport.send(localized_sms(5005, "Bonjour", "fr")).await);

    let envelope = get_one(&transport).await;
    assert_eq!(envelope.message().model, common::LOCALIZED_SMS_MODEL);
}

/// Verify that an unregistered stored type is a decode failure
#[tokio::test]
async fn test_unknown_stored_type_is_rejected() {
    let codec = MessageCodec::new().with_schema(JsonSchema::<OrderSms>::new("sms"));
    let transport = TransportFactory::create_test_transport(codec);

    let sent = assert_ok!(transport.send(localized_sms(5006, "Hola", "es")).await);

    let err = assert_err!(transport.get().await);
    assert!(matches!(
        err,
        QueueError::Decode(DecodeError::UnknownModel { ref model }) if model == "sms_localized"
    ));
    let row = assert_ok!(transport.find(sent.transport_message_id().unwrap().id).await);
    assert!(row.unwrap().handled);
}

/// Verify that configuring a model the codec does not know fails at creation
#[tokio::test]
async fn test_unregistered_model_fails_at_creation() {
    let result = TransportFactory::create_transport(
        "notification-sms://memory?payload.models=sms,voice",
        &TransportOptions::new(),
        common::codec(),
    )
    .await;

    let err = assert_err!(result);
    assert!(matches!(err, QueueError::Configuration(_)));
    assert!(err.to_string().contains("voice"));
}
