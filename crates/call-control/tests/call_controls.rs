//! Integration tests for hold, mute, audio route, transfers, redirect and DTMF

mod common;

use serial_test::serial;
use tokio_test::{assert_err, assert_ok};

use common::*;
use rvoip_call_control::{CallState, ControlEvent, EngineFailure, EngineRequest, Submission, Value};

#[tokio::test]
#[serial]
async fn test_hold_and_unhold_are_idempotent() {
    let mut h = harness();
    let account = h.registered_account("alice").await;
    let call = h.connected_call(account, "bob").await;
    h.drain();

    h.execute(h.call_command("call_hold", call)).await.unwrap();
    assert!(h.dispatcher.call(call).await.unwrap().held);
    assert_ok!(h.execute(h.call_command("call_hold", call)).await);
    assert_eq!(h.engine.requests_named("hold").len(), 1);

    h.execute(h.call_command("call_unhold", call)).await.unwrap();
    assert_ok!(h.execute(h.call_command("call_unhold", call)).await);
    assert_eq!(h.engine.requests_named("unhold").len(), 1);

    let events = h.drain();
    assert_eq!(call_states(&events, call), vec![CallState::Holding, CallState::Connected]);
}

#[tokio::test]
#[serial]
async fn test_second_operation_while_one_is_pending() {
    let h = harness();
    let account = h.registered_account("alice").await;
    let call = h.connected_call(account, "bob").await;
    h.engine.reply("hold", Reply::Park);

    assert_eq!(
        h.dispatcher.submit(h.call_command("call_hold", call)).await.unwrap(),
        Submission::Parked
    );
    let err = assert_err!(h.dispatcher.submit(h.call_command("call_hold", call)).await);
    assert_eq!(err.kind(), "InvalidState");
    let err = assert_err!(
        h.dispatcher
            .submit(h.call_command("call_xfer", call).with("destination", "sip:dave@example.org"))
            .await
    );
    assert_eq!(err.kind(), "InvalidState");

    // DTMF does not need the slot
    assert_ok!(h.execute(h.call_command("call_dtmf", call).with("digits", "12#")).await);

    let token = h.engine.last_token("hold");
    h.complete(token, Ok(Value::Null)).await;
    assert_eq!(h.state(call).await, CallState::Holding);
}

#[tokio::test]
#[serial]
async fn test_mute_and_audio_route_are_attribute_flips() {
    let mut h = harness();
    let account = h.registered_account("alice").await;
    let call = h.outbound_call(account, "bob").await;
    h.drain();

    // valid before the call is answered
    h.execute(h.call_command("call_mute", call)).await.unwrap();
    h.execute(h.call_command("call_use_speaker", call)).await.unwrap();
    let snapshot = h.dispatcher.call(call).await.unwrap();
    assert!(snapshot.muted);
    assert!(snapshot.speaker);
    assert_eq!(snapshot.state, CallState::Initiating);

    // repeating is a no-op
    h.execute(h.call_command("call_mute", call)).await.unwrap();
    assert_eq!(h.engine.requests_named("mute").len(), 1);

    h.execute(h.call_command("call_unmute", call)).await.unwrap();
    h.execute(h.call_command("call_use_earpiece", call)).await.unwrap();
    let snapshot = h.dispatcher.call(call).await.unwrap();
    assert!(!snapshot.muted);
    assert!(!snapshot.speaker);

    let changed = h
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ControlEvent::CallChanged(c) if c.id == call))
        .count();
    assert_eq!(changed, 4);

    h.execute(h.call_command("call_hangup", call)).await.unwrap();
    let err = h.execute(h.call_command("call_mute", call)).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidState");
}

#[tokio::test]
#[serial]
async fn test_dtmf_requires_connected_call() {
    let h = harness();
    let account = h.registered_account("alice").await;
    let call = h.outbound_call(account, "bob").await;

    let err = h.execute(h.call_command("call_dtmf", call).with("digits", "5")).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidState");

    let err = h.execute(h.call_command("call_dtmf", call).with("digits", "5x")).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidArgument");

    h.progress(call, rvoip_call_control::engine::CallProgress::Connected, 200).await;
    h.execute(h.call_command("call_dtmf", call).with("digits", "1a*")).await.unwrap();
    match h.engine.requests_named("send-dtmf").last() {
        Some((_, EngineRequest::SendDtmf { digits, .. })) => assert_eq!(digits, "1A*"),
        other => panic!("unexpected request {:?}", other),
    }
    assert_eq!(h.state(call).await, CallState::Connected);
}

#[tokio::test]
#[serial]
async fn test_blind_transfer_links_and_terminates() {
    let mut h = harness();
    let account = h.registered_account("alice").await;
    let call = h.connected_call(account, "bob").await;
    h.drain();

    h.execute(h.call_command("call_xfer", call).with("destination", "sip:dave@example.org"))
        .await
        .unwrap();
    assert_eq!(h.state(call).await, CallState::Terminated);

    let events = h.drain();
    let link = events
        .iter()
        .find_map(|e| match e {
            ControlEvent::CallTransferred(link) => Some(link.clone()),
            _ => None,
        })
        .expect("linkage event");
    assert_eq!(link.call.id, call);
    assert_eq!(link.destination, "sip:dave@example.org");
    assert_eq!(link.replaced_call_id, None);
    assert_eq!(terminated_count(&events, call), 1);
}

#[tokio::test]
#[serial]
async fn test_failed_transfer_leaves_call_connected() {
    let h = harness();
    let account = h.registered_account("alice").await;
    let call = h.connected_call(account, "bob").await;
    h.engine.reply("transfer", Reply::Fail(EngineFailure::new(603, "Declined")));

    let err = h
        .execute(h.call_command("call_xfer", call).with("destination", "sip:dave@example.org"))
        .await
        .unwrap_err();
    assert_eq!(err.engine_code(), Some(603));
    assert_eq!(h.state(call).await, CallState::Connected);

    // the slot is free again
    assert_ok!(h.execute(h.call_command("call_hold", call)).await);
}

#[tokio::test]
#[serial]
async fn test_transfer_rejects_non_uri_destination() {
    let h = harness();
    let account = h.registered_account("alice").await;
    let call = h.connected_call(account, "bob").await;

    let err = h
        .execute(h.call_command("call_xfer", call).with("destination", "dave"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidArgument");
    assert!(h.engine.requests_named("transfer").is_empty());
}

#[tokio::test]
#[serial]
async fn test_attended_transfer_replaces_consultation_call() {
    let mut h = harness();
    let account = h.registered_account("alice").await;
    let original = h.connected_call(account, "bob").await;
    h.execute(h.call_command("call_hold", original)).await.unwrap();
    let consultation = h.connected_call(account, "sip:dave@example.org").await;
    h.drain();

    // the transferred leg must be Connected, not on hold
    let err = h
        .execute(h.call_command("call_xfer_replace", original).with("dest_call_id", consultation))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidState");

    h.execute(h.call_command("call_unhold", original)).await.unwrap();
    h.execute(h.call_command("call_xfer_replace", original).with("dest_call_id", consultation))
        .await
        .unwrap();

    assert_eq!(h.state(original).await, CallState::Terminated);
    assert_eq!(h.state(consultation).await, CallState::Connected);
    match h.engine.requests_named("transfer-replace").last() {
        Some((_, EngineRequest::TransferReplace { replaces_sip_call_id, .. })) => {
            assert_eq!(*replaces_sip_call_id, h.sip_call_id(consultation).await)
        }
        other => panic!("unexpected request {:?}", other),
    }

    let events = h.drain();
    let link = events
        .iter()
        .find_map(|e| match e {
            ControlEvent::CallTransferred(link) => Some(link.clone()),
            _ => None,
        })
        .expect("linkage event");
    assert_eq!(link.replaced_call_id, Some(consultation));
    assert_eq!(link.destination, "sip:dave@example.org");
}

/// A consultation call that is itself mid-transfer cannot be used
#[tokio::test]
#[serial]
async fn test_attended_transfer_overlap_is_invalid_state() {
    let h = harness();
    let account = h.registered_account("alice").await;
    let first = h.connected_call(account, "bob").await;
    let second = h.connected_call(account, "carol").await;
    let third = h.connected_call(account, "dave").await;
    h.engine.reply("transfer-replace", Reply::Park);

    h.dispatcher
        .submit(h.call_command("call_xfer_replace", first).with("dest_call_id", second))
        .await
        .unwrap();

    let err = h
        .execute(h.call_command("call_xfer_replace", third).with("dest_call_id", second))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidState");
    // the rejected attempt left the third call untouched
    assert_ok!(h.execute(h.call_command("call_hold", third)).await);

    let err = h
        .execute(h.call_command("call_xfer", second).with("destination", "sip:erin@example.org"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidState");
}

#[tokio::test]
#[serial]
async fn test_hangup_of_consultation_call_releases_transferred_call() {
    let mut h = harness();
    let account = h.registered_account("alice").await;
    let original = h.connected_call(account, "bob").await;
    let consultation = h.connected_call(account, "carol").await;
    h.engine.reply("transfer-replace", Reply::Park);

    let transfer = h.call_command("call_xfer_replace", original).with("dest_call_id", consultation);
    let transfer_callback = transfer.callback_id;
    h.dispatcher.submit(transfer).await.unwrap();
    h.drain();

    h.execute(h.call_command("call_hangup", consultation)).await.unwrap();
    let events = h.drain();
    assert_eq!(
        acknowledgement(&events, transfer_callback).and_then(|r| r.error_kind().map(str::to_string)),
        Some("StaleReference".to_string())
    );

    assert_eq!(h.state(original).await, CallState::Connected);
    assert_ok!(h.execute(h.call_command("call_hold", original)).await);
}

#[tokio::test]
#[serial]
async fn test_redirect_terminates_without_linkage() {
    let mut h = harness();
    let account = h.registered_account("alice").await;
    let call = h.connected_call(account, "bob").await;
    h.drain();

    h.execute(h.call_command("call_redirect", call).with("destination", "sip:voicemail@example.com"))
        .await
        .unwrap();
    let snapshot = h.dispatcher.call(call).await.unwrap();
    assert_eq!(snapshot.state, CallState::Terminated);
    assert_eq!(snapshot.last_status_code, Some(302));

    let events = h.drain();
    assert!(!events.iter().any(|e| matches!(e, ControlEvent::CallTransferred(_))));
    assert_eq!(terminated_count(&events, call), 1);
}
