//! Integration tests for account creation, registration and deletion

mod common;

use std::time::Duration;

use serial_test::serial;
use tokio_test::assert_ok;

use common::*;
use rvoip_call_control::{
    ControlEvent, Dispatcher, EngineFailure, EngineNotification, EngineRequest, RegistrationState, Submission, Value,
};

fn registration_states(events: &[ControlEvent]) -> Vec<RegistrationState> {
    events
        .iter()
        .filter_map(|event| match event {
            ControlEvent::RegistrationChanged(account) => Some(account.registration.state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
#[serial]
async fn test_create_and_register() {
    let mut h = harness();
    let created = h
        .execute(
            h.command("account_create")
                .with("username", "alice")
                .with("domain", "example.com")
                .with("regTimeout", 600i64),
        )
        .await
        .unwrap();
    let account = id_of(&created);

    h.execute(h.command("account_register").with("account_id", account))
        .await
        .unwrap();

    let snapshot = h.dispatcher.account(account).await.unwrap();
    assert_eq!(snapshot.uri, "sip:alice@example.com");
    assert_eq!(snapshot.registration.state, RegistrationState::Registered);
    assert_eq!(snapshot.registration.code, Some(200));
    assert_eq!(snapshot.registration.expires, Some(600));

    let events = h.drain();
    assert!(matches!(events.first(), Some(ControlEvent::AccountCreated(a)) if a.id == account));
    assert_eq!(
        registration_states(&events),
        vec![RegistrationState::Registering, RegistrationState::Registered]
    );
}

#[tokio::test]
#[serial]
async fn test_create_requires_identity() {
    let h = harness();
    let err = h
        .execute(h.command("account_create").with("domain", "example.com"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidConfig");
    assert!(h.dispatcher.list_accounts().await.is_empty());
}

#[tokio::test]
#[serial]
async fn test_registration_failure_then_retry() {
    let mut h = harness();
    let created = h
        .execute(h.command("account_create").with("username", "alice").with("domain", "example.com"))
        .await
        .unwrap();
    let account = id_of(&created);
    h.engine.reply("register", Reply::Fail(EngineFailure::new(403, "Forbidden")));

    let err = h
        .execute(h.command("account_register").with("account_id", account))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "EngineFailure");
    assert_eq!(err.engine_code(), Some(403));

    let snapshot = h.dispatcher.account(account).await.unwrap();
    assert_eq!(snapshot.registration.state, RegistrationState::Failed);
    assert_eq!(snapshot.registration.reason.as_deref(), Some("Forbidden"));

    // calls are refused while the registration is failed
    let err = h
        .execute(h.command("call_make").with("account_id", account).with("destination", "bob"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidState");
    assert!(h.dispatcher.list_calls().await.is_empty());

    h.engine.reply("register", Reply::Complete(Value::Null));
    assert_ok!(h.execute(h.command("account_register").with("account_id", account)).await);

    let events = h.drain();
    assert_eq!(
        registration_states(&events),
        vec![
            RegistrationState::Registering,
            RegistrationState::Failed,
            RegistrationState::Registering,
            RegistrationState::Registered,
        ]
    );
}

#[tokio::test]
#[serial]
async fn test_register_when_registered_is_noop_unless_renewing() {
    let h = harness();
    let account = h.registered_account("alice").await;
    assert_eq!(h.engine.requests_named("register").len(), 1);

    assert_ok!(h.execute(h.command("account_register").with("account_id", account)).await);
    assert_eq!(h.engine.requests_named("register").len(), 1);

    h.engine.reply("register", Reply::Park);
    let renew = h.command("account_register").with("account_id", account).with("renew", true);
    assert_eq!(h.dispatcher.submit(renew).await.unwrap(), Submission::Parked);

    // the refresh keeps the account usable
    let snapshot = h.dispatcher.account(account).await.unwrap();
    assert_eq!(snapshot.registration.state, RegistrationState::Registered);
    match h.engine.requests_named("register").last() {
        Some((_, EngineRequest::Register { renew, .. })) => assert!(*renew),
        other => panic!("unexpected request {:?}", other),
    }

    let token = h.engine.last_token("register");
    let mut details = std::collections::BTreeMap::new();
    details.insert("expires".to_string(), Value::from(120u32));
    h.complete(token, Ok(Value::from(details))).await;
    let snapshot = h.dispatcher.account(account).await.unwrap();
    assert_eq!(snapshot.registration.expires, Some(120));
}

#[tokio::test]
#[serial]
async fn test_delete_refused_while_calls_are_live() {
    let h = harness();
    let account = h.registered_account("alice").await;
    let call = h.connected_call(account, "bob").await;

    let err = h
        .execute(h.command("account_delete").with("account_id", account))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "AccountBusy");
    assert!(h.dispatcher.account(account).await.is_ok());

    h.execute(h.call_command("call_hangup", call)).await.unwrap();
    assert_ok!(h.execute(h.command("account_delete").with("account_id", account)).await);
}

#[tokio::test]
#[serial]
async fn test_delete_registered_account_unregisters() {
    let h = harness();
    let account = h.registered_account("alice").await;

    let deleted = h
        .execute(h.command("account_delete").with("account_id", account))
        .await
        .unwrap();
    assert_eq!(deleted, Value::from(account));
    assert!(matches!(
        h.engine.requests_named("unregister").last(),
        Some((_, EngineRequest::Unregister { account_id })) if *account_id == account
    ));

    let err = h.dispatcher.account(account).await.unwrap_err();
    assert_eq!(err.kind(), "StaleReference");
    let err = h
        .execute(h.command("account_register").with("account_id", account))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "StaleReference");
}

#[tokio::test]
#[serial]
async fn test_delete_unregistered_account_skips_engine() {
    let h = harness();
    let created = h
        .execute(h.command("account_create").with("username", "alice").with("domain", "example.com"))
        .await
        .unwrap();

    assert_ok!(h.execute(h.command("account_delete").with("account_id", id_of(&created))).await);
    assert!(h.engine.requests_named("unregister").is_empty());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_deleted_id_reused_only_after_grace_period() {
    let h = harness_with(Dispatcher::builder().id_grace_period(Duration::from_secs(5)));
    let create = |username: &str| {
        h.command("account_create")
            .with("username", username)
            .with("domain", "example.com")
    };

    let first = id_of(&h.execute(create("alice")).await.unwrap());
    h.execute(h.command("account_delete").with("account_id", first))
        .await
        .unwrap();

    let second = id_of(&h.execute(create("bob")).await.unwrap());
    assert_ne!(second, first);

    tokio::time::advance(Duration::from_secs(6)).await;
    let third = id_of(&h.execute(create("carol")).await.unwrap());
    assert_eq!(third, first);
}

#[tokio::test]
#[serial]
async fn test_registrar_updates_change_state() {
    let mut h = harness();
    let account = h.registered_account("alice").await;
    h.drain();

    let expired = EngineNotification::RegistrationChanged {
        account_id: account,
        code: 200,
        reason: "OK".into(),
        expires: Some(0),
        retry_after: None,
    };
    h.notify(expired.clone()).await;
    h.notify(expired).await;
    assert_eq!(registration_states(&h.drain()), vec![RegistrationState::Unregistered]);

    h.notify(EngineNotification::RegistrationChanged {
        account_id: account,
        code: 503,
        reason: "Service Unavailable".into(),
        expires: None,
        retry_after: Some(30),
    })
    .await;
    let snapshot = h.dispatcher.account(account).await.unwrap();
    assert_eq!(snapshot.registration.state, RegistrationState::Failed);
    assert_eq!(snapshot.registration.retry_after, Some(30));
    assert_eq!(registration_states(&h.drain()), vec![RegistrationState::Failed]);
}

#[tokio::test]
#[serial]
async fn test_update_for_unknown_account_is_ignored() {
    let mut h = harness();
    h.notify(EngineNotification::RegistrationChanged {
        account_id: 42,
        code: 200,
        reason: "OK".into(),
        expires: Some(3600),
        retry_after: None,
    })
    .await;
    assert!(h.drain().is_empty());
}
