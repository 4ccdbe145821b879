//! Shared test harness: a scripted engine and helpers that drive the dispatcher
//! deterministically through `process_engine_message`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use rvoip_call_control::engine::CallProgress;
use rvoip_call_control::{
    AccountId, CallId, CallState, CallbackId, CallbackResult, Command, ControlEvent, ControlResult, Dispatcher,
    DispatcherBuilder, EngineAck, EngineFailure, EngineHandle, EngineMessage, EngineNotification, EngineRequest,
    RequestToken, TelephonyEngine, Value,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rvoip_call_control=debug")
        .with_test_writer()
        .try_init();
}

/// How the mock engine answers a request
#[derive(Debug, Clone)]
pub enum Reply {
    Complete(Value),
    Fail(EngineFailure),
    /// Answer `Pending`; the test completes it later
    Park,
}

/// Engine that records every request and answers from a script keyed by
/// request name. Unscripted requests complete immediately.
pub struct MockEngine {
    script: Mutex<HashMap<&'static str, Reply>>,
    requests: Mutex<Vec<(RequestToken, EngineRequest)>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn reply(&self, request: &'static str, reply: Reply) {
        self.script.lock().insert(request, reply);
    }

    pub fn requests(&self) -> Vec<(RequestToken, EngineRequest)> {
        self.requests.lock().clone()
    }

    pub fn requests_named(&self, name: &str) -> Vec<(RequestToken, EngineRequest)> {
        self.requests
            .lock()
            .iter()
            .filter(|(_, request)| request.name() == name)
            .cloned()
            .collect()
    }

    /// Token of the most recent request with this name
    pub fn last_token(&self, name: &str) -> RequestToken {
        self.requests_named(name)
            .last()
            .map(|(token, _)| *token)
            .unwrap_or_else(|| panic!("no {} request was sent", name))
    }
}

#[async_trait]
impl TelephonyEngine for MockEngine {
    async fn submit(&self, token: RequestToken, request: EngineRequest) -> Result<EngineAck, EngineFailure> {
        let reply = self.script.lock().get(request.name()).cloned();
        self.requests.lock().push((token, request));
        match reply {
            None => Ok(EngineAck::Completed(Value::Null)),
            Some(Reply::Complete(value)) => Ok(EngineAck::Completed(value)),
            Some(Reply::Fail(failure)) => Err(failure),
            Some(Reply::Park) => Ok(EngineAck::Pending),
        }
    }
}

pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<MockEngine>,
    pub handle: EngineHandle,
    pub events: broadcast::Receiver<ControlEvent>,
    next_callback: AtomicI64,
}

pub fn harness() -> Harness {
    harness_with(Dispatcher::builder())
}

pub fn harness_with(builder: DispatcherBuilder) -> Harness {
    init_tracing();
    let engine = MockEngine::new();
    let (handle, inbox) = builder.engine_channel();
    let dispatcher = builder.build(engine.clone(), inbox).expect("valid config");
    let events = dispatcher.subscribe_events();
    Harness {
        dispatcher,
        engine,
        handle,
        events,
        next_callback: AtomicI64::new(100),
    }
}

impl Harness {
    pub fn command(&self, action: &str) -> Command {
        Command::new(action, self.next_callback.fetch_add(1, Ordering::Relaxed))
    }

    pub fn call_command(&self, action: &str, call_id: CallId) -> Command {
        self.command(action).with("call_id", call_id)
    }

    pub async fn execute(&self, command: Command) -> ControlResult<Value> {
        self.dispatcher.execute(command).await
    }

    pub async fn notify(&self, notification: EngineNotification) {
        self.dispatcher
            .process_engine_message(EngineMessage::Notification(notification))
            .await;
    }

    pub async fn complete(&self, token: RequestToken, outcome: Result<Value, EngineFailure>) {
        self.dispatcher
            .process_engine_message(EngineMessage::Completion { token, outcome })
            .await;
    }

    /// Create an account and register it, all answered inline
    pub async fn registered_account(&self, username: &str) -> AccountId {
        let created = self
            .execute(
                self.command("account_create")
                    .with("username", username)
                    .with("domain", "example.com"),
            )
            .await
            .expect("account created");
        let account_id = id_of(&created);
        self.execute(self.command("account_register").with("account_id", account_id))
            .await
            .expect("account registered");
        account_id
    }

    /// Place an outbound call; the engine accepts the INVITE inline
    pub async fn outbound_call(&self, account_id: AccountId, destination: &str) -> CallId {
        let call = self
            .execute(
                self.command("call_make")
                    .with("account_id", account_id)
                    .with("destination", destination),
            )
            .await
            .expect("call placed");
        id_of(&call)
    }

    pub async fn progress(&self, call_id: CallId, progress: CallProgress, code: u16) {
        let sip_call_id = self.sip_call_id(call_id).await;
        self.notify(EngineNotification::CallProgress {
            sip_call_id,
            progress,
            code,
            reason: "progress".into(),
        })
        .await;
    }

    /// Outbound call that the remote side has answered
    pub async fn connected_call(&self, account_id: AccountId, destination: &str) -> CallId {
        let call_id = self.outbound_call(account_id, destination).await;
        self.progress(call_id, CallProgress::Connected, 200).await;
        call_id
    }

    pub async fn incoming_call(&self, account_id: AccountId, sip_call_id: &str) -> CallId {
        self.notify(EngineNotification::IncomingCall {
            account_id,
            sip_call_id: sip_call_id.to_string(),
            remote_uri: "sip:carol@example.org".into(),
            local_uri: None,
        })
        .await;
        self.dispatcher
            .list_calls()
            .await
            .into_iter()
            .find(|call| call.sip_call_id == sip_call_id)
            .map(|call| call.id)
            .expect("incoming call created")
    }

    pub async fn sip_call_id(&self, call_id: CallId) -> String {
        self.dispatcher.call(call_id).await.expect("known call").sip_call_id
    }

    pub async fn state(&self, call_id: CallId) -> CallState {
        self.dispatcher.call(call_id).await.expect("known call").state
    }

    /// Everything emitted since the last drain
    pub fn drain(&mut self) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// The `id` field of an account or call snapshot
pub fn id_of(value: &Value) -> u32 {
    value
        .as_map()
        .and_then(|map| map.get("id"))
        .and_then(Value::as_i64)
        .and_then(|id| u32::try_from(id).ok())
        .expect("snapshot carries an id")
}

/// Call states carried by call-changed / call-terminated events for one call
pub fn call_states(events: &[ControlEvent], call_id: CallId) -> Vec<CallState> {
    events
        .iter()
        .filter_map(|event| match event {
            ControlEvent::CallChanged(call) | ControlEvent::CallTerminated(call) | ControlEvent::CallReceived(call)
                if call.id == call_id =>
            {
                Some(call.state)
            }
            _ => None,
        })
        .collect()
}

pub fn acknowledgements(events: &[ControlEvent]) -> Vec<CallbackResult> {
    events
        .iter()
        .filter_map(|event| match event {
            ControlEvent::CommandAcknowledged(result) => Some(result.clone()),
            _ => None,
        })
        .collect()
}

pub fn acknowledgement(events: &[ControlEvent], callback_id: CallbackId) -> Option<CallbackResult> {
    acknowledgements(events)
        .into_iter()
        .find(|result| result.callback_id == callback_id)
}

pub fn terminated_count(events: &[ControlEvent], call_id: CallId) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, ControlEvent::CallTerminated(call) if call.id == call_id))
        .count()
}
