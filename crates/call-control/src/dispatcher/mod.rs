//! Command dispatcher
//!
//! The [`Dispatcher`] is the single entry point of the control core. It takes
//! [`Command`]s from the UI layer, validates them, routes them to the account
//! and call tables, and reports exactly one [`CallbackResult`] per command as a
//! [`ControlEvent::CommandAcknowledged`] event.
//!
//! # Architecture
//!
//! The handlers are split by concern, each adding an `impl Dispatcher` block:
//!
//! - **`service`** - `start`, service configuration, codec and network settings
//! - **`accounts`** - account creation, registration and deletion
//! - **`calls`** - placing, answering, ringing and tearing down calls
//! - **`controls`** - hold, mute, audio route, transfers, redirect and DTMF
//! - **`engine_events`** - unsolicited notifications pushed by the engine
//!
//! # Parked commands
//!
//! Commands that need the engine are *parked* under a [`RequestToken`] before
//! the request is submitted. The engine may answer inline or later through the
//! inbox; either way the parked continuation runs exactly once, applies the
//! outcome to the owning entity and resolves the callback. Parked commands
//! older than the engine timeout are failed by the sweep with a 408.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use rvoip_call_control::{Command, Dispatcher, TelephonyEngine, ControlResult};
//! # async fn example(engine: Arc<dyn TelephonyEngine>) -> ControlResult<()> {
//! let builder = Dispatcher::builder().engine_queue_capacity(512);
//! let (handle, inbox) = builder.engine_channel();
//! let dispatcher = builder.build(engine, inbox)?;
//! dispatcher.start()?;
//!
//! let snapshot = dispatcher.execute(Command::new("start", 1)).await?;
//! let account = dispatcher
//!     .execute(Command::new("account_create", 2).with("username", "alice").with("domain", "example.com"))
//!     .await?;
//! # let _ = (handle, snapshot, account);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::account::{AccountId, AccountManager, AccountSnapshot};
use crate::call::{Call, CallId, CallManager, CallOperation, CallSnapshot, InFlight};
use crate::command::{CallbackId, CallbackResult, Command, Request};
use crate::config::{CodecSettings, ControlConfig, NetworkConfig, ServiceConfig};
use crate::engine::{
    EngineAck, EngineFailure, EngineInbox, EngineMessage, EngineRequest, RequestToken, TelephonyEngine,
};
use crate::error::{ControlError, ControlResult};
use crate::events::{ControlEvent, EventEmitter, EventSubscription, ServiceSnapshot};
use crate::value::Value;

mod accounts;
mod builder;
mod calls;
mod controls;
mod engine_events;
mod service;

pub use builder::DispatcherBuilder;

/// How a submitted command was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Resolved before `submit` returned; the callback result is already out
    Completed,
    /// Waiting for the engine; the callback result follows later
    Parked,
}

/// Internal outcome of a handler
pub(crate) enum Step {
    Done(Value),
    Parked,
}

/// What to do once the engine answers a parked request
#[derive(Debug, Clone)]
pub(crate) enum Continuation {
    Start { config: ServiceConfig },
    ServiceConfig { config: ServiceConfig },
    Codecs { settings: CodecSettings },
    Network { config: NetworkConfig },
    StunServers { account_id: AccountId, servers: Vec<String> },
    Register { account_id: AccountId },
    Unregister { account_id: AccountId },
    Dial { call_id: CallId },
    Call { call_id: CallId, operation: CallOperation },
    TransferReplace { call_id: CallId, dest_call_id: CallId },
    Hangup { call_id: CallId },
    Mute { call_id: CallId, muted: bool },
    Dtmf { call_id: CallId },
    /// Request issued by the dispatcher itself, only logged
    Internal { what: &'static str },
}

struct Parked {
    callback_id: Option<CallbackId>,
    continuation: Continuation,
    deadline: Instant,
}

type Waiter = oneshot::Sender<ControlResult<Value>>;

/// Runtime state of the service itself
#[derive(Debug, Clone)]
struct ServiceState {
    config: ServiceConfig,
    codecs: CodecSettings,
    network: NetworkConfig,
    started: bool,
    connectivity: bool,
}

/// Routes commands and engine messages to the account and call tables
pub struct Dispatcher {
    config: ControlConfig,
    accounts: AccountManager,
    calls: CallManager,
    engine: Arc<dyn TelephonyEngine>,
    emitter: EventEmitter,
    parked: DashMap<RequestToken, Parked>,
    /// Callback ids not yet resolved, with an optional waiter from `execute`
    in_flight: DashMap<CallbackId, Option<Waiter>>,
    next_token: AtomicU64,
    service: RwLock<ServiceState>,
    inbox: SyncMutex<Option<EngineInbox>>,
    loop_task: SyncMutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("accounts", &self.accounts.len())
            .field("calls", &self.calls.len())
            .field("parked", &self.parked.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub(crate) fn new(config: ControlConfig, engine: Arc<dyn TelephonyEngine>, inbox: EngineInbox) -> Self {
        let service = ServiceState {
            config: config.service.clone(),
            codecs: CodecSettings::default(),
            network: NetworkConfig::default(),
            started: false,
            connectivity: true,
        };
        Self {
            accounts: AccountManager::new(config.id_grace_period()),
            calls: CallManager::new(),
            emitter: EventEmitter::new(config.event_channel_capacity),
            engine,
            parked: DashMap::new(),
            in_flight: DashMap::new(),
            next_token: AtomicU64::new(1),
            service: RwLock::new(service),
            inbox: SyncMutex::new(Some(inbox)),
            loop_task: SyncMutex::new(None),
            running: AtomicBool::new(false),
            config,
        }
    }

    // ===== Lifecycle =====

    /// Spawn the loop that drains the engine inbox and runs the sweep
    pub fn start(self: &Arc<Self>) -> ControlResult<()> {
        let inbox = self
            .inbox
            .lock()
            .take()
            .ok_or_else(|| ControlError::invalid_state("dispatcher", "start", "running"))?;

        let dispatcher = Arc::clone(self);
        let task = tokio::spawn(async move { dispatcher.run(inbox).await });
        *self.loop_task.lock() = Some(task);
        self.running.store(true, Ordering::SeqCst);
        info!("Dispatcher started");
        Ok(())
    }

    /// Stop the loop and fail everything still parked
    pub async fn stop(&self) {
        let task = self.loop_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.running.store(false, Ordering::SeqCst);

        // expiring a dial parks the hangup that cancels it
        loop {
            let tokens: Vec<RequestToken> = self.parked.iter().map(|entry| *entry.key()).collect();
            if tokens.is_empty() {
                break;
            }
            for token in tokens {
                self.expire(token, EngineFailure::new(503, "dispatcher stopped")).await;
            }
        }
        info!("Dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>, mut inbox: EngineInbox) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => self.process_engine_message(message).await,
                    None => {
                        error!("Engine inbox closed, dispatcher loop exiting");
                        break;
                    }
                },
                _ = sweep.tick() => self.sweep().await,
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Fail parked commands past their deadline and prune old terminated calls
    pub async fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<RequestToken> = self
            .parked
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();
        for token in expired {
            warn!(token, "Engine did not answer in time");
            self.expire(token, EngineFailure::timeout()).await;
        }

        let pruned = self.calls.prune(self.config.terminated_retention(), now);
        if !pruned.is_empty() {
            debug!(calls = ?pruned, "Pruned terminated calls");
        }
    }

    /// Apply one message from the engine inbox
    pub async fn process_engine_message(&self, message: EngineMessage) {
        match message {
            EngineMessage::Completion { token, outcome } => self.resume(token, outcome).await,
            EngineMessage::Notification(notification) => self.handle_notification(notification).await,
        }
    }

    // ===== Commands =====

    /// Accept a command. The callback result is emitted as an event.
    ///
    /// Returns the error directly as well when the command is rejected or
    /// fails before `submit` returns. A callback id that is still in flight is
    /// refused without emitting anything.
    pub async fn submit(&self, command: Command) -> ControlResult<Submission> {
        self.submit_with(command, None).await
    }

    /// Submit a command and wait for its callback result
    pub async fn execute(&self, command: Command) -> ControlResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.submit_with(command, Some(tx)).await?;
        rx.await
            .map_err(|_| ControlError::engine_failure(500, "command dropped before completion"))?
    }

    async fn submit_with(&self, command: Command, waiter: Option<Waiter>) -> ControlResult<Submission> {
        let callback_id = command.callback_id;
        match self.in_flight.entry(callback_id) {
            Entry::Occupied(_) => {
                warn!(callback_id, action = %command.action, "Callback id already in flight");
                return Err(ControlError::invalid_argument(
                    "callbackId",
                    format!("{} is already in flight", callback_id),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(waiter);
            }
        }

        debug!(callback_id, action = %command.action, "Dispatching command");
        let outcome = match command.parse() {
            Ok(request) => self.route(callback_id, request).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Step::Done(value)) => {
                self.complete(callback_id, Ok(value));
                Ok(Submission::Completed)
            }
            Ok(Step::Parked) => Ok(Submission::Parked),
            Err(e) => {
                self.complete(callback_id, Err(e.clone()));
                Err(e)
            }
        }
    }

    async fn route(&self, callback_id: CallbackId, request: Request) -> ControlResult<Step> {
        match request {
            Request::Start { service } => self.start_service(callback_id, &service).await,
            Request::SetServiceConfiguration { service } => self.set_service_configuration(callback_id, &service).await,
            Request::ChangeCodecSettings { settings } => self.change_codec_settings(callback_id, settings).await,
            Request::ChangeNetworkConfiguration { configuration } => {
                self.change_network_configuration(callback_id, &configuration).await
            }
            Request::CreateAccount { config } => self.create_account(config),
            Request::RegisterAccount { account_id, renew } => {
                self.register_account(callback_id, account_id, renew).await
            }
            Request::DeleteAccount { account_id } => self.delete_account(callback_id, account_id).await,
            Request::UpdateStunServers { account_id, servers } => {
                self.update_stun_servers(callback_id, account_id, servers).await
            }
            Request::MakeCall {
                account_id,
                destination,
                settings,
                message,
            } => self.make_call(callback_id, account_id, &destination, settings, message).await,
            Request::Answer { call_id } => self.answer_call(callback_id, call_id).await,
            Request::Decline { call_id } => self.hangup_call(callback_id, call_id, Some(603)).await,
            Request::Hangup { call_id } => self.hangup_call(callback_id, call_id, None).await,
            Request::Ringing { call_id } => self.send_ringing(callback_id, call_id).await,
            Request::Progress { call_id } => self.send_progress(callback_id, call_id).await,
            Request::Hold { call_id } => self.hold_call(callback_id, call_id).await,
            Request::Unhold { call_id } => self.resume_call(callback_id, call_id).await,
            Request::Mute { call_id, muted } => self.set_muted(callback_id, call_id, muted).await,
            Request::Speaker { call_id, speaker } => self.set_speaker(call_id, speaker).await,
            Request::Transfer { call_id, destination } => self.transfer_call(callback_id, call_id, destination).await,
            Request::TransferReplace { call_id, dest_call_id } => {
                self.attended_transfer(callback_id, call_id, dest_call_id).await
            }
            Request::Redirect { call_id, destination } => self.redirect_call(callback_id, call_id, destination).await,
            Request::Dtmf { call_id, digits } => self.send_dtmf(callback_id, call_id, digits).await,
        }
    }

    /// Resolve a callback: emit its result and wake any `execute` waiter
    fn complete(&self, callback_id: CallbackId, result: ControlResult<Value>) {
        let waiter = self.in_flight.remove(&callback_id).and_then(|(_, waiter)| waiter);
        match &result {
            Ok(_) => debug!(callback_id, "Command completed"),
            Err(e) => warn!(callback_id, kind = e.kind(), category = e.category(), error = %e, "Command failed"),
        }
        self.emitter
            .emit(ControlEvent::CommandAcknowledged(CallbackResult::from_result(callback_id, &result)));
        if let Some(waiter) = waiter {
            // the caller may have stopped waiting
            let _ = waiter.send(result);
        }
    }

    // ===== Engine requests =====

    pub(crate) fn next_token(&self) -> RequestToken {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Record the continuation for `token`.
    ///
    /// Callers park while still holding the entity lock that guarded the
    /// request, so the entity never points at a token that is not parked.
    pub(crate) fn park(&self, token: RequestToken, callback_id: Option<CallbackId>, continuation: Continuation) {
        let deadline = Instant::now() + self.config.engine_timeout();
        self.parked.insert(
            token,
            Parked {
                callback_id,
                continuation,
                deadline,
            },
        );
    }

    /// Submit a parked request to the engine, running its continuation inline
    /// when the engine answers immediately
    pub(crate) async fn dispatch(&self, token: RequestToken, request: EngineRequest) -> ControlResult<Step> {
        let name = request.name();
        debug!(token, request = name, "Submitting engine request");

        let outcome = match self.engine.submit(token, request).await {
            Ok(EngineAck::Pending) => {
                debug!(token, request = name, "Waiting for engine completion");
                return Ok(Step::Parked);
            }
            Ok(EngineAck::Completed(value)) => Ok(value),
            Err(failure) => Err(failure),
        };

        match self.parked.remove(&token) {
            Some((_, parked)) => self.continue_with(token, parked.continuation, outcome).await.map(Step::Done),
            // resolved by the sweep or a pre-empting hangup in the meantime
            None => Ok(Step::Parked),
        }
    }

    /// Run the continuation parked under `token` and resolve its callback
    pub(crate) async fn resume(&self, token: RequestToken, outcome: Result<Value, EngineFailure>) {
        let Some((_, parked)) = self.parked.remove(&token) else {
            debug!(token, "Completion for a request that is no longer parked");
            return;
        };
        self.settle(token, parked, outcome).await;
    }

    /// Fail a parked request the engine never answered.
    ///
    /// The engine may still hold a dialog for an expired dial, so it is told
    /// to hang up once the call has been terminated locally.
    async fn expire(&self, token: RequestToken, failure: EngineFailure) {
        let Some((_, parked)) = self.parked.remove(&token) else {
            return;
        };
        let dial = match parked.continuation {
            Continuation::Dial { call_id } => Some(call_id),
            _ => None,
        };
        self.settle(token, parked, Err(failure)).await;
        if let Some(call_id) = dial {
            self.cancel_dial(call_id).await;
        }
    }

    async fn settle(&self, token: RequestToken, parked: Parked, outcome: Result<Value, EngineFailure>) {
        let result = self.continue_with(token, parked.continuation, outcome).await;
        match parked.callback_id {
            Some(callback_id) => self.complete(callback_id, result),
            None => {
                if let Err(e) = result {
                    warn!(token, error = %e, "Internal engine request failed");
                }
            }
        }
    }

    /// Send a request on the dispatcher's own behalf; failures are only logged
    pub(crate) async fn send_internal(&self, what: &'static str, request: EngineRequest) {
        let token = self.next_token();
        self.park(token, None, Continuation::Internal { what });
        if let Err(e) = self.dispatch(token, request).await {
            warn!(token, what, error = %e, "Internal engine request failed");
        }
    }

    /// Drop a parked command without running its continuation
    pub(crate) fn abandon(&self, token: RequestToken, error: ControlError) {
        if let Some((_, parked)) = self.parked.remove(&token) {
            debug!(token, error = %error, "Abandoning parked command");
            if let Some(callback_id) = parked.callback_id {
                self.complete(callback_id, Err(error));
            }
        }
    }

    async fn continue_with(
        &self,
        token: RequestToken,
        continuation: Continuation,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        match continuation {
            Continuation::Start { config } => self.finish_start(config, outcome).await,
            Continuation::ServiceConfig { config } => self.finish_service_configuration(config, outcome),
            Continuation::Codecs { settings } => self.finish_codec_settings(settings, outcome),
            Continuation::Network { config } => self.finish_network_configuration(config, outcome),
            Continuation::StunServers { account_id, servers } => {
                self.finish_stun_servers(account_id, servers, outcome).await
            }
            Continuation::Register { account_id } => self.finish_registration(token, account_id, outcome).await,
            Continuation::Unregister { account_id } => Self::finish_unregister(account_id, outcome),
            Continuation::Dial { call_id } => self.finish_dial(token, call_id, outcome).await,
            Continuation::Call { call_id, operation } => {
                self.finish_call_operation(token, call_id, operation, outcome).await
            }
            Continuation::TransferReplace { call_id, dest_call_id } => {
                self.finish_attended_transfer(token, call_id, dest_call_id, outcome).await
            }
            Continuation::Hangup { call_id } => self.finish_hangup(token, call_id, outcome).await,
            Continuation::Mute { call_id, muted } => self.finish_mute(call_id, muted, outcome).await,
            Continuation::Dtmf { call_id } => outcome.map(|_| Value::from(call_id)).map_err(ControlError::from),
            Continuation::Internal { what } => {
                outcome.map_err(ControlError::from)?;
                debug!(token, what, "Internal engine request completed");
                Ok(Value::Null)
            }
        }
    }

    /// Settle whatever a teardown pushed out of a call's slot.
    ///
    /// A pre-empted hangup is satisfied by the termination; anything else
    /// resolves as a stale reference. For an attended transfer, the partner
    /// leg still holds the same token and is returned so the caller can release
    /// it once the current call lock is dropped.
    pub(crate) fn settle_preempted(&self, call: &Call, flight: InFlight) -> Option<(CallId, RequestToken)> {
        let partner = match flight.operation {
            CallOperation::TransferReplace { dest_call_id } => Some((dest_call_id, flight.token)),
            CallOperation::TransferTarget { call_id } => Some((call_id, flight.token)),
            _ => None,
        };
        if flight.operation == CallOperation::Hangup {
            if let Some((_, parked)) = self.parked.remove(&flight.token) {
                if let Some(callback_id) = parked.callback_id {
                    self.complete(callback_id, Ok(Value::from_serialize(&call.snapshot())));
                }
            }
        } else {
            self.abandon(
                flight.token,
                ControlError::stale_call(call.id, format!("{} interrupted by call teardown", flight.operation.name())),
            );
        }
        partner
    }

    /// Free the partner leg of an interrupted attended transfer
    pub(crate) async fn release_partner(&self, partner: Option<(CallId, RequestToken)>) {
        let Some((call_id, token)) = partner else {
            return;
        };
        if let Ok(handle) = self.calls.get(call_id) {
            let mut call = handle.lock().await;
            if call.finish(token).is_some() {
                debug!(call_id, token, "Released transfer partner");
            }
        }
    }

    // ===== Events and queries =====

    pub(crate) fn emit(&self, event: ControlEvent) {
        self.emitter.emit(event);
    }

    pub(crate) fn emit_call_changed(&self, call: &Call) {
        self.emitter.emit(ControlEvent::CallChanged(call.snapshot()));
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControlEvent> {
        self.emitter.subscribe_events()
    }

    /// Register a handler; events reach it in emission order
    pub fn subscribe(&self, subscription: EventSubscription) -> Uuid {
        self.emitter.subscribe(subscription)
    }

    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        self.emitter.unsubscribe(subscription_id)
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub async fn account(&self, account_id: AccountId) -> ControlResult<AccountSnapshot> {
        let handle = self.accounts.get(account_id)?;
        let account = handle.lock().await;
        Ok(account.snapshot())
    }

    pub async fn list_accounts(&self) -> Vec<AccountSnapshot> {
        self.accounts.snapshots().await
    }

    pub async fn call(&self, call_id: CallId) -> ControlResult<CallSnapshot> {
        let handle = self.calls.get(call_id)?;
        let call = handle.lock().await;
        Ok(call.snapshot())
    }

    pub async fn list_calls(&self) -> Vec<CallSnapshot> {
        self.calls.snapshots().await
    }

    /// Non-terminated calls owned by an account
    pub fn active_call_ids(&self, account_id: AccountId) -> Vec<CallId> {
        self.calls.live_calls(account_id)
    }

    pub async fn service_snapshot(&self) -> ServiceSnapshot {
        let (settings, connectivity) = {
            let service = self.service.read();
            (service.config.clone(), service.connectivity)
        };
        ServiceSnapshot {
            accounts: self.accounts.snapshots().await,
            calls: self.calls.snapshots().await,
            settings,
            connectivity,
        }
    }

    pub fn is_service_started(&self) -> bool {
        self.service.read().started
    }

    pub fn codec_settings(&self) -> CodecSettings {
        self.service.read().codecs.clone()
    }

    pub fn network_config(&self) -> NetworkConfig {
        self.service.read().network.clone()
    }

    /// Commands waiting on the engine
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Commands whose callback has not been resolved yet
    pub fn pending_callbacks(&self) -> usize {
        self.in_flight.len()
    }
}
