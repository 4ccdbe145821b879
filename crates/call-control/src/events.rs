//! Event handling for call-control operations
//!
//! Internal transitions become [`ControlEvent`]s, delivered two ways:
//!
//! - a `tokio::sync::broadcast` channel (see [`EventEmitter::subscribe_events`])
//! - [`ControlEventHandler`] subscriptions with an [`EventFilter`], fed by a
//!   single delivery task
//!
//! Events are emitted while the lock of the entity that changed is held, and
//! both paths preserve emission order, so notifications for one call arrive in
//! the order their transitions happened.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::account::{AccountId, AccountSnapshot};
use crate::call::{CallId, CallSnapshot};
use crate::command::CallbackResult;
use crate::config::ServiceConfig;
use crate::engine::InstantMessage;

/// What `start` reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub accounts: Vec<AccountSnapshot>,
    pub calls: Vec<CallSnapshot>,
    pub settings: ServiceConfig,
    pub connectivity: bool,
}

/// Links a transferred call to where it went
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLink {
    pub call: CallSnapshot,
    pub destination: String,
    /// Consultation call replaced by an attended transfer
    pub replaced_call_id: Option<CallId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    pub account_id: AccountId,
    #[serde(flatten)]
    pub message: InstantMessage,
}

/// Notifications for the UI layer, serialized as `{type, payload}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ControlEvent {
    ServiceStarted(ServiceSnapshot),
    AccountCreated(AccountSnapshot),
    RegistrationChanged(AccountSnapshot),
    CallChanged(CallSnapshot),
    CallTerminated(CallSnapshot),
    CallReceived(CallSnapshot),
    CallTransferred(TransferLink),
    MessageReceived(MessageInfo),
    ConnectivityChanged { available: bool },
    CommandAcknowledged(CallbackResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServiceStarted,
    AccountCreated,
    RegistrationChanged,
    CallChanged,
    CallTerminated,
    CallReceived,
    CallTransferred,
    MessageReceived,
    ConnectivityChanged,
    CommandAcknowledged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ServiceStarted => "service-started",
            EventKind::AccountCreated => "account-created",
            EventKind::RegistrationChanged => "registration-changed",
            EventKind::CallChanged => "call-changed",
            EventKind::CallTerminated => "call-terminated",
            EventKind::CallReceived => "call-received",
            EventKind::CallTransferred => "call-transferred",
            EventKind::MessageReceived => "message-received",
            EventKind::ConnectivityChanged => "connectivity-changed",
            EventKind::CommandAcknowledged => "command-acknowledged",
        }
    }
}

impl ControlEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ControlEvent::ServiceStarted(_) => EventKind::ServiceStarted,
            ControlEvent::AccountCreated(_) => EventKind::AccountCreated,
            ControlEvent::RegistrationChanged(_) => EventKind::RegistrationChanged,
            ControlEvent::CallChanged(_) => EventKind::CallChanged,
            ControlEvent::CallTerminated(_) => EventKind::CallTerminated,
            ControlEvent::CallReceived(_) => EventKind::CallReceived,
            ControlEvent::CallTransferred(_) => EventKind::CallTransferred,
            ControlEvent::MessageReceived(_) => EventKind::MessageReceived,
            ControlEvent::ConnectivityChanged { .. } => EventKind::ConnectivityChanged,
            ControlEvent::CommandAcknowledged(_) => EventKind::CommandAcknowledged,
        }
    }

    /// Call this event is about, if any
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            ControlEvent::CallChanged(call) | ControlEvent::CallTerminated(call) | ControlEvent::CallReceived(call) => {
                Some(call.id)
            }
            ControlEvent::CallTransferred(link) => Some(link.call.id),
            _ => None,
        }
    }

    /// Account this event is about, if any
    pub fn account_id(&self) -> Option<AccountId> {
        match self {
            ControlEvent::AccountCreated(account) | ControlEvent::RegistrationChanged(account) => Some(account.id),
            ControlEvent::CallChanged(call) | ControlEvent::CallTerminated(call) | ControlEvent::CallReceived(call) => {
                Some(call.account_id)
            }
            ControlEvent::CallTransferred(link) => Some(link.call.account_id),
            ControlEvent::MessageReceived(info) => Some(info.account_id),
            _ => None,
        }
    }

    pub fn passes_filter(&self, filter: &EventFilter) -> bool {
        if let Some(kinds) = &filter.kinds {
            if !kinds.contains(&self.kind()) {
                return false;
            }
        }
        if let Some(call_ids) = &filter.call_ids {
            match self.call_id() {
                Some(id) if call_ids.contains(&id) => {}
                _ => return false,
            }
        }
        if let Some(account_ids) = &filter.account_ids {
            match self.account_id() {
                Some(id) if account_ids.contains(&id) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Restricts which events a subscription receives. `None` means no restriction.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kinds: Option<HashSet<EventKind>>,
    pub call_ids: Option<HashSet<CallId>>,
    pub account_ids: Option<HashSet<AccountId>>,
}

impl EventFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn call(call_id: CallId) -> Self {
        Self {
            call_ids: Some(HashSet::from([call_id])),
            ..Default::default()
        }
    }

    pub fn account(account_id: AccountId) -> Self {
        Self {
            account_ids: Some(HashSet::from([account_id])),
            ..Default::default()
        }
    }
}

/// Receives events from the emitter. Every method has a no-op default.
#[async_trait]
pub trait ControlEventHandler: Send + Sync {
    async fn on_service_started(&self, _snapshot: ServiceSnapshot) {}

    async fn on_account_created(&self, _account: AccountSnapshot) {}

    async fn on_registration_changed(&self, _account: AccountSnapshot) {}

    async fn on_call_changed(&self, _call: CallSnapshot) {}

    async fn on_call_terminated(&self, _call: CallSnapshot) {}

    async fn on_call_received(&self, _call: CallSnapshot) {}

    async fn on_call_transferred(&self, _link: TransferLink) {}

    async fn on_message_received(&self, _message: MessageInfo) {}

    async fn on_connectivity_changed(&self, _available: bool) {}

    async fn on_command_acknowledged(&self, _result: CallbackResult) {}

    /// Route an event to the matching method
    async fn on_event(&self, event: ControlEvent) {
        match event {
            ControlEvent::ServiceStarted(snapshot) => self.on_service_started(snapshot).await,
            ControlEvent::AccountCreated(account) => self.on_account_created(account).await,
            ControlEvent::RegistrationChanged(account) => self.on_registration_changed(account).await,
            ControlEvent::CallChanged(call) => self.on_call_changed(call).await,
            ControlEvent::CallTerminated(call) => self.on_call_terminated(call).await,
            ControlEvent::CallReceived(call) => self.on_call_received(call).await,
            ControlEvent::CallTransferred(link) => self.on_call_transferred(link).await,
            ControlEvent::MessageReceived(message) => self.on_message_received(message).await,
            ControlEvent::ConnectivityChanged { available } => self.on_connectivity_changed(available).await,
            ControlEvent::CommandAcknowledged(result) => self.on_command_acknowledged(result).await,
        }
    }
}

/// A handler plus the filter deciding what it gets
#[derive(Clone)]
pub struct EventSubscription {
    handler: Arc<dyn ControlEventHandler>,
    filter: EventFilter,
    id: Uuid,
}

impl EventSubscription {
    pub fn new(handler: Arc<dyn ControlEventHandler>, filter: EventFilter) -> Self {
        Self {
            handler,
            filter,
            id: Uuid::new_v4(),
        }
    }

    pub fn all_events(handler: Arc<dyn ControlEventHandler>) -> Self {
        Self::new(handler, EventFilter::default())
    }

    pub fn call_events(handler: Arc<dyn ControlEventHandler>, call_id: CallId) -> Self {
        Self::new(handler, EventFilter::call(call_id))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn should_receive(&self, event: &ControlEvent) -> bool {
        event.passes_filter(&self.filter)
    }

    pub async fn deliver_event(&self, event: ControlEvent) {
        if self.should_receive(&event) {
            self.handler.on_event(event).await;
        }
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .finish()
    }
}

/// Fan-out point for control events
pub struct EventEmitter {
    broadcast_tx: broadcast::Sender<ControlEvent>,
    subscriptions: Arc<RwLock<Vec<EventSubscription>>>,
    delivery_tx: Mutex<Option<mpsc::UnboundedSender<ControlEvent>>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            broadcast_tx,
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            delivery_tx: Mutex::new(None),
        }
    }

    /// Receive every event from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<ControlEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Register a handler subscription.
    ///
    /// Starts the delivery task on first use, so this must run inside a Tokio runtime.
    pub fn subscribe(&self, subscription: EventSubscription) -> Uuid {
        let id = subscription.id();
        self.subscriptions.write().push(subscription);

        let mut delivery = self.delivery_tx.lock();
        if delivery.as_ref().map_or(true, |tx| tx.is_closed()) {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(Self::deliver(self.subscriptions.clone(), rx));
            *delivery = Some(tx);
        }
        id
    }

    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id() != subscription_id);
        subscriptions.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Publish an event. Never blocks.
    pub fn emit(&self, event: ControlEvent) {
        tracing::debug!(event = event.kind().as_str(), call_id = ?event.call_id(), "Emitting event");

        if let Some(tx) = self.delivery_tx.lock().as_ref() {
            if tx.send(event.clone()).is_err() {
                tracing::warn!("Event delivery task has stopped");
            }
        }
        // An error here only means nobody is listening right now
        let _ = self.broadcast_tx.send(event);
    }

    async fn deliver(subscriptions: Arc<RwLock<Vec<EventSubscription>>>, mut rx: mpsc::UnboundedReceiver<ControlEvent>) {
        while let Some(event) = rx.recv().await {
            let targets: Vec<EventSubscription> = subscriptions
                .read()
                .iter()
                .filter(|s| s.should_receive(&event))
                .cloned()
                .collect();
            for subscription in targets {
                subscription.deliver_event(event.clone()).await;
            }
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}
