//! Boundary toward the telephony engine
//!
//! The engine does the actual SIP signaling and media. The dispatcher talks to
//! it in two directions:
//!
//! - **Requests**: [`TelephonyEngine::submit`] takes a [`RequestToken`] and an
//!   [`EngineRequest`]. The engine either completes immediately
//!   ([`EngineAck::Completed`]) or promises a later completion
//!   ([`EngineAck::Pending`]).
//! - **Messages**: later completions and unsolicited notifications are pushed
//!   into the dispatcher's inbox through an [`EngineHandle`]. Completions carry
//!   the token of the request they finish.
//!
//! ```text
//! Dispatcher --submit(token, request)--> Engine
//!     ^                                    |
//!     +---- EngineInbox <-- EngineHandle --+  Completion { token, outcome }
//!                                             Notification(..)
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::account::{AccountId, RegistrationRequest};
use crate::call::{CallId, CallSettings, SipMessageData};
use crate::config::{CodecSettings, NetworkConfig, ServiceConfig};
use crate::value::Value;

/// Correlates an engine request with its completion
pub type RequestToken = u64;

/// Failure reported by the engine, passed through unchanged
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("engine failure {code}: {message}")]
pub struct EngineFailure {
    /// SIP-style status code
    pub code: u16,
    pub message: String,
}

impl EngineFailure {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Used when a parked request outlives the engine timeout
    pub fn timeout() -> Self {
        Self::new(408, "engine did not respond")
    }
}

/// Requests the dispatcher sends to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineRequest {
    Start { config: ServiceConfig },
    ApplyServiceConfig { config: ServiceConfig },
    SetCodecPriorities { settings: CodecSettings },
    ApplyNetworkConfig { config: NetworkConfig },
    UpdateStunServers { account_id: AccountId, servers: Vec<String> },
    Register {
        account_id: AccountId,
        registration: RegistrationRequest,
        renew: bool,
    },
    Unregister { account_id: AccountId },
    MakeCall {
        call_id: CallId,
        account_id: AccountId,
        sip_call_id: String,
        destination: String,
        settings: CallSettings,
        message: Option<SipMessageData>,
    },
    Answer { sip_call_id: String },
    /// Send 180 Ringing on an inbound call
    Ringing { sip_call_id: String },
    /// Send 183 Session Progress on an inbound call
    Progress { sip_call_id: String },
    /// BYE, CANCEL or a final rejection, depending on dialog state
    Hangup { sip_call_id: String, status_code: Option<u16> },
    Hold { sip_call_id: String },
    Unhold { sip_call_id: String },
    Mute { sip_call_id: String, muted: bool },
    Transfer { sip_call_id: String, destination: String },
    TransferReplace { sip_call_id: String, replaces_sip_call_id: String },
    Redirect { sip_call_id: String, destination: String },
    SendDtmf { sip_call_id: String, digits: String },
}

impl EngineRequest {
    pub fn name(&self) -> &'static str {
        match self {
            EngineRequest::Start { .. } => "start",
            EngineRequest::ApplyServiceConfig { .. } => "apply-service-config",
            EngineRequest::SetCodecPriorities { .. } => "set-codec-priorities",
            EngineRequest::ApplyNetworkConfig { .. } => "apply-network-config",
            EngineRequest::UpdateStunServers { .. } => "update-stun-servers",
            EngineRequest::Register { .. } => "register",
            EngineRequest::Unregister { .. } => "unregister",
            EngineRequest::MakeCall { .. } => "make-call",
            EngineRequest::Answer { .. } => "answer",
            EngineRequest::Ringing { .. } => "ringing",
            EngineRequest::Progress { .. } => "progress",
            EngineRequest::Hangup { .. } => "hangup",
            EngineRequest::Hold { .. } => "hold",
            EngineRequest::Unhold { .. } => "unhold",
            EngineRequest::Mute { .. } => "mute",
            EngineRequest::Transfer { .. } => "transfer",
            EngineRequest::TransferReplace { .. } => "transfer-replace",
            EngineRequest::Redirect { .. } => "redirect",
            EngineRequest::SendDtmf { .. } => "send-dtmf",
        }
    }
}

/// Immediate answer to a submitted request
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAck {
    /// Done, with the engine's result payload
    Completed(Value),
    /// A `Completion` carrying the same token will arrive through the inbox
    Pending,
}

/// The external SIP signaling engine
#[async_trait]
pub trait TelephonyEngine: Send + Sync {
    /// Hand a request to the engine. Must not block waiting for the network.
    async fn submit(&self, token: RequestToken, request: EngineRequest) -> Result<EngineAck, EngineFailure>;
}

/// Remote progress reported for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallProgress {
    /// 180 received
    Ringing,
    /// 183 with early media
    Early,
    /// 200 OK, media flowing
    Connected,
}

/// A SIP MESSAGE delivered to an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantMessage {
    pub from: String,
    pub to: String,
    pub body: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl InstantMessage {
    pub fn text(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            body: body.into(),
            content_type: "text/plain".to_string(),
            headers: BTreeMap::new(),
        }
    }
}

/// Unsolicited engine events
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotification {
    /// Registration refreshed, expired or failed outside any command
    RegistrationChanged {
        account_id: AccountId,
        code: u16,
        reason: String,
        expires: Option<u32>,
        retry_after: Option<u32>,
    },
    IncomingCall {
        account_id: AccountId,
        sip_call_id: String,
        remote_uri: String,
        local_uri: Option<String>,
    },
    CallProgress {
        sip_call_id: String,
        progress: CallProgress,
        code: u16,
        reason: String,
    },
    CallDisconnected {
        sip_call_id: String,
        code: u16,
        reason: String,
    },
    MessageReceived {
        account_id: AccountId,
        message: InstantMessage,
    },
    ConnectivityChanged { available: bool },
}

/// Everything the engine can push into the dispatcher inbox
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    Completion {
        token: RequestToken,
        outcome: Result<Value, EngineFailure>,
    },
    Notification(EngineNotification),
}

/// The dispatcher inbox is gone
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("dispatcher inbox is closed")]
pub struct InboxClosed;

/// Sending side of the dispatcher inbox, held by the engine
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineMessage>,
}

impl EngineHandle {
    pub async fn send(&self, message: EngineMessage) -> Result<(), InboxClosed> {
        self.tx.send(message).await.map_err(|_| InboxClosed)
    }

    /// Finish a request that was answered with [`EngineAck::Pending`]
    pub async fn complete(&self, token: RequestToken, outcome: Result<Value, EngineFailure>) -> Result<(), InboxClosed> {
        self.send(EngineMessage::Completion { token, outcome }).await
    }

    pub async fn notify(&self, notification: EngineNotification) -> Result<(), InboxClosed> {
        self.send(EngineMessage::Notification(notification)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Messages the inbox buffers before `send` waits
    pub fn max_capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Receiving side of the dispatcher inbox
#[derive(Debug)]
pub struct EngineInbox {
    rx: mpsc::Receiver<EngineMessage>,
}

impl EngineInbox {
    pub async fn recv(&mut self) -> Option<EngineMessage> {
        self.rx.recv().await
    }
}

/// Create a bounded engine inbox
pub fn channel(capacity: usize) -> (EngineHandle, EngineInbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EngineHandle { tx }, EngineInbox { rx })
}
