//! Call state machine and the call table
//!
//! ```text
//! Initiating -> Ringing -> Early -> Connected <-> Holding
//!      |           |         |          |            |
//!      +-----------+---------+----------+------------+--> Disconnecting -> Terminated
//! ```
//!
//! Inbound calls start in `Ringing`. All guards live on [`Call`] and reject
//! before mutating anything. Operations that wait on the engine occupy the
//! call's single in-flight slot, so a second state-changing command on the same
//! call is rejected until the first one resolves. Hangup and decline pre-empt
//! whatever is in the slot.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::account::AccountId;
use crate::engine::{CallProgress, RequestToken};
use crate::error::{ControlError, ControlResult};
use crate::value::{PayloadFields, Value};

pub type CallId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Outbound INVITE being set up
    Initiating,
    Ringing,
    /// Early media (183)
    Early,
    Connected,
    /// Connected, media on hold
    Holding,
    /// Teardown sent, waiting for the engine
    Disconnecting,
    Terminated,
}

impl CallState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, CallState::Terminated)
    }

    /// Connected or on hold
    pub fn is_active(&self) -> bool {
        matches!(self, CallState::Connected | CallState::Holding)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Initiating => "Initiating",
            CallState::Ringing => "Ringing",
            CallState::Early => "Early",
            CallState::Connected => "Connected",
            CallState::Holding => "Holding",
            CallState::Disconnecting => "Disconnecting",
            CallState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Media settings for an outbound call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSettings {
    pub audio_count: u32,
    pub video_count: u32,
    pub flag: u32,
    pub request_keyframe_method: u32,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            audio_count: 1,
            video_count: 0,
            flag: 0,
            request_keyframe_method: 0,
        }
    }
}

impl CallSettings {
    pub fn from_payload(settings: &BTreeMap<String, Value>) -> ControlResult<Self> {
        let read = |key: &str, default: u32| -> ControlResult<u32> {
            match settings.opt_i64(key)? {
                None => Ok(default),
                Some(raw) => u32::try_from(raw)
                    .map_err(|_| ControlError::invalid_argument(format!("call_settings.{}", key), "must be non-negative")),
            }
        };
        let defaults = Self::default();
        let parsed = Self {
            audio_count: read("audioCount", defaults.audio_count)?,
            video_count: read("videoCount", defaults.video_count)?,
            flag: read("flag", defaults.flag)?,
            request_keyframe_method: read("requestKeyframeMethod", defaults.request_keyframe_method)?,
        };
        if parsed.audio_count == 0 && parsed.video_count == 0 {
            return Err(ControlError::invalid_argument("call_settings", "a call needs at least one media stream"));
        }
        Ok(parsed)
    }
}

/// Extra headers and body for the initial INVITE
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SipMessageData {
    pub headers: BTreeMap<String, String>,
    pub content_type: Option<String>,
    pub body: Option<String>,
}

impl SipMessageData {
    pub fn from_payload(data: &BTreeMap<String, Value>) -> ControlResult<Self> {
        Ok(Self {
            headers: data.opt_string_map("headers")?.unwrap_or_default(),
            content_type: data.opt_text("contentType")?,
            body: data.opt_str("msgBody")?.map(str::to_string),
        })
    }
}

/// What is occupying a call's in-flight slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOperation {
    Dial,
    Answer,
    Ringing,
    Progress,
    Hold,
    Unhold,
    Transfer { destination: String },
    TransferReplace { dest_call_id: CallId },
    /// This call is the consultation leg of an attended transfer
    TransferTarget { call_id: CallId },
    Redirect { destination: String },
    Hangup,
}

impl CallOperation {
    pub fn name(&self) -> &'static str {
        match self {
            CallOperation::Dial => "dial",
            CallOperation::Answer => "answer",
            CallOperation::Ringing => "ringing",
            CallOperation::Progress => "progress",
            CallOperation::Hold => "hold",
            CallOperation::Unhold => "unhold",
            CallOperation::Transfer { .. } => "transfer",
            CallOperation::TransferReplace { .. } => "transfer-replace",
            CallOperation::TransferTarget { .. } => "transfer-target",
            CallOperation::Redirect { .. } => "redirect",
            CallOperation::Hangup => "hangup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub operation: CallOperation,
    pub token: RequestToken,
}

/// Outcome of a hangup/decline guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HangupStep {
    /// Already terminated; succeed without any event
    AlreadyTerminated,
    /// Moved to Disconnecting; carries whatever was pre-empted
    Proceed { preempted: Option<InFlight> },
}

#[derive(Debug, Clone)]
pub struct Call {
    pub id: CallId,
    pub account_id: AccountId,
    /// SIP Call-ID used to address the dialog in the engine
    pub sip_call_id: String,
    pub direction: CallDirection,
    pub local_uri: String,
    pub remote_uri: String,
    pub state: CallState,
    pub settings: CallSettings,
    pub muted: bool,
    pub speaker: bool,
    pub last_status_code: Option<u16>,
    pub last_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub in_flight: Option<InFlight>,
}

impl Call {
    pub fn outgoing(
        id: CallId,
        account_id: AccountId,
        sip_call_id: String,
        local_uri: String,
        destination: String,
        settings: CallSettings,
    ) -> Self {
        Self::new(id, account_id, sip_call_id, CallDirection::Outgoing, local_uri, destination, CallState::Initiating, settings)
    }

    pub fn incoming(id: CallId, account_id: AccountId, sip_call_id: String, local_uri: String, remote_uri: String) -> Self {
        Self::new(
            id,
            account_id,
            sip_call_id,
            CallDirection::Incoming,
            local_uri,
            remote_uri,
            CallState::Ringing,
            CallSettings::default(),
        )
    }

    fn new(
        id: CallId,
        account_id: AccountId,
        sip_call_id: String,
        direction: CallDirection,
        local_uri: String,
        remote_uri: String,
        state: CallState,
        settings: CallSettings,
    ) -> Self {
        Self {
            id,
            account_id,
            sip_call_id,
            direction,
            local_uri,
            remote_uri,
            state,
            settings,
            muted: false,
            speaker: false,
            last_status_code: None,
            last_reason: None,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            in_flight: None,
        }
    }

    pub fn is_on_hold(&self) -> bool {
        self.state == CallState::Holding
    }

    fn reject(&self, operation: &str) -> ControlError {
        let state = match &self.in_flight {
            Some(flight) => format!("{} ({} pending)", self.state, flight.operation.name()),
            None => self.state.to_string(),
        };
        ControlError::invalid_state(format!("call {}", self.id), operation, state)
    }

    /// Guard an operation and take the in-flight slot for it.
    ///
    /// On error nothing is mutated.
    pub fn begin(&mut self, operation: CallOperation, token: RequestToken) -> ControlResult<()> {
        let allowed = match &operation {
            CallOperation::Dial => self.state == CallState::Initiating,
            CallOperation::Answer => matches!(self.state, CallState::Ringing | CallState::Early),
            CallOperation::Ringing => self.direction == CallDirection::Incoming && self.state == CallState::Ringing,
            CallOperation::Progress => {
                self.direction == CallDirection::Incoming && matches!(self.state, CallState::Ringing | CallState::Early)
            }
            CallOperation::Hold => self.state == CallState::Connected,
            CallOperation::Unhold => self.state == CallState::Holding,
            CallOperation::Transfer { .. } | CallOperation::TransferReplace { .. } | CallOperation::Redirect { .. } => {
                self.state == CallState::Connected
            }
            CallOperation::TransferTarget { .. } => self.state.is_active(),
            CallOperation::Hangup => !matches!(self.state, CallState::Disconnecting | CallState::Terminated),
        };
        if !allowed || self.in_flight.is_some() {
            return Err(self.reject(operation.name()));
        }
        self.in_flight = Some(InFlight { operation, token });
        Ok(())
    }

    /// Guard for attribute flips (mute, speaker)
    pub fn ensure_not_terminal(&self, operation: &str) -> ControlResult<()> {
        if matches!(self.state, CallState::Disconnecting | CallState::Terminated) {
            return Err(self.reject(operation));
        }
        Ok(())
    }

    /// Guard for DTMF, which needs an established call but no slot
    pub fn ensure_connected(&self, operation: &str) -> ControlResult<()> {
        if self.state != CallState::Connected {
            return Err(self.reject(operation));
        }
        Ok(())
    }

    /// Guard hangup/decline. Terminated is idempotent success, a second
    /// teardown while one is in flight is a stale reference.
    pub fn begin_hangup(&mut self, token: RequestToken) -> ControlResult<HangupStep> {
        match self.state {
            CallState::Terminated => Ok(HangupStep::AlreadyTerminated),
            CallState::Disconnecting => Err(ControlError::stale_call(self.id, "teardown already in progress")),
            _ => {
                let preempted = self.in_flight.take();
                self.in_flight = Some(InFlight {
                    operation: CallOperation::Hangup,
                    token,
                });
                self.set_state(CallState::Disconnecting);
                Ok(HangupStep::Proceed { preempted })
            }
        }
    }

    /// Release the slot if `token` still owns it
    pub fn finish(&mut self, token: RequestToken) -> Option<InFlight> {
        if self.in_flight.as_ref().map(|f| f.token) == Some(token) {
            self.in_flight.take()
        } else {
            None
        }
    }

    /// Set the primary state, returning the previous one
    pub fn set_state(&mut self, state: CallState) -> CallState {
        let previous = self.state;
        self.state = state;
        match state {
            CallState::Connected if self.connected_at.is_none() => self.connected_at = Some(Utc::now()),
            CallState::Terminated => self.ended_at = Some(Utc::now()),
            _ => {}
        }
        previous
    }

    /// Force Terminated, returning any operation that was still pending
    pub fn terminate(&mut self, code: Option<u16>, reason: Option<String>) -> Option<InFlight> {
        if code.is_some() {
            self.last_status_code = code;
        }
        if reason.is_some() {
            self.last_reason = reason;
        }
        self.set_state(CallState::Terminated);
        self.in_flight.take()
    }

    /// Apply remote progress from the engine. Returns false when it does not
    /// move the call forward.
    pub fn apply_progress(&mut self, progress: CallProgress, code: u16, reason: &str) -> bool {
        let next = match (progress, self.state) {
            (CallProgress::Ringing, CallState::Initiating) => CallState::Ringing,
            (CallProgress::Early, CallState::Initiating | CallState::Ringing) => CallState::Early,
            (CallProgress::Connected, CallState::Initiating | CallState::Ringing | CallState::Early) => {
                CallState::Connected
            }
            _ => return false,
        };
        self.last_status_code = Some(code);
        self.last_reason = Some(reason.to_string());
        self.set_state(next);
        true
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let now = Utc::now();
        let end = self.ended_at.unwrap_or(now);
        let connect_duration = self
            .connected_at
            .map(|at| (end - at).num_seconds().max(0))
            .unwrap_or(0);
        CallSnapshot {
            id: self.id,
            sip_call_id: self.sip_call_id.clone(),
            account_id: self.account_id,
            direction: self.direction,
            local_uri: self.local_uri.clone(),
            remote_uri: self.remote_uri.clone(),
            state: self.state,
            state_text: self.state.to_string(),
            held: self.is_on_hold(),
            muted: self.muted,
            speaker: self.speaker,
            connect_duration: connect_duration as u64,
            total_duration: (end - self.created_at).num_seconds().max(0) as u64,
            last_status_code: self.last_status_code,
            last_reason: self.last_reason.clone(),
        }
    }
}

/// Serializable view of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub id: CallId,
    pub sip_call_id: String,
    pub account_id: AccountId,
    pub direction: CallDirection,
    pub local_uri: String,
    pub remote_uri: String,
    pub state: CallState,
    pub state_text: String,
    pub held: bool,
    pub muted: bool,
    pub speaker: bool,
    pub connect_duration: u64,
    pub total_duration: u64,
    pub last_status_code: Option<u16>,
    pub last_reason: Option<String>,
}

/// Owns the call table and its indexes
#[derive(Debug)]
pub struct CallManager {
    calls: DashMap<CallId, Arc<Mutex<Call>>>,
    by_sip_call_id: DashMap<String, CallId>,
    live_by_account: DashMap<AccountId, HashSet<CallId>>,
    terminated_at: DashMap<CallId, Instant>,
    next_id: AtomicU32,
}

impl CallManager {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            by_sip_call_id: DashMap::new(),
            live_by_account: DashMap::new(),
            terminated_at: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn allocate_id(&self) -> CallId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fresh SIP Call-ID for an outbound dialog
    pub fn generate_sip_call_id() -> String {
        format!("{}@rvoip-call-control", uuid::Uuid::new_v4().simple())
    }

    /// Add a call to the table, returning it already locked so the caller
    /// emits its first event before anyone else can touch it
    pub async fn insert(&self, call: Call) -> OwnedMutexGuard<Call> {
        let id = call.id;
        let sip_call_id = call.sip_call_id.clone();
        let account_id = call.account_id;
        let handle = Arc::new(Mutex::new(call));
        let guard = handle.clone().lock_owned().await;

        self.by_sip_call_id.insert(sip_call_id, id);
        self.live_by_account.entry(account_id).or_default().insert(id);
        self.calls.insert(id, handle);
        guard
    }

    pub fn get(&self, call_id: CallId) -> ControlResult<Arc<Mutex<Call>>> {
        self.calls
            .get(&call_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ControlError::stale_call(call_id, "unknown or expired call"))
    }

    pub fn find_by_sip_call_id(&self, sip_call_id: &str) -> Option<(CallId, Arc<Mutex<Call>>)> {
        let id = *self.by_sip_call_id.get(sip_call_id)?.value();
        self.calls.get(&id).map(|entry| (id, entry.value().clone()))
    }

    /// Record that a call reached Terminated; it stays addressable until pruned
    pub fn mark_terminated(&self, call: &Call) {
        if let Some(mut live) = self.live_by_account.get_mut(&call.account_id) {
            live.remove(&call.id);
        }
        self.live_by_account.remove_if(&call.account_id, |_, live| live.is_empty());
        self.terminated_at.insert(call.id, Instant::now());
    }

    /// Non-terminal calls owned by the account
    pub fn live_count(&self, account_id: AccountId) -> usize {
        self.live_by_account.get(&account_id).map(|live| live.len()).unwrap_or(0)
    }

    pub fn live_calls(&self, account_id: AccountId) -> Vec<CallId> {
        let mut ids: Vec<_> = self
            .live_by_account
            .get(&account_id)
            .map(|live| live.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Drop terminated calls older than `retention`
    pub fn prune(&self, retention: Duration, now: Instant) -> Vec<CallId> {
        let expired: Vec<CallId> = self
            .terminated_at
            .iter()
            .filter(|entry| now.saturating_duration_since(*entry.value()) >= retention)
            .map(|entry| *entry.key())
            .collect();
        for id in &expired {
            self.terminated_at.remove(id);
            if let Some((_, handle)) = self.calls.remove(id) {
                if let Ok(call) = handle.try_lock() {
                    self.by_sip_call_id.remove(&call.sip_call_id);
                }
            }
        }
        self.by_sip_call_id.retain(|_, id| self.calls.contains_key(id));
        expired
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub async fn snapshots(&self) -> Vec<CallSnapshot> {
        let handles: Vec<_> = self.calls.iter().map(|entry| entry.value().clone()).collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.lock().await.snapshot());
        }
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }
}

impl Default for CallManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> Call {
        Call::outgoing(
            1,
            1,
            "abc@host".into(),
            "sip:alice@example.com".into(),
            "sip:+15551234@example.com".into(),
            CallSettings::default(),
        )
    }

    fn connected() -> Call {
        let mut call = outgoing();
        assert!(call.apply_progress(CallProgress::Connected, 200, "OK"));
        call
    }

    #[test]
    fn test_hold_from_initiating_is_rejected_without_mutation() {
        let mut call = outgoing();
        let err = call.begin(CallOperation::Hold, 1).unwrap_err();
        assert_eq!(err.kind(), "InvalidState");
        assert_eq!(call.state, CallState::Initiating);
        assert!(call.in_flight.is_none());
    }

    #[test]
    fn test_answer_only_from_ringing_or_early() {
        let mut call = outgoing();
        assert!(call.begin(CallOperation::Answer, 1).is_err());
        call.apply_progress(CallProgress::Ringing, 180, "Ringing");
        assert!(call.begin(CallOperation::Answer, 2).is_ok());

        // the slot is taken until the engine answers
        let err = call.begin(CallOperation::Answer, 3).unwrap_err();
        assert!(err.to_string().contains("answer pending"));
        assert_eq!(call.finish(2).map(|f| f.operation), Some(CallOperation::Answer));
        call.set_state(CallState::Connected);
        assert!(call.begin(CallOperation::Answer, 4).is_err());
    }

    #[test]
    fn test_ringing_and_progress_are_inbound_only() {
        let mut outbound = outgoing();
        outbound.apply_progress(CallProgress::Ringing, 180, "Ringing");
        assert!(outbound.begin(CallOperation::Progress, 1).is_err());

        let mut inbound = Call::incoming(2, 1, "in@host".into(), "sip:alice@example.com".into(), "sip:bob@example.com".into());
        assert_eq!(inbound.state, CallState::Ringing);
        assert!(inbound.begin(CallOperation::Ringing, 1).is_ok());
    }

    #[test]
    fn test_hangup_preempts_and_is_idempotent() {
        let mut call = connected();
        call.begin(CallOperation::Hold, 5).unwrap();

        let step = call.begin_hangup(6).unwrap();
        match step {
            HangupStep::Proceed { preempted } => assert_eq!(preempted.map(|f| f.token), Some(5)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(call.state, CallState::Disconnecting);

        let second = call.begin_hangup(7).unwrap_err();
        assert_eq!(second.kind(), "StaleReference");

        assert_eq!(call.finish(6).map(|f| f.operation), Some(CallOperation::Hangup));
        call.terminate(None, None);
        assert_eq!(call.begin_hangup(8).unwrap(), HangupStep::AlreadyTerminated);
        assert!(call.ended_at.is_some());
    }

    #[test]
    fn test_transfers_require_connected() {
        let mut call = connected();
        call.set_state(CallState::Holding);
        assert!(call.begin(CallOperation::Transfer { destination: "sip:c@x".into() }, 1).is_err());
        assert!(call.begin(CallOperation::TransferTarget { call_id: 9 }, 1).is_ok());
    }

    #[test]
    fn test_attribute_guards() {
        let mut call = outgoing();
        assert!(call.ensure_not_terminal("mute").is_ok());
        assert!(call.ensure_connected("dtmf").is_err());
        call.terminate(Some(487), Some("Request Terminated".into()));
        assert!(call.ensure_not_terminal("mute").is_err());
        assert_eq!(call.snapshot().last_status_code, Some(487));
    }

    #[test]
    fn test_progress_never_moves_backwards() {
        let mut call = connected();
        assert!(!call.apply_progress(CallProgress::Ringing, 180, "Ringing"));
        assert_eq!(call.state, CallState::Connected);
        assert!(call.connected_at.is_some());
    }

    #[test]
    fn test_settings_from_payload() {
        let map: BTreeMap<String, Value> = serde_json::from_str(r#"{"videoCount": 1}"#).unwrap();
        let settings = CallSettings::from_payload(&map).unwrap();
        assert_eq!(settings.audio_count, 1);
        assert_eq!(settings.video_count, 1);

        let none: BTreeMap<String, Value> = serde_json::from_str(r#"{"audioCount": 0}"#).unwrap();
        assert!(CallSettings::from_payload(&none).is_err());
    }

    #[tokio::test]
    async fn test_manager_tracks_live_calls_and_prunes() {
        let manager = CallManager::new();
        let id = manager.allocate_id();
        let mut call = outgoing();
        call.id = id;
        {
            let mut call = manager.insert(call).await;
            assert_eq!(manager.live_count(1), 1);
            call.terminate(None, None);
            manager.mark_terminated(&call);
        }
        assert!(manager.find_by_sip_call_id("abc@host").is_some());
        assert_eq!(manager.live_count(1), 0);
        assert!(manager.get(id).is_ok());

        let pruned = manager.prune(Duration::ZERO, Instant::now());
        assert_eq!(pruned, vec![id]);
        assert_eq!(manager.get(id).unwrap_err().kind(), "StaleReference");
        assert!(manager.find_by_sip_call_id("abc@host").is_none());
    }
}
