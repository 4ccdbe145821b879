//! Unsolicited engine notifications
//!
//! These arrive through the inbox and are not tied to any command, so their
//! outcomes are reported as events only.

use tracing::{debug, info, warn};

use crate::account::{AccountId, RegistrationState};
use crate::call::Call;
use crate::engine::{CallProgress, EngineNotification, EngineRequest, InstantMessage};
use crate::events::{ControlEvent, MessageInfo};

use super::Dispatcher;

/// Status sent back for calls nobody can take
const TEMPORARILY_UNAVAILABLE: u16 = 480;

impl Dispatcher {
    pub(crate) async fn handle_notification(&self, notification: EngineNotification) {
        match notification {
            EngineNotification::RegistrationChanged {
                account_id,
                code,
                reason,
                expires,
                retry_after,
            } => {
                self.on_registration_changed(account_id, code, &reason, expires, retry_after)
                    .await
            }
            EngineNotification::IncomingCall {
                account_id,
                sip_call_id,
                remote_uri,
                local_uri,
            } => self.on_incoming_call(account_id, sip_call_id, remote_uri, local_uri).await,
            EngineNotification::CallProgress {
                sip_call_id,
                progress,
                code,
                reason,
            } => self.on_call_progress(&sip_call_id, progress, code, &reason).await,
            EngineNotification::CallDisconnected {
                sip_call_id,
                code,
                reason,
            } => self.on_call_disconnected(&sip_call_id, code, reason).await,
            EngineNotification::MessageReceived { account_id, message } => self.on_message(account_id, message),
            EngineNotification::ConnectivityChanged { available } => self.on_connectivity_changed(available),
        }
    }

    async fn on_registration_changed(
        &self,
        account_id: AccountId,
        code: u16,
        reason: &str,
        expires: Option<u32>,
        retry_after: Option<u32>,
    ) {
        let Ok(handle) = self.accounts.get(account_id) else {
            warn!(account_id, code, "Registration update for unknown account");
            return;
        };
        let mut account = handle.lock().await;
        if account.deleted {
            return;
        }
        let previous = account.state();
        if account.apply_registration_update(code, reason, expires, retry_after) {
            info!(account_id, from = %previous, to = %account.state(), code, "Registration changed by registrar");
            self.emit(ControlEvent::RegistrationChanged(account.snapshot()));
        } else {
            debug!(account_id, code, "Registration refreshed");
        }
    }

    async fn on_incoming_call(
        &self,
        account_id: AccountId,
        sip_call_id: String,
        remote_uri: String,
        local_uri: Option<String>,
    ) {
        if self.calls.find_by_sip_call_id(&sip_call_id).is_some() {
            warn!(sip_call_id = %sip_call_id, "Duplicate incoming call notification");
            return;
        }
        let Ok(handle) = self.accounts.get(account_id) else {
            warn!(account_id, remote = %remote_uri, "Incoming call for unknown account");
            self.reject_incoming(sip_call_id).await;
            return;
        };

        let account = handle.lock().await;
        if account.deleted || account.state() != RegistrationState::Registered {
            warn!(account_id, state = %account.state(), remote = %remote_uri, "Incoming call for account that is not registered");
            drop(account);
            self.reject_incoming(sip_call_id).await;
            return;
        }

        let call_id = self.calls.allocate_id();
        let local_uri = local_uri.unwrap_or_else(|| account.config.uri());
        let call = self
            .calls
            .insert(Call::incoming(call_id, account_id, sip_call_id, local_uri, remote_uri))
            .await;
        drop(account);

        info!(call_id, account_id, remote = %call.remote_uri, "Incoming call");
        self.emit(ControlEvent::CallReceived(call.snapshot()));
    }

    async fn reject_incoming(&self, sip_call_id: String) {
        let request = EngineRequest::Hangup {
            sip_call_id,
            status_code: Some(TEMPORARILY_UNAVAILABLE),
        };
        self.send_internal("reject-incoming", request).await;
    }

    async fn on_call_progress(&self, sip_call_id: &str, progress: CallProgress, code: u16, reason: &str) {
        let Some((call_id, handle)) = self.calls.find_by_sip_call_id(sip_call_id) else {
            warn!(sip_call_id, ?progress, "Progress for unknown call");
            return;
        };
        let mut call = handle.lock().await;
        let previous = call.state;
        if call.apply_progress(progress, code, reason) {
            info!(call_id, from = %previous, to = %call.state, code, "Call progressed");
            self.emit_call_changed(&call);
        } else {
            debug!(call_id, state = %call.state, ?progress, "Ignoring progress that does not advance the call");
        }
        self.confirm_dial(&mut call);
    }

    async fn on_call_disconnected(&self, sip_call_id: &str, code: u16, reason: String) {
        let Some((call_id, handle)) = self.calls.find_by_sip_call_id(sip_call_id) else {
            warn!(sip_call_id, code, "Disconnect for unknown call");
            return;
        };
        let mut call = handle.lock().await;
        if call.state.is_terminated() {
            debug!(call_id, "Disconnect for call that already ended");
            return;
        }

        let preempted = self.terminate_call(&mut call, Some(code), Some(reason));
        let partner = preempted.and_then(|flight| self.settle_preempted(&call, flight));
        drop(call);
        self.release_partner(partner).await;
    }

    fn on_message(&self, account_id: AccountId, message: InstantMessage) {
        if !self.accounts.contains(account_id) {
            warn!(account_id, from = %message.from, "Message for unknown account dropped");
            return;
        }
        debug!(account_id, from = %message.from, content_type = %message.content_type, "Message received");
        self.emit(ControlEvent::MessageReceived(MessageInfo { account_id, message }));
    }

    fn on_connectivity_changed(&self, available: bool) {
        let changed = {
            let mut service = self.service.write();
            std::mem::replace(&mut service.connectivity, available) != available
        };
        if changed {
            info!(available, "Network connectivity changed");
            self.emit(ControlEvent::ConnectivityChanged { available });
        }
    }
}
