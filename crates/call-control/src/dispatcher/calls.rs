//! Call operations for the dispatcher
//!
//! This module contains placing, answering, ringing and tearing down calls,
//! plus the shared path every slot-taking call operation goes through.

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::account::AccountId;
use crate::call::{Call, CallId, CallManager, CallOperation, CallSettings, CallState, HangupStep, InFlight, SipMessageData};
use crate::command::CallbackId;
use crate::engine::{EngineFailure, EngineRequest, RequestToken};
use crate::error::{ControlError, ControlResult};
use crate::events::{ControlEvent, TransferLink};
use crate::value::Value;

use super::{Continuation, Dispatcher, Step};

/// Turn what the user typed into a request URI
///
/// URIs pass through, `user@host` gets a `sip:` scheme and anything else is
/// taken as a user part on the account's domain.
pub(crate) fn normalize_destination(destination: &str, domain: &str) -> String {
    let destination = destination.trim();
    if ["sip:", "sips:", "tel:"].iter().any(|scheme| destination.starts_with(scheme)) {
        destination.to_string()
    } else if destination.contains('@') {
        format!("sip:{}", destination)
    } else {
        let user: String = destination.chars().filter(|c| !c.is_whitespace()).collect();
        format!("sip:{}@{}", user, domain)
    }
}

impl Dispatcher {
    /// `call_make`: create the call in Initiating and ask the engine to dial
    pub(crate) async fn make_call(
        &self,
        callback_id: CallbackId,
        account_id: AccountId,
        destination: &str,
        settings: CallSettings,
        message: Option<SipMessageData>,
    ) -> ControlResult<Step> {
        let handle = self.accounts.get(account_id)?;
        let account = handle.lock().await;
        account.ensure_live()?;
        if !account.state().permits_outbound_calls() {
            return Err(ControlError::invalid_state(
                format!("account {}", account_id),
                "call_make",
                account.state().to_string(),
            ));
        }

        let destination = normalize_destination(destination, &account.config.domain);
        let call_id = self.calls.allocate_id();
        let sip_call_id = CallManager::generate_sip_call_id();
        let token = self.next_token();

        let mut call = Call::outgoing(
            call_id,
            account_id,
            sip_call_id.clone(),
            account.config.uri(),
            destination.clone(),
            settings,
        );
        call.begin(CallOperation::Dial, token)?;
        let call = self.calls.insert(call).await;
        drop(account);

        info!(call_id, account_id, destination = %destination, "Placing outgoing call");
        self.emit_call_changed(&call);
        self.park(token, Some(callback_id), Continuation::Dial { call_id });
        drop(call);

        self.dispatch(
            token,
            EngineRequest::MakeCall {
                call_id,
                account_id,
                sip_call_id,
                destination,
                settings,
                message,
            },
        )
        .await
    }

    pub(crate) async fn finish_dial(
        &self,
        token: RequestToken,
        call_id: CallId,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        let handle = self.calls.get(call_id)?;
        let mut call = handle.lock().await;
        if call.finish(token).is_none() {
            return Err(ControlError::stale_call(call_id, "call ended before the engine answered"));
        }
        match outcome {
            Ok(_) => Ok(Value::from_serialize(&call.snapshot())),
            Err(failure) => {
                warn!(call_id, code = failure.code, reason = %failure.message, "Engine could not place call");
                self.terminate_call(&mut call, Some(failure.code), Some(failure.message.clone()));
                Err(failure.into())
            }
        }
    }

    /// Resolve a pending dial once the remote side has answered with progress.
    ///
    /// Only the holder of the parked entry may release the slot; when a
    /// completion already took it, `finish_dial` does.
    pub(crate) fn confirm_dial(&self, call: &mut Call) {
        let Some(token) = call
            .in_flight
            .as_ref()
            .filter(|flight| flight.operation == CallOperation::Dial)
            .map(|flight| flight.token)
        else {
            return;
        };
        let Some((_, parked)) = self.parked.remove(&token) else {
            return;
        };
        call.finish(token);
        debug!(call_id = call.id, token, state = %call.state, "Dial confirmed by remote progress");
        if let Some(callback_id) = parked.callback_id {
            self.complete(callback_id, Ok(Value::from_serialize(&call.snapshot())));
        }
    }

    /// Tear down the engine side of a dial that failed locally
    pub(crate) async fn cancel_dial(&self, call_id: CallId) {
        let sip_call_id = match self.calls.get(call_id) {
            Ok(handle) => handle.lock().await.sip_call_id.clone(),
            Err(_) => return,
        };
        info!(call_id, sip_call_id = %sip_call_id, "Cancelling unanswered dial");
        self.send_internal(
            "cancel-dial",
            EngineRequest::Hangup {
                sip_call_id,
                status_code: None,
            },
        )
        .await;
    }

    pub(crate) async fn answer_call(&self, callback_id: CallbackId, call_id: CallId) -> ControlResult<Step> {
        self.begin_call_operation(callback_id, call_id, CallOperation::Answer, None, |call| EngineRequest::Answer {
            sip_call_id: call.sip_call_id.clone(),
        })
        .await
    }

    pub(crate) async fn send_ringing(&self, callback_id: CallbackId, call_id: CallId) -> ControlResult<Step> {
        self.begin_call_operation(callback_id, call_id, CallOperation::Ringing, None, |call| {
            EngineRequest::Ringing {
                sip_call_id: call.sip_call_id.clone(),
            }
        })
        .await
    }

    pub(crate) async fn send_progress(&self, callback_id: CallbackId, call_id: CallId) -> ControlResult<Step> {
        self.begin_call_operation(callback_id, call_id, CallOperation::Progress, None, |call| {
            EngineRequest::Progress {
                sip_call_id: call.sip_call_id.clone(),
            }
        })
        .await
    }

    /// Guard an operation, take the call's slot and send the engine request.
    ///
    /// When the call is idle and already in `already_in`, succeed without
    /// contacting the engine.
    pub(crate) async fn begin_call_operation(
        &self,
        callback_id: CallbackId,
        call_id: CallId,
        operation: CallOperation,
        already_in: Option<CallState>,
        request: impl FnOnce(&Call) -> EngineRequest,
    ) -> ControlResult<Step> {
        let handle = self.calls.get(call_id)?;
        let mut call = handle.lock().await;

        if call.in_flight.is_none() && already_in == Some(call.state) {
            debug!(call_id, operation = operation.name(), state = %call.state, "Call already in target state");
            return Ok(Step::Done(Value::from_serialize(&call.snapshot())));
        }

        let token = self.next_token();
        call.begin(operation.clone(), token)?;
        let request = request(&call);
        debug!(call_id, token, operation = operation.name(), "Call operation started");
        self.park(token, Some(callback_id), Continuation::Call { call_id, operation });
        drop(call);

        self.dispatch(token, request).await
    }

    /// Apply the engine's answer to an operation that held the call's slot
    pub(crate) async fn finish_call_operation(
        &self,
        token: RequestToken,
        call_id: CallId,
        operation: CallOperation,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        let handle = self.calls.get(call_id)?;
        let mut call = handle.lock().await;
        if call.finish(token).is_none() {
            return Err(ControlError::stale_call(
                call_id,
                format!("{} was interrupted", operation.name()),
            ));
        }
        if let Err(failure) = outcome {
            warn!(call_id, operation = operation.name(), code = failure.code, reason = %failure.message, "Engine rejected call operation");
            return Err(failure.into());
        }

        match operation {
            CallOperation::Answer | CallOperation::Unhold => self.transition(&mut call, CallState::Connected),
            CallOperation::Hold => self.transition(&mut call, CallState::Holding),
            CallOperation::Progress => {
                if call.state == CallState::Ringing {
                    self.transition(&mut call, CallState::Early);
                }
            }
            CallOperation::Ringing => {
                call.last_status_code = Some(180);
            }
            CallOperation::Transfer { destination } => {
                self.emit(ControlEvent::CallTransferred(TransferLink {
                    call: call.snapshot(),
                    destination,
                    replaced_call_id: None,
                }));
                self.terminate_call(&mut call, None, Some("transferred".to_string()));
            }
            CallOperation::Redirect { destination } => {
                self.terminate_call(&mut call, Some(302), Some(format!("redirected to {}", destination)));
            }
            CallOperation::Dial
            | CallOperation::Hangup
            | CallOperation::TransferReplace { .. }
            | CallOperation::TransferTarget { .. } => {
                debug!(call_id, token, "Operation completes through its own continuation");
            }
        }
        Ok(Value::from_serialize(&call.snapshot()))
    }

    /// `call_hangup` and `call_decline`
    pub(crate) async fn hangup_call(
        &self,
        callback_id: CallbackId,
        call_id: CallId,
        status_code: Option<u16>,
    ) -> ControlResult<Step> {
        let handle = self.calls.get(call_id)?;
        let mut call = handle.lock().await;

        let token = self.next_token();
        let preempted = match call.begin_hangup(token)? {
            HangupStep::AlreadyTerminated => {
                debug!(call_id, "Hangup on terminated call");
                return Ok(Step::Done(Value::from_serialize(&call.snapshot())));
            }
            HangupStep::Proceed { preempted } => preempted,
        };

        info!(call_id, status_code = ?status_code, "Call disconnecting");
        self.emit_call_changed(&call);
        self.park(token, Some(callback_id), Continuation::Hangup { call_id });
        let partner = preempted.and_then(|flight| self.settle_preempted(&call, flight));
        let request = EngineRequest::Hangup {
            sip_call_id: call.sip_call_id.clone(),
            status_code,
        };
        drop(call);

        self.release_partner(partner).await;
        self.dispatch(token, request).await
    }

    /// A failed teardown still ends the call locally
    pub(crate) async fn finish_hangup(
        &self,
        token: RequestToken,
        call_id: CallId,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        let handle = self.calls.get(call_id)?;
        let mut call = handle.lock().await;
        call.finish(token);

        if !call.state.is_terminated() {
            let (code, reason) = match &outcome {
                Ok(_) => (None, "local hangup".to_string()),
                Err(failure) => {
                    warn!(call_id, code = failure.code, "Engine failed to tear down call, forcing Terminated");
                    (Some(failure.code), failure.message.clone())
                }
            };
            self.terminate_call(&mut call, code, Some(reason));
        }

        outcome?;
        Ok(Value::from_serialize(&call.snapshot()))
    }

    /// Move a call to a new primary state, announcing real changes
    pub(crate) fn transition(&self, call: &mut Call, state: CallState) {
        let previous = call.set_state(state);
        if previous != state {
            info!(call_id = call.id, from = %previous, to = %state, "Call state changed");
            self.emit_call_changed(call);
        }
    }

    /// Force Terminated, announce it and return whatever was left in the slot
    pub(crate) fn terminate_call(&self, call: &mut Call, code: Option<u16>, reason: Option<String>) -> Option<InFlight> {
        let previous = call.state;
        let preempted = call.terminate(code, reason);
        self.calls.mark_terminated(call);
        info!(call_id = call.id, from = %previous, code = ?call.last_status_code, "Call terminated");
        self.emit(ControlEvent::CallTerminated(call.snapshot()));
        preempted
    }

    /// Lock two calls in ascending id order, returning the guards as `(first, second)`
    pub(crate) async fn lock_pair(
        &self,
        first: CallId,
        second: CallId,
    ) -> ControlResult<(OwnedMutexGuard<Call>, OwnedMutexGuard<Call>)> {
        let a = self.calls.get(first)?;
        let b = self.calls.get(second)?;
        if first < second {
            let a = a.lock_owned().await;
            let b = b.lock_owned().await;
            Ok((a, b))
        } else {
            let b = b.lock_owned().await;
            let a = a.lock_owned().await;
            Ok((a, b))
        }
    }
}
