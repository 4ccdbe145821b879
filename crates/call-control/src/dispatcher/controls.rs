//! Mid-call controls: hold, mute, audio route, transfers, redirect and DTMF

use tracing::{debug, info, warn};

use crate::call::{CallId, CallOperation, CallState};
use crate::command::CallbackId;
use crate::engine::{EngineFailure, EngineRequest, RequestToken};
use crate::error::{ControlError, ControlResult};
use crate::events::{ControlEvent, TransferLink};
use crate::value::Value;

use super::{Continuation, Dispatcher, Step};

impl Dispatcher {
    pub(crate) async fn hold_call(&self, callback_id: CallbackId, call_id: CallId) -> ControlResult<Step> {
        self.begin_call_operation(
            callback_id,
            call_id,
            CallOperation::Hold,
            Some(CallState::Holding),
            |call| EngineRequest::Hold {
                sip_call_id: call.sip_call_id.clone(),
            },
        )
        .await
    }

    pub(crate) async fn resume_call(&self, callback_id: CallbackId, call_id: CallId) -> ControlResult<Step> {
        self.begin_call_operation(
            callback_id,
            call_id,
            CallOperation::Unhold,
            Some(CallState::Connected),
            |call| EngineRequest::Unhold {
                sip_call_id: call.sip_call_id.clone(),
            },
        )
        .await
    }

    /// Mute goes through the engine but never blocks the call's slot
    pub(crate) async fn set_muted(&self, callback_id: CallbackId, call_id: CallId, muted: bool) -> ControlResult<Step> {
        let handle = self.calls.get(call_id)?;
        let call = handle.lock().await;
        call.ensure_not_terminal(if muted { "call_mute" } else { "call_unmute" })?;
        if call.muted == muted {
            return Ok(Step::Done(Value::from_serialize(&call.snapshot())));
        }

        let token = self.next_token();
        let request = EngineRequest::Mute {
            sip_call_id: call.sip_call_id.clone(),
            muted,
        };
        self.park(token, Some(callback_id), Continuation::Mute { call_id, muted });
        drop(call);
        self.dispatch(token, request).await
    }

    pub(crate) async fn finish_mute(
        &self,
        call_id: CallId,
        muted: bool,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        outcome?;
        let handle = self.calls.get(call_id)?;
        let mut call = handle.lock().await;
        if call.state.is_terminated() {
            return Err(ControlError::stale_call(call_id, "call ended before mute was applied"));
        }
        if call.muted != muted {
            call.muted = muted;
            debug!(call_id, muted, "Microphone mute changed");
            self.emit_call_changed(&call);
        }
        Ok(Value::from_serialize(&call.snapshot()))
    }

    /// Audio route is local only
    pub(crate) async fn set_speaker(&self, call_id: CallId, speaker: bool) -> ControlResult<Step> {
        let handle = self.calls.get(call_id)?;
        let mut call = handle.lock().await;
        call.ensure_not_terminal(if speaker { "call_use_speaker" } else { "call_use_earpiece" })?;
        if call.speaker != speaker {
            call.speaker = speaker;
            debug!(call_id, speaker, "Audio route changed");
            self.emit_call_changed(&call);
        }
        Ok(Step::Done(Value::from_serialize(&call.snapshot())))
    }

    /// Blind transfer (REFER)
    pub(crate) async fn transfer_call(
        &self,
        callback_id: CallbackId,
        call_id: CallId,
        destination: String,
    ) -> ControlResult<Step> {
        let target = destination.clone();
        self.begin_call_operation(
            callback_id,
            call_id,
            CallOperation::Transfer { destination },
            None,
            move |call| EngineRequest::Transfer {
                sip_call_id: call.sip_call_id.clone(),
                destination: target,
            },
        )
        .await
    }

    pub(crate) async fn redirect_call(
        &self,
        callback_id: CallbackId,
        call_id: CallId,
        destination: String,
    ) -> ControlResult<Step> {
        let target = destination.clone();
        self.begin_call_operation(
            callback_id,
            call_id,
            CallOperation::Redirect { destination },
            None,
            move |call| EngineRequest::Redirect {
                sip_call_id: call.sip_call_id.clone(),
                destination: target,
            },
        )
        .await
    }

    /// Attended transfer: `call_id` is replaced by the consultation call
    /// `dest_call_id`. Both calls hold the same token until the engine answers,
    /// so neither can start another operation in the meantime.
    pub(crate) async fn attended_transfer(
        &self,
        callback_id: CallbackId,
        call_id: CallId,
        dest_call_id: CallId,
    ) -> ControlResult<Step> {
        let (mut call, mut dest) = self.lock_pair(call_id, dest_call_id).await?;
        let token = self.next_token();
        call.begin(CallOperation::TransferReplace { dest_call_id }, token)?;
        if let Err(e) = dest.begin(CallOperation::TransferTarget { call_id }, token) {
            call.finish(token);
            return Err(e);
        }

        let request = EngineRequest::TransferReplace {
            sip_call_id: call.sip_call_id.clone(),
            replaces_sip_call_id: dest.sip_call_id.clone(),
        };
        debug!(call_id, dest_call_id, token, "Attended transfer started");
        self.park(token, Some(callback_id), Continuation::TransferReplace { call_id, dest_call_id });
        drop(dest);
        drop(call);
        self.dispatch(token, request).await
    }

    pub(crate) async fn finish_attended_transfer(
        &self,
        token: RequestToken,
        call_id: CallId,
        dest_call_id: CallId,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        let (mut call, mut dest) = self.lock_pair(call_id, dest_call_id).await?;
        let owned = call.finish(token).is_some();
        dest.finish(token);
        if !owned {
            return Err(ControlError::stale_call(call_id, "transfer was interrupted"));
        }
        if let Err(failure) = outcome {
            warn!(call_id, dest_call_id, code = failure.code, "Attended transfer failed");
            return Err(failure.into());
        }

        info!(call_id, dest_call_id, "Attended transfer completed");
        self.emit(ControlEvent::CallTransferred(TransferLink {
            call: call.snapshot(),
            destination: dest.remote_uri.clone(),
            replaced_call_id: Some(dest_call_id),
        }));
        self.terminate_call(&mut call, None, Some("transferred".to_string()));
        Ok(Value::from_serialize(&call.snapshot()))
    }

    pub(crate) async fn send_dtmf(&self, callback_id: CallbackId, call_id: CallId, digits: String) -> ControlResult<Step> {
        let handle = self.calls.get(call_id)?;
        let call = handle.lock().await;
        call.ensure_connected("call_dtmf")?;

        let token = self.next_token();
        let request = EngineRequest::SendDtmf {
            sip_call_id: call.sip_call_id.clone(),
            digits,
        };
        self.park(token, Some(callback_id), Continuation::Dtmf { call_id });
        drop(call);
        self.dispatch(token, request).await
    }
}
