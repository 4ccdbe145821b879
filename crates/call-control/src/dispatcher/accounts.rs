//! Account commands
//!
//! Every handler locks the account before looking at it. Call creation takes
//! the same lock, so `account_delete` and `call_make` on one account can
//! never interleave.

use tracing::{debug, info, warn};

use crate::account::{AccountConfig, AccountId, RegistrationState, RegistrationStep};
use crate::command::CallbackId;
use crate::engine::{EngineFailure, EngineRequest, RequestToken};
use crate::error::{ControlError, ControlResult};
use crate::events::ControlEvent;
use crate::value::Value;

use super::{Continuation, Dispatcher, Step};

impl Dispatcher {
    pub(crate) fn create_account(&self, config: AccountConfig) -> ControlResult<Step> {
        let snapshot = self.accounts.create(config)?;
        self.emit(ControlEvent::AccountCreated(snapshot.clone()));
        Ok(Step::Done(Value::from_serialize(&snapshot)))
    }

    pub(crate) async fn register_account(
        &self,
        callback_id: CallbackId,
        account_id: AccountId,
        renew: bool,
    ) -> ControlResult<Step> {
        let handle = self.accounts.get(account_id)?;
        let mut account = handle.lock().await;
        account.ensure_live()?;

        let previous = account.state();
        let token = self.next_token();
        if account.begin_registration(renew, token)? == RegistrationStep::AlreadyRegistered {
            debug!(account_id, "Account already registered, nothing to send");
            return Ok(Step::Done(Value::from_serialize(&account.snapshot())));
        }

        if account.state() != previous {
            info!(account_id, from = %previous, to = %account.state(), "Registration state changed");
            self.emit(ControlEvent::RegistrationChanged(account.snapshot()));
        }

        let request = EngineRequest::Register {
            account_id,
            registration: account.config.registration_request(),
            renew,
        };
        self.park(token, Some(callback_id), Continuation::Register { account_id });
        drop(account);
        self.dispatch(token, request).await
    }

    pub(crate) async fn finish_registration(
        &self,
        token: RequestToken,
        account_id: AccountId,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        let handle = self.accounts.get(account_id)?;
        let mut account = handle.lock().await;
        account.ensure_live()?;
        if !account.finish_registration(token, &outcome) {
            return Err(ControlError::stale_account(account_id, "registration was superseded"));
        }

        let snapshot = account.snapshot();
        match &outcome {
            Ok(_) => info!(account_id, expires = ?snapshot.registration.expires, "Account registered"),
            Err(failure) => warn!(account_id, code = failure.code, reason = %failure.message, "Registration failed"),
        }
        self.emit(ControlEvent::RegistrationChanged(snapshot.clone()));

        outcome?;
        Ok(Value::from_serialize(&snapshot))
    }

    /// `account_delete`: refuse while the account owns live calls, otherwise
    /// remove it at once and unregister through the engine if needed
    pub(crate) async fn delete_account(&self, callback_id: CallbackId, account_id: AccountId) -> ControlResult<Step> {
        let handle = self.accounts.get(account_id)?;
        let mut account = handle.lock().await;
        account.ensure_live()?;

        let active_calls = self.calls.live_count(account_id);
        if active_calls > 0 {
            return Err(ControlError::AccountBusy {
                account_id,
                active_calls,
            });
        }

        let pending = account.cancel_registration();
        if let Some(token) = pending {
            self.abandon(token, ControlError::stale_account(account_id, "account was deleted"));
        }
        let unregister = pending.is_some() || account.state() == RegistrationState::Registered;

        account.deleted = true;
        self.accounts.remove(account_id);

        if !unregister {
            return Ok(Step::Done(Value::from(account_id)));
        }
        let token = self.next_token();
        self.park(token, Some(callback_id), Continuation::Unregister { account_id });
        drop(account);
        self.dispatch(token, EngineRequest::Unregister { account_id }).await
    }

    pub(crate) fn finish_unregister(account_id: AccountId, outcome: Result<Value, EngineFailure>) -> ControlResult<Value> {
        match outcome {
            Ok(_) => {
                info!(account_id, "Account unregistered");
                Ok(Value::from(account_id))
            }
            Err(failure) => {
                warn!(account_id, code = failure.code, "Unregister failed, account removed anyway");
                Err(failure.into())
            }
        }
    }

    pub(crate) async fn update_stun_servers(
        &self,
        callback_id: CallbackId,
        account_id: AccountId,
        servers: Vec<String>,
    ) -> ControlResult<Step> {
        let handle = self.accounts.get(account_id)?;
        let account = handle.lock().await;
        account.ensure_live()?;

        let token = self.next_token();
        self.park(
            token,
            Some(callback_id),
            Continuation::StunServers {
                account_id,
                servers: servers.clone(),
            },
        );
        drop(account);
        self.dispatch(token, EngineRequest::UpdateStunServers { account_id, servers })
            .await
    }

    pub(crate) async fn finish_stun_servers(
        &self,
        account_id: AccountId,
        servers: Vec<String>,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        outcome?;
        let handle = self.accounts.get(account_id)?;
        let mut account = handle.lock().await;
        account.ensure_live()?;
        debug!(account_id, servers = ?servers, "STUN servers updated");
        account.config.stun_servers = servers;
        Ok(Value::from_serialize(&account.snapshot()))
    }
}
