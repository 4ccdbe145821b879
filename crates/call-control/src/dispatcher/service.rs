//! Service-level commands: start, service configuration, codecs and network

use std::collections::BTreeMap;

use tracing::info;

use crate::command::CallbackId;
use crate::config::{CodecSettings, NetworkConfig, ServiceConfig};
use crate::engine::{EngineFailure, EngineRequest};
use crate::error::{ControlError, ControlResult};
use crate::events::ControlEvent;
use crate::value::{Payload, Value};

use super::{Continuation, Dispatcher, Step};

impl Dispatcher {
    /// `start`: push the service configuration to the engine and report a
    /// snapshot of everything the core knows. Safe to repeat.
    pub(crate) async fn start_service(&self, callback_id: CallbackId, payload: &Payload) -> ControlResult<Step> {
        let config = self.service.read().config.merged_with(payload)?;
        let token = self.next_token();
        self.park(token, Some(callback_id), Continuation::Start { config: config.clone() });
        self.dispatch(token, EngineRequest::Start { config }).await
    }

    pub(crate) async fn finish_start(
        &self,
        config: ServiceConfig,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        outcome?;
        let first = {
            let mut service = self.service.write();
            service.config = config;
            !std::mem::replace(&mut service.started, true)
        };
        let snapshot = self.service_snapshot().await;
        if first {
            info!(user_agent = %snapshot.settings.user_agent, "Service started");
        }
        self.emit(ControlEvent::ServiceStarted(snapshot.clone()));
        Ok(Value::from_serialize(&snapshot))
    }

    pub(crate) async fn set_service_configuration(
        &self,
        callback_id: CallbackId,
        payload: &Payload,
    ) -> ControlResult<Step> {
        let config = self.service.read().config.merged_with(payload)?;
        let token = self.next_token();
        self.park(token, Some(callback_id), Continuation::ServiceConfig { config: config.clone() });
        self.dispatch(token, EngineRequest::ApplyServiceConfig { config }).await
    }

    pub(crate) fn finish_service_configuration(
        &self,
        config: ServiceConfig,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        outcome?;
        info!(user_agent = %config.user_agent, stun_servers = config.stun_servers.len(), "Service configuration applied");
        let value = Value::from_serialize(&config);
        self.service.write().config = config;
        Ok(value)
    }

    pub(crate) async fn change_codec_settings(
        &self,
        callback_id: CallbackId,
        settings: CodecSettings,
    ) -> ControlResult<Step> {
        if settings.priorities.is_empty() {
            return Err(ControlError::invalid_argument("configuration", "no codecs given"));
        }
        let token = self.next_token();
        self.park(token, Some(callback_id), Continuation::Codecs { settings: settings.clone() });
        self.dispatch(token, EngineRequest::SetCodecPriorities { settings }).await
    }

    pub(crate) fn finish_codec_settings(
        &self,
        settings: CodecSettings,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        outcome?;
        info!(enabled = ?settings.enabled(), "Codec priorities changed");
        let mut service = self.service.write();
        // later calls only name the codecs they change
        service.codecs.priorities.extend(settings.priorities);
        Ok(Value::from_serialize(&service.codecs))
    }

    pub(crate) async fn change_network_configuration(
        &self,
        callback_id: CallbackId,
        configuration: &BTreeMap<String, Value>,
    ) -> ControlResult<Step> {
        let config = self.service.read().network.merged_with(configuration)?;
        let token = self.next_token();
        self.park(token, Some(callback_id), Continuation::Network { config: config.clone() });
        self.dispatch(token, EngineRequest::ApplyNetworkConfig { config }).await
    }

    pub(crate) fn finish_network_configuration(
        &self,
        config: NetworkConfig,
        outcome: Result<Value, EngineFailure>,
    ) -> ControlResult<Value> {
        outcome?;
        info!(
            nat = config.nat_enabled,
            tcp = config.enable_tcp,
            tls = config.enable_tls,
            "Network configuration changed"
        );
        let value = Value::from_serialize(&config);
        self.service.write().network = config;
        Ok(value)
    }
}
