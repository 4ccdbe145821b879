//! Builder for creating dispatchers

use std::sync::Arc;
use std::time::Duration;

use crate::config::ControlConfig;
use crate::engine::{self, EngineHandle, EngineInbox, TelephonyEngine};
use crate::error::ControlResult;

use super::Dispatcher;

/// Builder for a [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct DispatcherBuilder {
    config: ControlConfig,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            config: ControlConfig::default(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ControlConfig) -> Self {
        self.config = config;
        self
    }

    /// User agent advertised once the service starts
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.service.user_agent = user_agent.into();
        self
    }

    pub fn stun_servers(mut self, servers: Vec<String>) -> Self {
        self.config.service.stun_servers = servers;
        self
    }

    pub fn id_grace_period(mut self, grace: Duration) -> Self {
        self.config = self.config.with_id_grace_period(grace);
        self
    }

    pub fn terminated_retention(mut self, retention: Duration) -> Self {
        self.config = self.config.with_terminated_retention(retention);
        self
    }

    /// How long a parked command waits before failing with 408
    pub fn engine_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_engine_timeout(timeout);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.with_sweep_interval(interval);
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config = self.config.with_event_channel_capacity(capacity);
        self
    }

    /// Bound on engine messages waiting in the inbox
    pub fn engine_queue_capacity(mut self, capacity: usize) -> Self {
        self.config = self.config.with_engine_queue_capacity(capacity);
        self
    }

    /// Create the engine inbox, sized by the configured queue capacity.
    ///
    /// The handle goes to the engine, the inbox to [`DispatcherBuilder::build`].
    pub fn engine_channel(&self) -> (EngineHandle, EngineInbox) {
        engine::channel(self.config.engine_queue_capacity)
    }

    /// Build the dispatcher. Call [`Dispatcher::start`] to begin draining the inbox.
    pub fn build(self, engine: Arc<dyn TelephonyEngine>, inbox: EngineInbox) -> ControlResult<Arc<Dispatcher>> {
        self.config.validate()?;
        tracing::debug!(config = ?self.config, "Building dispatcher");
        Ok(Arc::new(Dispatcher::new(self.config, engine, inbox)))
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
