//! Runtime configuration for the call-control core
//!
//! [`ControlConfig`] holds the dispatcher's own tunables. [`ServiceConfig`],
//! [`CodecSettings`] and [`NetworkConfig`] are the engine-facing settings that
//! commands change at runtime.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};
use crate::value::{Payload, PayloadFields, Value};

/// Default user agent advertised by the engine
pub const DEFAULT_USER_AGENT: &str = concat!("rvoip-call-control/", env!("CARGO_PKG_VERSION"));

/// Dispatcher tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Seconds a deleted account id stays retired before reuse
    pub id_grace_period_secs: u64,
    /// Seconds a terminated call stays addressable before it is pruned
    pub terminated_retention_secs: u64,
    /// Seconds a parked command waits for the engine
    pub engine_timeout_secs: u64,
    /// Cadence of the timeout and prune sweep
    pub sweep_interval_ms: u64,
    pub event_channel_capacity: usize,
    pub engine_queue_capacity: usize,
    /// Service settings applied on `start`
    pub service: ServiceConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            id_grace_period_secs: 30,
            terminated_retention_secs: 30,
            // SIP Timer B (64 * T1)
            engine_timeout_secs: 32,
            sweep_interval_ms: 500,
            event_channel_capacity: 1024,
            engine_queue_capacity: 256,
            service: ServiceConfig::default(),
        }
    }
}

impl ControlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id_grace_period(mut self, grace: Duration) -> Self {
        self.id_grace_period_secs = grace.as_secs();
        self
    }

    pub fn with_terminated_retention(mut self, retention: Duration) -> Self {
        self.terminated_retention_secs = retention.as_secs();
        self
    }

    pub fn with_engine_timeout(mut self, timeout: Duration) -> Self {
        self.engine_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    pub fn with_engine_queue_capacity(mut self, capacity: usize) -> Self {
        self.engine_queue_capacity = capacity;
        self
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }

    pub fn id_grace_period(&self) -> Duration {
        Duration::from_secs(self.id_grace_period_secs)
    }

    pub fn terminated_retention(&self) -> Duration {
        Duration::from_secs(self.terminated_retention_secs)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> ControlResult<()> {
        if self.engine_timeout_secs == 0 {
            return Err(ControlError::invalid_config("engine_timeout_secs", "must be greater than zero"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ControlError::invalid_config("sweep_interval_ms", "must be greater than zero"));
        }
        if self.event_channel_capacity == 0 {
            return Err(ControlError::invalid_config("event_channel_capacity", "must be greater than zero"));
        }
        if self.engine_queue_capacity == 0 {
            return Err(ControlError::invalid_config("engine_queue_capacity", "must be greater than zero"));
        }
        self.service.validate()
    }
}

/// Endpoint-wide settings pushed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub user_agent: String,
    pub stun_servers: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            stun_servers: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Overlay the fields present in a `start` / `set_service_configuration` payload
    pub fn merged_with(&self, payload: &Payload) -> ControlResult<Self> {
        let mut merged = self.clone();
        if let Some(user_agent) = payload.opt_text("userAgent")? {
            merged.user_agent = user_agent;
        }
        if let Some(servers) = payload.opt_string_list("stunServers")? {
            merged.stun_servers = servers;
        }
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> ControlResult<()> {
        if self.user_agent.trim().is_empty() {
            return Err(ControlError::invalid_config("userAgent", "must not be empty"));
        }
        if let Some(bad) = self.stun_servers.iter().find(|s| s.trim().is_empty()) {
            return Err(ControlError::invalid_config("stunServers", format!("invalid server entry {:?}", bad)));
        }
        Ok(())
    }
}

/// Codec priorities, codec id to priority (0 disables the codec)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSettings {
    pub priorities: BTreeMap<String, u8>,
}

impl CodecSettings {
    pub fn from_payload(configuration: &BTreeMap<String, Value>) -> ControlResult<Self> {
        let mut priorities = BTreeMap::new();
        for (codec, value) in configuration {
            let field = format!("configuration.{}", codec);
            let raw = value
                .as_i64()
                .ok_or_else(|| ControlError::invalid_argument(&field, "expected integer priority"))?;
            let priority = u8::try_from(raw)
                .map_err(|_| ControlError::invalid_argument(&field, format!("priority {} outside 0..=255", raw)))?;
            priorities.insert(codec.clone(), priority);
        }
        Ok(Self { priorities })
    }

    /// Codecs left enabled, highest priority first
    pub fn enabled(&self) -> Vec<&str> {
        let mut enabled: Vec<_> = self.priorities.iter().filter(|(_, p)| **p > 0).collect();
        enabled.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        enabled.into_iter().map(|(codec, _)| codec.as_str()).collect()
    }
}

/// Transport and NAT traversal settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub nat_enabled: bool,
    pub enable_tcp: bool,
    pub enable_tls: bool,
    pub dns_servers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            nat_enabled: true,
            enable_tcp: false,
            enable_tls: false,
            dns_servers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn merged_with(&self, configuration: &BTreeMap<String, Value>) -> ControlResult<Self> {
        let mut merged = self.clone();
        if let Some(nat) = configuration.opt_bool("natEnabled")? {
            merged.nat_enabled = nat;
        }
        if let Some(tcp) = configuration.opt_bool("enableTcp")? {
            merged.enable_tcp = tcp;
        }
        if let Some(tls) = configuration.opt_bool("enableTls")? {
            merged.enable_tls = tls;
        }
        if let Some(dns) = configuration.opt_string_list("dnsServers")? {
            merged.dns_servers = dns;
        }
        Ok(merged)
    }
}
