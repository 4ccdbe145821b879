//! SIP accounts and their registration lifecycle
//!
//! ```text
//! Unregistered --register--> Registering --engine ok--> Registered
//!      ^                          |                         |
//!      |                          +------engine error--> Failed
//!      +----------- registrar reports expires=0 ------------+
//! ```
//!
//! Each account sits behind its own `tokio::sync::Mutex` in the
//! [`AccountManager`] table, so registration is serialized per account while
//! different accounts proceed independently.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::engine::{EngineFailure, RequestToken};
use crate::error::{ControlError, ControlResult};
use crate::value::{Payload, PayloadFields, Value};

pub type AccountId = u32;

/// Default REGISTER expiry in seconds
pub const DEFAULT_REG_TIMEOUT: u32 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Failed,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "Unregistered"),
            RegistrationState::Registering => write!(f, "Registering"),
            RegistrationState::Registered => write!(f, "Registered"),
            RegistrationState::Failed => write!(f, "Failed"),
        }
    }
}

impl RegistrationState {
    /// Outbound calls are allowed while registered or registering
    pub fn permits_outbound_calls(&self) -> bool {
        matches!(self, RegistrationState::Registered | RegistrationState::Registering)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SipTransport {
    Udp,
    Tcp,
    Tls,
}

impl FromStr for SipTransport {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(SipTransport::Udp),
            "tcp" => Ok(SipTransport::Tcp),
            "tls" => Ok(SipTransport::Tls),
            other => Err(ControlError::invalid_config("transport", format!("unsupported transport {:?}", other))),
        }
    }
}

/// Account settings supplied by `account_create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub name: Option<String>,
    pub username: String,
    pub domain: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub proxy: Option<String>,
    pub transport: Option<SipTransport>,
    pub reg_server: Option<String>,
    pub reg_timeout: u32,
    pub reg_headers: BTreeMap<String, String>,
    pub reg_contact_params: Option<String>,
    pub stun_servers: Vec<String>,
}

impl AccountConfig {
    pub fn new(username: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: None,
            username: username.into(),
            domain: domain.into(),
            password: None,
            proxy: None,
            transport: None,
            reg_server: None,
            reg_timeout: DEFAULT_REG_TIMEOUT,
            reg_headers: BTreeMap::new(),
            reg_contact_params: None,
            stun_servers: Vec::new(),
        }
    }

    /// Build from an `account_create` payload.
    ///
    /// Field types were already checked by the action schema; missing identity
    /// or server is a configuration error rather than an argument error.
    pub fn from_payload(payload: &Payload) -> ControlResult<Self> {
        let username = payload
            .opt_text("username")?
            .ok_or_else(|| ControlError::invalid_config("username", "account identity is required"))?;
        let domain = payload
            .opt_text("domain")?
            .ok_or_else(|| ControlError::invalid_config("domain", "registration server is required"))?;

        let transport = payload.opt_text("transport")?.map(|t| t.parse::<SipTransport>()).transpose()?;
        let reg_timeout = match payload.opt_i64("regTimeout")? {
            None => DEFAULT_REG_TIMEOUT,
            Some(t) => u32::try_from(t)
                .ok()
                .filter(|t| *t > 0)
                .ok_or_else(|| ControlError::invalid_config("regTimeout", format!("{} is not a valid expiry", t)))?,
        };

        let config = Self {
            name: payload.opt_text("name")?,
            username,
            domain,
            password: payload.opt_str("password")?.map(str::to_string),
            proxy: payload.opt_text("proxy")?,
            transport,
            reg_server: payload.opt_text("regServer")?,
            reg_timeout,
            reg_headers: payload.opt_string_map("regHeaders")?.unwrap_or_default(),
            reg_contact_params: payload.opt_text("regContactParams")?,
            stun_servers: Vec::new(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ControlResult<()> {
        if self.username.trim().is_empty() {
            return Err(ControlError::invalid_config("username", "account identity is required"));
        }
        if self.domain.trim().is_empty() {
            return Err(ControlError::invalid_config("domain", "registration server is required"));
        }
        if self.username.contains(char::is_whitespace) || self.username.contains('@') {
            return Err(ControlError::invalid_config("username", "must be a bare user part"));
        }
        Ok(())
    }

    /// Address of record
    pub fn uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    /// Registrar URI, falling back to the domain
    pub fn registrar(&self) -> String {
        let server = self.reg_server.as_deref().unwrap_or(&self.domain);
        if server.starts_with("sip:") || server.starts_with("sips:") {
            server.to_string()
        } else {
            format!("sip:{}", server)
        }
    }

    pub fn registration_request(&self) -> RegistrationRequest {
        RegistrationRequest {
            uri: self.uri(),
            registrar: self.registrar(),
            username: self.username.clone(),
            password: self.password.clone(),
            proxy: self.proxy.clone(),
            transport: self.transport,
            expires: self.reg_timeout,
            headers: self.reg_headers.clone(),
            contact_params: self.reg_contact_params.clone(),
        }
    }
}

/// What the engine needs to send REGISTER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub uri: String,
    pub registrar: String,
    pub username: String,
    pub password: Option<String>,
    pub proxy: Option<String>,
    pub transport: Option<SipTransport>,
    pub expires: u32,
    pub headers: BTreeMap<String, String>,
    pub contact_params: Option<String>,
}

/// Last registration outcome as seen by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationInfo {
    pub state: RegistrationState,
    pub code: Option<u16>,
    pub reason: Option<String>,
    pub expires: Option<u32>,
    pub retry_after: Option<u32>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for RegistrationInfo {
    fn default() -> Self {
        Self {
            state: RegistrationState::Unregistered,
            code: None,
            reason: None,
            expires: None,
            retry_after: None,
            updated_at: None,
        }
    }
}

/// Result of asking an account to start registering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStep {
    /// Send REGISTER to the engine
    Issue,
    /// Registered already and no renewal was asked for
    AlreadyRegistered,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub config: AccountConfig,
    pub registration: RegistrationInfo,
    /// Token of the REGISTER currently awaiting the engine
    pub in_flight: Option<RequestToken>,
    /// Set under the lock when the account is deleted
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, config: AccountConfig) -> Self {
        Self {
            id,
            config,
            registration: RegistrationInfo::default(),
            in_flight: None,
            deleted: false,
            created_at: Utc::now(),
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.registration.state
    }

    /// Commands that waited on the lock of a deleted account must not act on it
    pub fn ensure_live(&self) -> ControlResult<()> {
        if self.deleted {
            return Err(ControlError::stale_account(self.id, "account was deleted"));
        }
        Ok(())
    }

    /// Guard and record the start of a registration.
    ///
    /// A renewal keeps the account Registered while the refresh is in flight.
    pub fn begin_registration(&mut self, renew: bool, token: RequestToken) -> ControlResult<RegistrationStep> {
        if self.in_flight.is_some() {
            return Err(ControlError::invalid_state(
                format!("account {}", self.id),
                "register",
                RegistrationState::Registering.to_string(),
            ));
        }
        match (self.registration.state, renew) {
            (RegistrationState::Registered, false) => return Ok(RegistrationStep::AlreadyRegistered),
            (RegistrationState::Registered, true) => {}
            (RegistrationState::Unregistered | RegistrationState::Failed, _) => {
                self.registration.state = RegistrationState::Registering;
            }
            (RegistrationState::Registering, _) => {
                return Err(ControlError::invalid_state(
                    format!("account {}", self.id),
                    "register",
                    RegistrationState::Registering.to_string(),
                ));
            }
        }
        self.in_flight = Some(token);
        Ok(RegistrationStep::Issue)
    }

    /// Apply the engine's answer to our REGISTER. Returns false for a stale token.
    pub fn finish_registration(&mut self, token: RequestToken, outcome: &Result<Value, EngineFailure>) -> bool {
        if self.in_flight != Some(token) {
            return false;
        }
        self.in_flight = None;
        match outcome {
            Ok(result) => {
                let details = result.as_map();
                let read = |key: &str| details.and_then(|m| m.get(key)).and_then(Value::as_i64);
                let code = read("code").and_then(|c| u16::try_from(c).ok()).unwrap_or(200);
                let reason = details
                    .and_then(|m| m.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("OK")
                    .to_string();
                let expires = read("expires")
                    .and_then(|e| u32::try_from(e).ok())
                    .unwrap_or(self.config.reg_timeout);
                self.set_registration(RegistrationState::Registered, code, reason, Some(expires), None);
            }
            Err(failure) => {
                self.set_registration(RegistrationState::Failed, failure.code, failure.message.clone(), None, None);
            }
        }
        true
    }

    /// Apply an unsolicited registrar update. Returns true when the state changed.
    pub fn apply_registration_update(
        &mut self,
        code: u16,
        reason: &str,
        expires: Option<u32>,
        retry_after: Option<u32>,
    ) -> bool {
        let state = match (code, expires) {
            (200..=299, Some(0)) => RegistrationState::Unregistered,
            (200..=299, _) => RegistrationState::Registered,
            _ => RegistrationState::Failed,
        };
        let changed = state != self.registration.state || Some(code) != self.registration.code;
        self.set_registration(state, code, reason.to_string(), expires, retry_after);
        changed
    }

    /// Drop any in-flight REGISTER, returning its token
    pub fn cancel_registration(&mut self) -> Option<RequestToken> {
        let token = self.in_flight.take();
        if token.is_some() && self.registration.state == RegistrationState::Registering {
            self.registration.state = RegistrationState::Unregistered;
        }
        token
    }

    fn set_registration(
        &mut self,
        state: RegistrationState,
        code: u16,
        reason: String,
        expires: Option<u32>,
        retry_after: Option<u32>,
    ) {
        self.registration = RegistrationInfo {
            state,
            code: Some(code),
            reason: Some(reason),
            expires,
            retry_after,
            updated_at: Some(Utc::now()),
        };
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            id: self.id,
            uri: self.config.uri(),
            name: self.config.name.clone(),
            username: self.config.username.clone(),
            domain: self.config.domain.clone(),
            proxy: self.config.proxy.clone(),
            transport: self.config.transport,
            stun_servers: self.config.stun_servers.clone(),
            registration: self.registration.clone(),
        }
    }
}

/// Serializable view of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub id: AccountId,
    pub uri: String,
    pub name: Option<String>,
    pub username: String,
    pub domain: String,
    pub proxy: Option<String>,
    pub transport: Option<SipTransport>,
    pub stun_servers: Vec<String>,
    pub registration: RegistrationInfo,
}

/// Hands out account ids, holding released ids back for a grace period
#[derive(Debug)]
pub struct IdAllocator {
    next: AccountId,
    retired: Vec<(AccountId, Instant)>,
    grace: Duration,
}

impl IdAllocator {
    pub fn new(grace: Duration) -> Self {
        Self {
            next: 1,
            retired: Vec::new(),
            grace,
        }
    }

    /// Lowest retired id whose grace period is over, else a fresh one
    pub fn allocate(&mut self, now: Instant) -> AccountId {
        let reusable = self
            .retired
            .iter()
            .enumerate()
            .filter(|(_, (_, released))| now.saturating_duration_since(*released) >= self.grace)
            .min_by_key(|(_, (id, _))| *id)
            .map(|(index, _)| index);

        if let Some(index) = reusable {
            return self.retired.swap_remove(index).0;
        }
        let id = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        id
    }

    pub fn release(&mut self, id: AccountId, now: Instant) {
        self.retired.push((id, now));
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }
}

/// Owns the account table
#[derive(Debug)]
pub struct AccountManager {
    accounts: DashMap<AccountId, Arc<Mutex<Account>>>,
    ids: parking_lot::Mutex<IdAllocator>,
}

impl AccountManager {
    pub fn new(id_grace_period: Duration) -> Self {
        Self {
            accounts: DashMap::new(),
            ids: parking_lot::Mutex::new(IdAllocator::new(id_grace_period)),
        }
    }

    /// Store a validated config under a fresh id, initially Unregistered
    pub fn create(&self, config: AccountConfig) -> ControlResult<AccountSnapshot> {
        config.validate()?;
        let id = self.ids.lock().allocate(Instant::now());
        let account = Account::new(id, config);
        let snapshot = account.snapshot();
        self.accounts.insert(id, Arc::new(Mutex::new(account)));
        tracing::info!(account_id = id, uri = %snapshot.uri, "Created account");
        Ok(snapshot)
    }

    pub fn get(&self, account_id: AccountId) -> ControlResult<Arc<Mutex<Account>>> {
        self.accounts
            .get(&account_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ControlError::stale_account(account_id, "unknown or deleted account"))
    }

    /// Remove the account and retire its id
    pub fn remove(&self, account_id: AccountId) -> bool {
        let removed = self.accounts.remove(&account_id).is_some();
        if removed {
            self.ids.lock().release(account_id, Instant::now());
            tracing::info!(account_id, "Removed account");
        }
        removed
    }

    pub fn contains(&self, account_id: AccountId) -> bool {
        self.accounts.contains_key(&account_id)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub async fn snapshots(&self) -> Vec<AccountSnapshot> {
        let handles: Vec<_> = self.accounts.iter().map(|entry| entry.value().clone()).collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.lock().await.snapshot());
        }
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new(1, AccountConfig::new("alice", "example.com"))
    }

    #[test]
    fn test_from_payload_requires_identity_and_server() {
        let payload: Payload = serde_json::from_str(r#"{"domain": "example.com"}"#).unwrap();
        let err = AccountConfig::from_payload(&payload).unwrap_err();
        assert!(matches!(err, ControlError::InvalidConfig { ref field, .. } if field == "username"));

        let payload: Payload = serde_json::from_str(r#"{"username": "alice", "domain": "  "}"#).unwrap();
        let err = AccountConfig::from_payload(&payload).unwrap_err();
        assert!(matches!(err, ControlError::InvalidConfig { ref field, .. } if field == "domain"));
    }

    #[test]
    fn test_from_payload_defaults() {
        let payload: Payload = serde_json::from_str(
            r#"{"username": "alice", "domain": "example.com", "transport": "TCP", "regHeaders": {"X-Tenant": "7"}}"#,
        )
        .unwrap();
        let config = AccountConfig::from_payload(&payload).unwrap();
        assert_eq!(config.uri(), "sip:alice@example.com");
        assert_eq!(config.registrar(), "sip:example.com");
        assert_eq!(config.reg_timeout, DEFAULT_REG_TIMEOUT);
        assert_eq!(config.transport, Some(SipTransport::Tcp));
        assert_eq!(config.registration_request().headers["X-Tenant"], "7");
    }

    #[test]
    fn test_register_from_unregistered_then_success() {
        let mut account = account();
        assert_eq!(account.begin_registration(false, 10).unwrap(), RegistrationStep::Issue);
        assert_eq!(account.state(), RegistrationState::Registering);

        // second attempt while in flight is rejected without touching state
        let err = account.begin_registration(true, 11).unwrap_err();
        assert_eq!(err.kind(), "InvalidState");
        assert_eq!(account.in_flight, Some(10));

        assert!(!account.finish_registration(11, &Ok(Value::Null)));
        assert!(account.finish_registration(10, &Ok(Value::Null)));
        assert_eq!(account.state(), RegistrationState::Registered);
        assert_eq!(account.registration.code, Some(200));
        assert_eq!(account.registration.expires, Some(DEFAULT_REG_TIMEOUT));
    }

    #[test]
    fn test_register_failure_then_retry() {
        let mut account = account();
        account.begin_registration(false, 1).unwrap();
        account.finish_registration(1, &Err(EngineFailure::new(403, "Forbidden")));
        assert_eq!(account.state(), RegistrationState::Failed);
        assert_eq!(account.registration.reason.as_deref(), Some("Forbidden"));

        assert_eq!(account.begin_registration(false, 2).unwrap(), RegistrationStep::Issue);
        assert_eq!(account.state(), RegistrationState::Registering);
    }

    #[test]
    fn test_renew_keeps_registered_state() {
        let mut account = account();
        account.begin_registration(false, 1).unwrap();
        account.finish_registration(1, &Ok(Value::Null));

        assert_eq!(account.begin_registration(false, 2).unwrap(), RegistrationStep::AlreadyRegistered);
        assert_eq!(account.in_flight, None);

        assert_eq!(account.begin_registration(true, 3).unwrap(), RegistrationStep::Issue);
        assert_eq!(account.state(), RegistrationState::Registered);
        assert_eq!(account.in_flight, Some(3));
    }

    #[test]
    fn test_unsolicited_updates() {
        let mut account = account();
        assert!(account.apply_registration_update(200, "OK", Some(600), None));
        assert_eq!(account.state(), RegistrationState::Registered);
        assert!(account.apply_registration_update(200, "OK", Some(0), None));
        assert_eq!(account.state(), RegistrationState::Unregistered);
        assert!(account.apply_registration_update(503, "Service Unavailable", None, Some(30)));
        assert_eq!(account.state(), RegistrationState::Failed);
        assert_eq!(account.registration.retry_after, Some(30));
    }

    #[test]
    fn test_ids_are_reused_only_after_grace() {
        let start = Instant::now();
        let mut ids = IdAllocator::new(Duration::from_secs(30));
        assert_eq!(ids.allocate(start), 1);
        assert_eq!(ids.allocate(start), 2);

        ids.release(1, start);
        assert_eq!(ids.allocate(start + Duration::from_secs(10)), 3);
        assert_eq!(ids.allocate(start + Duration::from_secs(30)), 1);
        assert_eq!(ids.retired_count(), 0);
    }

    #[tokio::test]
    async fn test_manager_create_get_remove() {
        let manager = AccountManager::new(Duration::from_secs(60));
        let first = manager.create(AccountConfig::new("alice", "example.com")).unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.registration.state, RegistrationState::Unregistered);

        assert!(manager.remove(1));
        assert_eq!(manager.get(1).unwrap_err().kind(), "StaleReference");

        // still inside the grace period, so a fresh id is handed out
        let second = manager.create(AccountConfig::new("bob", "example.com")).unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(manager.snapshots().await.len(), 1);
    }
}
