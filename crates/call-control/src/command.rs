//! Commands from the UI layer and their callback results
//!
//! A [`Command`] is `{action, callbackId, payload}`. [`Command::parse`] checks
//! the action name, validates the payload against the action's schema and
//! produces a typed [`Request`]. Nothing is mutated on the way.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::account::{AccountConfig, AccountId};
use crate::call::{CallId, CallSettings, SipMessageData};
use crate::config::CodecSettings;
use crate::error::{ControlError, ControlResult, ErrorReport};
use crate::value::{validate, FieldKind, FieldSpec, Payload, PayloadFields, Value};

/// Correlates a command with its single callback result
pub type CallbackId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Start,
    SetServiceConfiguration,
    AccountCreate,
    AccountRegister,
    AccountDelete,
    UpdateStunServers,
    CallMake,
    CallAnswer,
    CallDecline,
    CallHangup,
    CallRinging,
    CallProgress,
    CallHold,
    CallUnhold,
    CallMute,
    CallUnmute,
    CallUseSpeaker,
    CallUseEarpiece,
    CallXfer,
    CallXferReplace,
    CallRedirect,
    CallDtmf,
    ChangeCodecSettings,
    ChangeNetworkConfiguration,
}

use FieldKind::{Boolean, Integer, List, Map, String as Text};

const NO_FIELDS: &[FieldSpec] = &[];
const SERVICE_FIELDS: &[FieldSpec] = &[
    FieldSpec::optional("userAgent", Text),
    FieldSpec::optional("stunServers", List),
];
const ACCOUNT_CREATE_FIELDS: &[FieldSpec] = &[
    FieldSpec::optional("name", Text),
    FieldSpec::optional("username", Text),
    FieldSpec::optional("domain", Text),
    FieldSpec::optional("password", Text),
    FieldSpec::optional("proxy", Text),
    FieldSpec::optional("transport", Text),
    FieldSpec::optional("regServer", Text),
    FieldSpec::optional("regTimeout", Integer),
    FieldSpec::optional("regHeaders", Map),
    FieldSpec::optional("regContactParams", Text),
];
const ACCOUNT_REGISTER_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("account_id", Integer),
    FieldSpec::optional("renew", Boolean),
];
const ACCOUNT_FIELDS: &[FieldSpec] = &[FieldSpec::required("account_id", Integer)];
const STUN_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("account_id", Integer),
    FieldSpec::required("stun_server_list", List),
];
const MAKE_CALL_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("account_id", Integer),
    FieldSpec::required("destination", Text),
    FieldSpec::optional("call_settings", Map),
    FieldSpec::optional("msg_data", Map),
];
const CALL_FIELDS: &[FieldSpec] = &[FieldSpec::required("call_id", Integer)];
const CALL_DESTINATION_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("call_id", Integer),
    FieldSpec::required("destination", Text),
];
const XFER_REPLACE_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("call_id", Integer),
    FieldSpec::required("dest_call_id", Integer),
];
const DTMF_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("call_id", Integer),
    FieldSpec::required("digits", Text),
];
const CONFIGURATION_FIELDS: &[FieldSpec] = &[FieldSpec::required("configuration", Map)];

impl Action {
    pub const ALL: [Action; 24] = [
        Action::Start,
        Action::SetServiceConfiguration,
        Action::AccountCreate,
        Action::AccountRegister,
        Action::AccountDelete,
        Action::UpdateStunServers,
        Action::CallMake,
        Action::CallAnswer,
        Action::CallDecline,
        Action::CallHangup,
        Action::CallRinging,
        Action::CallProgress,
        Action::CallHold,
        Action::CallUnhold,
        Action::CallMute,
        Action::CallUnmute,
        Action::CallUseSpeaker,
        Action::CallUseEarpiece,
        Action::CallXfer,
        Action::CallXferReplace,
        Action::CallRedirect,
        Action::CallDtmf,
        Action::ChangeCodecSettings,
        Action::ChangeNetworkConfiguration,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::SetServiceConfiguration => "set_service_configuration",
            Action::AccountCreate => "account_create",
            Action::AccountRegister => "account_register",
            Action::AccountDelete => "account_delete",
            Action::UpdateStunServers => "update_stun_servers",
            Action::CallMake => "call_make",
            Action::CallAnswer => "call_answer",
            Action::CallDecline => "call_decline",
            Action::CallHangup => "call_hangup",
            Action::CallRinging => "call_ringing",
            Action::CallProgress => "call_progress",
            Action::CallHold => "call_hold",
            Action::CallUnhold => "call_unhold",
            Action::CallMute => "call_mute",
            Action::CallUnmute => "call_unmute",
            Action::CallUseSpeaker => "call_use_speaker",
            Action::CallUseEarpiece => "call_use_earpiece",
            Action::CallXfer => "call_xfer",
            Action::CallXferReplace => "call_xfer_replace",
            Action::CallRedirect => "call_redirect",
            Action::CallDtmf => "call_dtmf",
            Action::ChangeCodecSettings => "change_codec_settings",
            Action::ChangeNetworkConfiguration => "change_network_configuration",
        }
    }

    pub fn schema(&self) -> &'static [FieldSpec] {
        match self {
            Action::Start | Action::SetServiceConfiguration => SERVICE_FIELDS,
            Action::AccountCreate => ACCOUNT_CREATE_FIELDS,
            Action::AccountRegister => ACCOUNT_REGISTER_FIELDS,
            Action::AccountDelete => ACCOUNT_FIELDS,
            Action::UpdateStunServers => STUN_FIELDS,
            Action::CallMake => MAKE_CALL_FIELDS,
            Action::CallXfer | Action::CallRedirect => CALL_DESTINATION_FIELDS,
            Action::CallXferReplace => XFER_REPLACE_FIELDS,
            Action::CallDtmf => DTMF_FIELDS,
            Action::ChangeCodecSettings | Action::ChangeNetworkConfiguration => CONFIGURATION_FIELDS,
            Action::CallAnswer
            | Action::CallDecline
            | Action::CallHangup
            | Action::CallRinging
            | Action::CallProgress
            | Action::CallHold
            | Action::CallUnhold
            | Action::CallMute
            | Action::CallUnmute
            | Action::CallUseSpeaker
            | Action::CallUseEarpiece => CALL_FIELDS,
        }
    }
}

impl FromStr for Action {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| ControlError::unknown_action(s))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command as received from the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub action: String,
    pub callback_id: CallbackId,
    #[serde(default)]
    pub payload: Payload,
}

impl Command {
    pub fn new(action: impl Into<String>, callback_id: CallbackId) -> Self {
        Self {
            action: action.into(),
            callback_id,
            payload: Payload::new(),
        }
    }

    /// Add a payload field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn action(&self) -> ControlResult<Action> {
        self.action.parse()
    }

    /// Resolve the action, validate the payload and build the typed request
    pub fn parse(&self) -> ControlResult<Request> {
        let action = self.action()?;
        validate(&self.payload, action.schema())?;
        Request::from_payload(action, &self.payload)
    }
}

/// Typed, validated command
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Start { service: Payload },
    SetServiceConfiguration { service: Payload },
    CreateAccount { config: AccountConfig },
    RegisterAccount { account_id: AccountId, renew: bool },
    DeleteAccount { account_id: AccountId },
    UpdateStunServers { account_id: AccountId, servers: Vec<String> },
    MakeCall {
        account_id: AccountId,
        destination: String,
        settings: CallSettings,
        message: Option<SipMessageData>,
    },
    Answer { call_id: CallId },
    Decline { call_id: CallId },
    Hangup { call_id: CallId },
    Ringing { call_id: CallId },
    Progress { call_id: CallId },
    Hold { call_id: CallId },
    Unhold { call_id: CallId },
    Mute { call_id: CallId, muted: bool },
    Speaker { call_id: CallId, speaker: bool },
    Transfer { call_id: CallId, destination: String },
    TransferReplace { call_id: CallId, dest_call_id: CallId },
    Redirect { call_id: CallId, destination: String },
    Dtmf { call_id: CallId, digits: String },
    ChangeCodecSettings { settings: CodecSettings },
    ChangeNetworkConfiguration { configuration: BTreeMap<String, Value> },
}

impl Request {
    fn from_payload(action: Action, payload: &Payload) -> ControlResult<Self> {
        let call_id = || payload.id_field("call_id");
        let account_id = || payload.id_field("account_id");

        let request = match action {
            Action::Start => Request::Start { service: payload.clone() },
            Action::SetServiceConfiguration => Request::SetServiceConfiguration { service: payload.clone() },
            Action::AccountCreate => Request::CreateAccount {
                config: AccountConfig::from_payload(payload)?,
            },
            Action::AccountRegister => Request::RegisterAccount {
                account_id: account_id()?,
                renew: payload.opt_bool("renew")?.unwrap_or(false),
            },
            Action::AccountDelete => Request::DeleteAccount { account_id: account_id()? },
            Action::UpdateStunServers => {
                let servers = payload.opt_string_list("stun_server_list")?.unwrap_or_default();
                if servers.iter().any(|s| s.trim().is_empty()) {
                    return Err(ControlError::invalid_argument("stun_server_list", "empty server entry"));
                }
                Request::UpdateStunServers {
                    account_id: account_id()?,
                    servers,
                }
            }
            Action::CallMake => Request::MakeCall {
                account_id: account_id()?,
                destination: non_empty(payload, "destination")?,
                settings: payload
                    .opt_map("call_settings")?
                    .map(CallSettings::from_payload)
                    .transpose()?
                    .unwrap_or_default(),
                message: payload.opt_map("msg_data")?.map(SipMessageData::from_payload).transpose()?,
            },
            Action::CallAnswer => Request::Answer { call_id: call_id()? },
            Action::CallDecline => Request::Decline { call_id: call_id()? },
            Action::CallHangup => Request::Hangup { call_id: call_id()? },
            Action::CallRinging => Request::Ringing { call_id: call_id()? },
            Action::CallProgress => Request::Progress { call_id: call_id()? },
            Action::CallHold => Request::Hold { call_id: call_id()? },
            Action::CallUnhold => Request::Unhold { call_id: call_id()? },
            Action::CallMute => Request::Mute { call_id: call_id()?, muted: true },
            Action::CallUnmute => Request::Mute { call_id: call_id()?, muted: false },
            Action::CallUseSpeaker => Request::Speaker { call_id: call_id()?, speaker: true },
            Action::CallUseEarpiece => Request::Speaker { call_id: call_id()?, speaker: false },
            Action::CallXfer => Request::Transfer {
                call_id: call_id()?,
                destination: transfer_target(payload)?,
            },
            Action::CallRedirect => Request::Redirect {
                call_id: call_id()?,
                destination: transfer_target(payload)?,
            },
            Action::CallXferReplace => {
                let call_id = call_id()?;
                let dest_call_id = payload.id_field("dest_call_id")?;
                if call_id == dest_call_id {
                    return Err(ControlError::invalid_argument("dest_call_id", "cannot replace a call with itself"));
                }
                Request::TransferReplace { call_id, dest_call_id }
            }
            Action::CallDtmf => Request::Dtmf {
                call_id: call_id()?,
                digits: dtmf_digits(payload)?,
            },
            Action::ChangeCodecSettings => Request::ChangeCodecSettings {
                settings: CodecSettings::from_payload(payload.opt_map("configuration")?.unwrap_or(&BTreeMap::new()))?,
            },
            Action::ChangeNetworkConfiguration => Request::ChangeNetworkConfiguration {
                configuration: payload.opt_map("configuration")?.cloned().unwrap_or_default(),
            },
        };
        Ok(request)
    }
}

fn non_empty(payload: &Payload, field: &str) -> ControlResult<String> {
    payload
        .opt_text(field)?
        .ok_or_else(|| ControlError::invalid_argument(field, "must not be empty"))
}

/// Transfer and redirect targets must be SIP or tel URIs
fn transfer_target(payload: &Payload) -> ControlResult<String> {
    let target = non_empty(payload, "destination")?;
    if !(target.starts_with("sip:") || target.starts_with("sips:") || target.starts_with("tel:")) {
        return Err(ControlError::invalid_argument(
            "destination",
            format!("{:?} must be a sip:, sips: or tel: URI", target),
        ));
    }
    Ok(target)
}

fn dtmf_digits(payload: &Payload) -> ControlResult<String> {
    let digits = non_empty(payload, "digits")?;
    if let Some(bad) = digits
        .chars()
        .find(|c| !(c.is_ascii_digit() || matches!(c, 'A'..='D' | 'a'..='d' | '*' | '#')))
    {
        return Err(ControlError::invalid_argument("digits", format!("invalid DTMF digit {:?}", bad)));
    }
    Ok(digits.to_ascii_uppercase())
}

/// The single outcome reported for a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResult {
    pub callback_id: CallbackId,
    pub successful: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl CallbackResult {
    pub fn success(callback_id: CallbackId, data: Value) -> Self {
        Self {
            callback_id,
            successful: true,
            data,
            error: None,
        }
    }

    pub fn failure(callback_id: CallbackId, error: &ControlError) -> Self {
        Self {
            callback_id,
            successful: false,
            data: Value::Null,
            error: Some(error.report()),
        }
    }

    pub fn from_result(callback_id: CallbackId, result: &ControlResult<Value>) -> Self {
        match result {
            Ok(data) => Self::success(callback_id, data.clone()),
            Err(e) => Self::failure(callback_id, e),
        }
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_round_trip() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        let err = "call_teleport".parse::<Action>().unwrap_err();
        assert_eq!(err, ControlError::unknown_action("call_teleport"));
    }

    #[test]
    fn test_command_deserializes_from_wire_shape() {
        let command: Command =
            serde_json::from_str(r#"{"action": "call_dtmf", "callbackId": 42, "payload": {"call_id": 3, "digits": "12#a"}}"#)
                .unwrap();
        assert_eq!(command.callback_id, 42);
        assert_eq!(
            command.parse().unwrap(),
            Request::Dtmf {
                call_id: 3,
                digits: "12#A".into()
            }
        );
    }

    #[test]
    fn test_missing_and_mistyped_fields() {
        let missing = Command::new("call_answer", 1).parse().unwrap_err();
        assert_eq!(missing.kind(), "InvalidArgument");

        let mistyped = Command::new("account_register", 2)
            .with("account_id", 1i64)
            .with("renew", "yes")
            .parse()
            .unwrap_err();
        assert!(matches!(mistyped, ControlError::InvalidArgument { ref field, .. } if field == "renew"));
    }

    #[test]
    fn test_account_create_distinguishes_config_errors() {
        let err = Command::new("account_create", 1).with("domain", "example.com").parse().unwrap_err();
        assert_eq!(err.kind(), "InvalidConfig");

        let err = Command::new("account_create", 1).with("username", 5i64).parse().unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[test]
    fn test_call_make_defaults() {
        let request = Command::new("call_make", 1)
            .with("account_id", 1i64)
            .with("destination", "+15551234")
            .parse()
            .unwrap();
        match request {
            Request::MakeCall { settings, message, .. } => {
                assert_eq!(settings, CallSettings::default());
                assert!(message.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transfer_validation() {
        let bad = Command::new("call_xfer", 1)
            .with("call_id", 1i64)
            .with("destination", "bob")
            .parse()
            .unwrap_err();
        assert_eq!(bad.kind(), "InvalidArgument");

        let same = Command::new("call_xfer_replace", 1)
            .with("call_id", 4i64)
            .with("dest_call_id", 4i64)
            .parse()
            .unwrap_err();
        assert_eq!(same.kind(), "InvalidArgument");

        let dtmf = Command::new("call_dtmf", 1)
            .with("call_id", 1i64)
            .with("digits", "12x")
            .parse()
            .unwrap_err();
        assert!(dtmf.to_string().contains("'x'"));
    }

    #[test]
    fn test_callback_result_serialization() {
        let ok = CallbackResult::success(7, Value::from(1u32));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["callbackId"], 7);
        assert_eq!(json["successful"], true);
        assert!(json.get("error").is_none());

        let failed = CallbackResult::failure(8, &ControlError::unknown_action("nope"));
        assert_eq!(failed.error_kind(), Some("UnknownAction"));
        assert_eq!(serde_json::to_value(&failed).unwrap()["error"]["kind"], "UnknownAction");
    }
}
