//! Call-control: command dispatch and session state for SIP clients
//!
//! This crate owns the call-control logic of a SIP user agent: it accepts
//! commands from a UI layer, keeps per-account registration state and per-call
//! state machines, and drives an external telephony engine that does the actual
//! signaling and media.
//!
//! ## Layering
//! ```text
//! UI / plugin bridge --Command--> Dispatcher --EngineRequest--> TelephonyEngine
//!         ^                           |  ^                            |
//!         +-------ControlEvent--------+  +-----EngineMessage----------+
//! ```
//!
//! Call-control focuses on:
//! - Validating commands against per-action schemas
//! - Account registration lifecycle
//! - Call state transitions and their guards
//! - Exactly one callback result per command
//! - Ordered events for the UI
//!
//! SIP transport, parsing and media are the engine's job and are reached only
//! through [`TelephonyEngine`].

pub mod account;
pub mod call;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod value;

// Public API exports
pub use account::{AccountConfig, AccountId, AccountSnapshot, RegistrationInfo, RegistrationState, SipTransport};
pub use call::{CallDirection, CallId, CallSettings, CallSnapshot, CallState, SipMessageData};
pub use command::{Action, CallbackId, CallbackResult, Command, Request};
pub use config::{CodecSettings, ControlConfig, NetworkConfig, ServiceConfig};
pub use dispatcher::{Dispatcher, DispatcherBuilder, Submission};
pub use engine::{
    EngineAck, EngineFailure, EngineHandle, EngineInbox, EngineMessage, EngineNotification, EngineRequest,
    RequestToken, TelephonyEngine,
};
pub use error::{ControlError, ControlResult, ErrorReport};
pub use events::{
    ControlEvent, ControlEventHandler, EventFilter, EventKind, EventSubscription, MessageInfo, ServiceSnapshot,
    TransferLink,
};
pub use value::{Payload, Value};

/// Call-control version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
