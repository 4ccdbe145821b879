//! Tagged payload values and per-action field schemas
//!
//! Command payloads arrive as string-keyed maps of loosely typed values. They
//! are checked against a [`FieldSpec`] list before anything acts on them, and
//! the typed accessors in [`PayloadFields`] then read the fields back out.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

/// Command payload: field name to value
pub type Payload = BTreeMap<String, Value>;

/// A tagged value carried in payloads, callback data and event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Treated the same as an absent field
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// The schema kind of this value, `None` for null
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(FieldKind::Boolean),
            Value::Integer(_) => Some(FieldKind::Integer),
            Value::Float(_) => Some(FieldKind::Float),
            Value::String(_) => Some(FieldKind::String),
            Value::List(_) => Some(FieldKind::List),
            Value::Map(_) => Some(FieldKind::Map),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers widen to floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Convert any serializable snapshot into a value
    pub fn from_serialize<T: Serialize>(item: &T) -> Value {
        serde_json::to_value(item)
            .ok()
            .and_then(|json| serde_json::from_value(json).ok())
            .unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

/// Type a payload field must have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    String,
    Integer,
    Boolean,
    Float,
    Map,
    List,
}

impl FieldKind {
    fn accepts(self, actual: FieldKind) -> bool {
        self == actual || (self == FieldKind::Float && actual == FieldKind::Integer)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Float => "float",
            FieldKind::Map => "mapping",
            FieldKind::List => "sequence",
        };
        f.write_str(name)
    }
}

/// One entry of an action schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind, required: true }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind, required: false }
    }
}

/// Check a payload against a schema without touching any state.
///
/// Unknown fields are ignored. A null value counts as absent.
pub fn validate(payload: &Payload, schema: &[FieldSpec]) -> ControlResult<()> {
    for spec in schema {
        match payload.get(spec.name).and_then(Value::kind) {
            None if spec.required => {
                return Err(ControlError::invalid_argument(spec.name, "required field is missing"));
            }
            None => {}
            Some(actual) if !spec.kind.accepts(actual) => {
                return Err(ControlError::invalid_argument(
                    spec.name,
                    format!("expected {}, got {}", spec.kind, actual),
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Typed reads over a validated payload
pub trait PayloadFields {
    fn field(&self, name: &str) -> Option<&Value>;

    fn opt_str(&self, name: &str) -> ControlResult<Option<&str>> {
        match self.field(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(ControlError::invalid_argument(name, "expected string")),
        }
    }

    /// Non-empty trimmed string, or `None`
    fn opt_text(&self, name: &str) -> ControlResult<Option<String>> {
        Ok(self
            .opt_str(name)?
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }

    fn opt_i64(&self, name: &str) -> ControlResult<Option<i64>> {
        match self.field(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Integer(i)) => Ok(Some(*i)),
            Some(_) => Err(ControlError::invalid_argument(name, "expected integer")),
        }
    }

    /// Entity ids are non-negative 32-bit integers
    fn id_field(&self, name: &str) -> ControlResult<u32> {
        let raw = self
            .opt_i64(name)?
            .ok_or_else(|| ControlError::invalid_argument(name, "required field is missing"))?;
        u32::try_from(raw).map_err(|_| ControlError::invalid_argument(name, format!("{} is not a valid id", raw)))
    }

    fn opt_bool(&self, name: &str) -> ControlResult<Option<bool>> {
        match self.field(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(ControlError::invalid_argument(name, "expected boolean")),
        }
    }

    fn opt_map(&self, name: &str) -> ControlResult<Option<&BTreeMap<String, Value>>> {
        match self.field(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Map(map)) => Ok(Some(map)),
            Some(_) => Err(ControlError::invalid_argument(name, "expected mapping")),
        }
    }

    /// A sequence whose items must all be strings
    fn opt_string_list(&self, name: &str) -> ControlResult<Option<Vec<String>>> {
        let items = match self.field(name) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::List(items)) => items,
            Some(_) => return Err(ControlError::invalid_argument(name, "expected sequence")),
        };
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ControlError::invalid_argument(name, "expected sequence of strings"))
            })
            .collect::<ControlResult<Vec<_>>>()
            .map(Some)
    }

    /// A mapping whose values must all be strings
    fn opt_string_map(&self, name: &str) -> ControlResult<Option<BTreeMap<String, String>>> {
        let Some(map) = self.opt_map(name)? else {
            return Ok(None);
        };
        map.iter()
            .map(|(key, value)| {
                value
                    .as_str()
                    .map(|v| (key.clone(), v.to_string()))
                    .ok_or_else(|| ControlError::invalid_argument(format!("{}.{}", name, key), "expected string"))
            })
            .collect::<ControlResult<BTreeMap<_, _>>>()
            .map(Some)
    }
}

impl PayloadFields for BTreeMap<String, Value> {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}
