//! Values, errors, settings and the host interface shared by the compiler and the runtime.

use std::cmp::Ordering;
use std::ops::Deref;
use std::sync::Arc;
use std::fmt;

use compact_str::{CompactString, format_compact, ToCompactString};
use ordered_float::NotNan;
use serde::{Serialize, Deserialize, Deserializer};
use serde_json::Value as Json;
use thiserror::Error;
use unicase::UniCase;

use crate::compiler::CompileError;
use crate::grid::Origin;
use crate::vecmap::VecMap;

/// Name of the variable that carries a function's return value back to its caller.
pub const RETURN_VAR: &str = "return";

/// Error type used when constructing a [`Number`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NumberError {
    #[error("result is not a number")]
    Nan,
    #[error("result is infinite")]
    Infinity,
}

/// The type used to represent numbers in the runtime: a finite 64-bit float without signed zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Number(NotNan<f64>);
impl Number {
    pub fn new(value: f64) -> Result<Self, NumberError> {
        if value.is_infinite() { return Err(NumberError::Infinity); }
        let value = NotNan::new(value).map_err(|_| NumberError::Nan)?;
        Ok(if value.into_inner() == 0.0 { Self::default() } else { Self(value) }) // we don't support signed zero
    }
    pub fn get(self) -> f64 {
        self.0.into_inner()
    }
    /// Parses a string into a number just as the runtime would do natively.
    /// Surrounding whitespace is ignored and `0x`/`0o`/`0b` integer prefixes are supported.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let parsed = match s.get(..2) {
            Some("0x" | "0X") => i64::from_str_radix(&s[2..], 16).ok().map(|x| x as f64),
            Some("0o" | "0O") => i64::from_str_radix(&s[2..], 8).ok().map(|x| x as f64),
            Some("0b" | "0B") => i64::from_str_radix(&s[2..], 2).ok().map(|x| x as f64),
            _ => s.parse::<f64>().ok(),
        };
        parsed.and_then(|x| Self::new(x).ok())
    }
    /// Interprets the number as a non-negative integer count, if it is one.
    pub fn as_count(self) -> Option<u64> {
        let v = self.get();
        (v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64).then_some(v as u64)
    }
}
impl From<i32> for Number { fn from(v: i32) -> Self { Self(NotNan::from(v)) } }
impl From<u32> for Number { fn from(v: u32) -> Self { Self(NotNan::from(v)) } }
impl TryFrom<f64> for Number {
    type Error = NumberError;
    fn try_from(v: f64) -> Result<Self, NumberError> { Self::new(v) }
}
impl<'de> Deserialize<'de> for Number {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = f64::deserialize(deserializer)?;
        Number::new(raw).map_err(serde::de::Error::custom)
    }
}
impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = ryu::Buffer::new();
        let res = buf.format_finite(self.get());
        f.write_str(res.strip_suffix(".0").unwrap_or(res))
    }
}

/// The kind of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Text, Number, Bool, List, Map, Item, Location, Actor, Any,
}
impl ValueKind {
    /// Parses a kind name as written in parameter specs (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        let name = UniCase::new(name.trim());
        const NAMES: &[(&str, ValueKind)] = &[
            ("text", ValueKind::Text), ("string", ValueKind::Text),
            ("number", ValueKind::Number), ("num", ValueKind::Number),
            ("bool", ValueKind::Bool), ("boolean", ValueKind::Bool),
            ("list", ValueKind::List), ("map", ValueKind::Map),
            ("item", ValueKind::Item), ("location", ValueKind::Location),
            ("actor", ValueKind::Actor), ("any", ValueKind::Any),
        ];
        NAMES.iter().find(|(n, _)| UniCase::new(*n) == name).map(|x| x.1)
    }
    /// Checks if a value of kind `other` is acceptable where this kind is expected.
    pub fn accepts(self, other: ValueKind) -> bool {
        self == ValueKind::Any || self == other
    }
}
impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::Text => "text",
            ValueKind::Number => "number",
            ValueKind::Bool => "bool",
            ValueKind::List => "list",
            ValueKind::Map => "map",
            ValueKind::Item => "item",
            ValueKind::Location => "location",
            ValueKind::Actor => "actor",
            ValueKind::Any => "any",
        })
    }
}

/// A type conversion error on a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("expected {expected}, got {got}")]
pub struct ConversionError {
    pub got: ValueKind,
    pub expected: ValueKind,
}

/// A stack of some material, as held in a container slot or referenced by a program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item {
    pub material: CompactString,
    pub amount: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<CompactString>,
}
impl Item {
    pub fn new(material: &str, amount: u32) -> Self {
        Self { material: material.into(), amount, name: None }
    }
    pub fn named(material: &str, name: &str) -> Self {
        Self { material: material.into(), amount: 1, name: Some(name.into()) }
    }
}

/// A reference to a cell in some world.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub world: CompactString,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// The stable identity of an actor (e.g., a player name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub CompactString);
impl ActorId {
    pub fn new(name: &str) -> Self {
        Self(name.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque reference to some host object, identified by type and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnyRef {
    pub type_name: CompactString,
    pub key: CompactString,
}

/// Any value that a program can hold.
///
/// Content is immutable: lists and maps are shared behind [`Arc`] and modified only through copy-on-write,
/// so cloning a value is cheap and never lets two variables observe each other's edits.
/// Reference kinds ([`Item`], [`Location`], [`ActorId`], [`AnyRef`]) are plain keys and never hold live handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    Text(CompactString),
    Number(Number),
    Bool(bool),
    List(Arc<Vec<Value>>),
    Map(Arc<VecMap<CompactString, Value, true>>),
    Item(Item),
    Location(Location),
    Actor(ActorId),
    Any(AnyRef),
}

impl From<bool> for Value { fn from(v: bool) -> Self { Value::Bool(v) } }
impl From<Number> for Value { fn from(v: Number) -> Self { Value::Number(v) } }
impl From<i32> for Value { fn from(v: i32) -> Self { Value::Number(v.into()) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::Text(v.into()) } }
impl From<CompactString> for Value { fn from(v: CompactString) -> Self { Value::Text(v) } }
impl From<Vec<Value>> for Value { fn from(v: Vec<Value>) -> Self { Value::List(Arc::new(v)) } }
impl From<VecMap<CompactString, Value, true>> for Value { fn from(v: VecMap<CompactString, Value, true>) -> Self { Value::Map(Arc::new(v)) } }
impl From<Item> for Value { fn from(v: Item) -> Self { Value::Item(v) } }
impl From<Location> for Value { fn from(v: Location) -> Self { Value::Location(v) } }
impl From<ActorId> for Value { fn from(v: ActorId) -> Self { Value::Actor(v) } }

#[derive(Clone)]
pub enum CompactCow<'a> {
    Borrowed(&'a str),
    Owned(CompactString),
}
impl Deref for CompactCow<'_> {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        match self {
            Self::Borrowed(x) => x,
            Self::Owned(x) => x,
        }
    }
}
impl CompactCow<'_> {
    pub fn into_owned(self) -> CompactString {
        match self {
            Self::Borrowed(x) => CompactString::new(x),
            Self::Owned(x) => x,
        }
    }
}

/// A failed attempt to convert a [`Json`] value into a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FromJsonError {
    #[error("json null has no value equivalent")]
    Null,
    #[error("json number is out of range")]
    BadNumber,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Text(_) => ValueKind::Text,
            Value::Number(_) => ValueKind::Number,
            Value::Bool(_) => ValueKind::Bool,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Item(_) => ValueKind::Item,
            Value::Location(_) => ValueKind::Location,
            Value::Actor(_) => ValueKind::Actor,
            Value::Any(_) => ValueKind::Any,
        }
    }
    /// Interprets this value as text. Every kind has a text form.
    pub fn as_text(&self) -> CompactCow {
        match self {
            Value::Text(x) => CompactCow::Borrowed(x),
            Value::Actor(x) => CompactCow::Borrowed(&x.0),
            Value::Any(x) => CompactCow::Borrowed(&x.key),
            x => CompactCow::Owned(x.to_compact_string()),
        }
    }
    /// Attempts to interpret this value as a number.
    /// Text is parsed, booleans map to `1`/`0` and items to their amount.
    pub fn as_number(&self) -> Result<Number, ConversionError> {
        match self {
            Value::Number(x) => Ok(*x),
            Value::Text(x) => Number::parse(x).ok_or(ConversionError { got: ValueKind::Text, expected: ValueKind::Number }),
            Value::Bool(x) => Ok(Number::from(*x as i32)),
            Value::Item(x) => Ok(Number::from(x.amount)),
            x => Err(ConversionError { got: x.kind(), expected: ValueKind::Number }),
        }
    }
    /// Attempts to interpret this value as a bool.
    /// Text accepts `true/false`, `yes/no` and `on/off` in any case; containers are true when non-empty.
    pub fn as_bool(&self) -> Result<bool, ConversionError> {
        match self {
            Value::Bool(x) => Ok(*x),
            Value::Number(x) => Ok(x.get() != 0.0),
            Value::Text(x) => {
                let x = UniCase::new(x.trim());
                if ["true", "yes", "on"].iter().any(|s| UniCase::new(*s) == x) { return Ok(true) }
                if ["false", "no", "off"].iter().any(|s| UniCase::new(*s) == x) { return Ok(false) }
                Err(ConversionError { got: ValueKind::Text, expected: ValueKind::Bool })
            }
            Value::List(x) => Ok(!x.is_empty()),
            Value::Map(x) => Ok(!x.is_empty()),
            x => Err(ConversionError { got: x.kind(), expected: ValueKind::Bool }),
        }
    }
    /// Attempts to interpret this value as a list.
    pub fn as_list(&self) -> Result<&Arc<Vec<Value>>, ConversionError> {
        match self {
            Value::List(x) => Ok(x),
            x => Err(ConversionError { got: x.kind(), expected: ValueKind::List }),
        }
    }
    /// Attempts to interpret this value as a map.
    pub fn as_map(&self) -> Result<&Arc<VecMap<CompactString, Value, true>>, ConversionError> {
        match self {
            Value::Map(x) => Ok(x),
            x => Err(ConversionError { got: x.kind(), expected: ValueKind::Map }),
        }
    }
    /// Attempts to interpret this value as an actor. Text is taken as the actor's name.
    pub fn as_actor(&self) -> Result<ActorId, ConversionError> {
        match self {
            Value::Actor(x) => Ok(x.clone()),
            Value::Text(x) if !x.is_empty() => Ok(ActorId(x.clone())),
            x => Err(ConversionError { got: x.kind(), expected: ValueKind::Actor }),
        }
    }
    /// Attempts to interpret this value as an item.
    pub fn as_item(&self) -> Result<&Item, ConversionError> {
        match self {
            Value::Item(x) => Ok(x),
            x => Err(ConversionError { got: x.kind(), expected: ValueKind::Item }),
        }
    }
    /// Attempts to interpret this value as a location.
    pub fn as_location(&self) -> Result<&Location, ConversionError> {
        match self {
            Value::Location(x) => Ok(x),
            x => Err(ConversionError { got: x.kind(), expected: ValueKind::Location }),
        }
    }
    /// Attempts to convert this value to the given kind, as done when binding function arguments.
    /// Only text to number/bool conversions are performed; everything else must match exactly.
    pub fn coerce(self, kind: ValueKind) -> Result<Value, ConversionError> {
        match (kind, &self) {
            (k, v) if k.accepts(v.kind()) => Ok(self),
            (ValueKind::Number, Value::Text(_)) => self.as_number().map(Value::Number),
            (ValueKind::Bool, Value::Text(_)) => self.as_bool().map(Value::Bool),
            (ValueKind::Actor, Value::Text(_)) => self.as_actor().map(Value::Actor),
            (ValueKind::Text, v) if matches!(v, Value::Number(_) | Value::Bool(_)) => Ok(Value::Text(self.as_text().into_owned())),
            _ => Err(ConversionError { got: self.kind(), expected: kind }),
        }
    }
    /// Deep copy: lists and maps get fresh storage all the way down; reference kinds are re-wrapped.
    pub fn copy(&self) -> Value {
        match self {
            Value::List(x) => Value::List(Arc::new(x.iter().map(Value::copy).collect())),
            Value::Map(x) => Value::Map(Arc::new(x.iter().map(|(k, v)| (k.clone(), v.copy())).collect())),
            x => x.clone(),
        }
    }
    /// Checks if the value is its kind's default representation
    /// (`""`, `0`, `false`, an empty container, or an item with no amount).
    /// References to locations, actors and host objects are never empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Text(x) => x.is_empty(),
            Value::Number(x) => x.get() == 0.0,
            Value::Bool(x) => !*x,
            Value::List(x) => x.is_empty(),
            Value::Map(x) => x.is_empty(),
            Value::Item(x) => x.amount == 0,
            Value::Location(_) | Value::Actor(_) | Value::Any(_) => false,
        }
    }
    /// Checks if the value still refers to something live.
    pub fn is_valid(&self, host: &dyn Host) -> bool {
        match self {
            Value::Actor(x) => host.is_connected(x),
            Value::Location(x) => host.world_exists(&x.world),
            Value::Item(x) => x.amount > 0,
            _ => true,
        }
    }
    /// Loose equality used by programs: numbers compare numerically across text/bool forms and text compares case-insensitively.
    pub fn loose_eq(&self, other: &Value) -> bool {
        let scalar = |v: &Value| matches!(v, Value::Text(_) | Value::Number(_) | Value::Bool(_));
        if scalar(self) && scalar(other) {
            if let (Ok(a), Ok(b)) = (self.as_number(), other.as_number()) { return a == b }
            if matches!(self, Value::Bool(_)) || matches!(other, Value::Bool(_)) {
                if let (Ok(a), Ok(b)) = (self.as_bool(), other.as_bool()) { return a == b }
            }
            return UniCase::new(&*self.as_text()) == UniCase::new(&*other.as_text());
        }
        self == other
    }
    /// Orders two values: numerically if both are numeric, otherwise case-insensitively as text.
    pub fn compare(&self, other: &Value) -> Result<Ordering, ErrorCause> {
        if let (Ok(a), Ok(b)) = (self.as_number(), other.as_number()) {
            return Ok(a.cmp(&b));
        }
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Ok(UniCase::new(a.as_str()).cmp(&UniCase::new(b.as_str()))),
            _ => Err(ErrorCause::Incomparable { left: self.kind(), right: other.kind() }),
        }
    }

    /// Converts plain json into a value: arrays become lists and objects become maps.
    pub fn from_json(value: Json) -> Result<Value, FromJsonError> {
        Ok(match value {
            Json::Null => return Err(FromJsonError::Null),
            Json::Bool(x) => Value::Bool(x),
            Json::Number(x) => Value::Number(x.as_f64().and_then(|x| Number::new(x).ok()).ok_or(FromJsonError::BadNumber)?),
            Json::String(x) => Value::Text(x.into()),
            Json::Array(x) => Value::List(Arc::new(x.into_iter().map(Value::from_json).collect::<Result<_, _>>()?)),
            Json::Object(x) => Value::Map(Arc::new(x.into_iter().map(|(k, v)| Ok((CompactString::from(k), Value::from_json(v)?))).collect::<Result<_, FromJsonError>>()?)),
        })
    }
    /// Converts this value into plain json. Reference kinds become their structural key form.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Text(x) => Json::String(x.to_string()),
            Value::Number(x) => serde_json::Number::from_f64(x.get()).map(Json::Number).unwrap_or(Json::Null),
            Value::Bool(x) => Json::Bool(*x),
            Value::List(x) => Json::Array(x.iter().map(Value::to_json).collect()),
            Value::Map(x) => Json::Object(x.iter().map(|(k, v)| (k.to_string(), v.to_json())).collect()),
            Value::Item(x) => serde_json::json!({ "material": x.material.as_str(), "amount": x.amount, "name": x.name.as_deref() }),
            Value::Location(x) => serde_json::json!({ "world": x.world.as_str(), "x": x.x, "y": x.y, "z": x.z }),
            Value::Actor(x) => Json::String(x.0.to_string()),
            Value::Any(x) => Json::String(x.key.to_string()),
        }
    }
}
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(x) => f.write_str(x),
            Value::Number(x) => write!(f, "{x}"),
            Value::Bool(x) => write!(f, "{x}"),
            Value::List(x) => {
                f.write_str("[")?;
                for (i, v) in x.iter().enumerate() {
                    if i != 0 { f.write_str(", ")?; }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Value::Map(x) => {
                f.write_str("{")?;
                for (i, (k, v)) in x.iter().enumerate() {
                    if i != 0 { f.write_str(", ")?; }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Item(x) => match &x.name {
                Some(name) => write!(f, "{name} ({} x{})", x.material, x.amount),
                None => write!(f, "{} x{}", x.material, x.amount),
            }
            Value::Location(x) => write!(f, "{}({}, {}, {})", x.world, x.x, x.y, x.z),
            Value::Actor(x) => f.write_str(&x.0),
            Value::Any(x) => f.write_str(&x.key),
        }
    }
}

/// The cause/explanation of a node-level execution error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorCause {
    /// A variable lookup operation failed.
    #[error("undefined variable `{name}`")]
    UndefinedVariable { name: CompactString },
    /// An action was missing a parameter it needs.
    #[error("missing parameter `{name}`")]
    MissingParameter { name: CompactString },
    /// The result of a failed type conversion.
    #[error("expected {expected}, got {got}")]
    ConversionError { got: ValueKind, expected: ValueKind },
    /// Attempt to compare incomparable kinds.
    #[error("cannot compare {left} with {right}")]
    Incomparable { left: ValueKind, right: ValueKind },
    /// A numeric value took on an invalid value such as NaN.
    #[error("{error}")]
    NumberError { error: NumberError },
    /// A count (e.g., of loop iterations or wait ticks) was not a non-negative integer.
    #[error("`{value}` is not a valid count")]
    InvalidCount { value: f64 },
    /// An indexing operation was out of bounds (indices are 1-based).
    #[error("index {index} is out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    /// A parameter formula could not be parsed.
    #[error("bad formula `{formula}`: {msg}")]
    BadFormula { formula: CompactString, msg: CompactString },
    /// A comparison operator name was not recognized.
    #[error("unknown operator `{op}`")]
    UnknownOperator { op: CompactString },
    /// No handler exists for the action, neither built-in nor in the host.
    #[error("unsupported action `{action}`")]
    NotSupported { action: CompactString },
    /// The host reported a failure while performing an action.
    #[error("{msg}")]
    Host { msg: CompactString },
}
impl From<ConversionError> for ErrorCause { fn from(e: ConversionError) -> Self { Self::ConversionError { got: e.got, expected: e.expected } } }
impl From<NumberError> for ErrorCause { fn from(error: NumberError) -> Self { Self::NumberError { error } } }

/// A node-level runtime failure, along with the action that caused it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{action}: {cause}")]
pub struct ExecError {
    pub cause: ErrorCause,
    pub action: CompactString,
}

/// A bad function registration or bad call arguments.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("`{name}` is not a valid function name")]
    InvalidName { name: CompactString },
    #[error("`{name}` is not a valid parameter name")]
    InvalidParameterName { name: CompactString },
    #[error("parameter `{name}` is declared more than once")]
    DuplicateParameter { name: CompactString },
    #[error("optional parameter `{name}` needs a default value")]
    MissingDefault { name: CompactString },
    #[error("required parameter `{name}` cannot have a default value")]
    RequiredWithDefault { name: CompactString },
    #[error("default for `{name}` must be {expected}, got {got}")]
    DefaultKind { name: CompactString, expected: ValueKind, got: ValueKind },
    #[error("bad parameter spec `{text}`")]
    BadParameterSpec { text: CompactString },
    #[error("function `{name}` already exists")]
    DuplicateFunction { name: CompactString },
    #[error("shared function `{name}` is already owned by {owner}")]
    SharedNameTaken { name: CompactString, owner: ActorId },
    #[error("function `{name}` belongs to {owner}")]
    OwnedByOther { name: CompactString, owner: ActorId },
    #[error("program is not a function definition")]
    NotAFunction,
    #[error("program is not an event handler")]
    NotAnEvent,
    #[error("function `{name}` is not defined")]
    UnknownFunction { name: CompactString },
    #[error("{function}: missing required argument `{name}`")]
    MissingArgument { function: CompactString, name: CompactString },
    #[error("{function}: unexpected argument `{name}`")]
    UnexpectedArgument { function: CompactString, name: CompactString },
    #[error("{function}: too many arguments (expected at most {expected}, got {got})")]
    TooManyArguments { function: CompactString, expected: usize, got: usize },
    #[error("{function}: argument `{name}` must be {expected}, got {got}")]
    ArgumentKind { function: CompactString, name: CompactString, expected: ValueKind, got: ValueKind },
}

/// A recursion, concurrency, time or scheduling bound was exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceLimitError {
    #[error("{function}: call depth limit of {limit} exceeded")]
    CallDepth { function: CompactString, limit: usize },
    #[error("too many active function calls (limit {limit}), try again later")]
    Concurrency { limit: usize },
    #[error("{function}: exceeded time limit of {limit_ms}ms")]
    Timeout { function: CompactString, limit_ms: u64 },
    #[error("{actor} has too many suspended programs (limit {limit})")]
    Suspensions { actor: ActorId, limit: usize },
    #[error("program exceeded {limit} steps in a single tick")]
    Steps { limit: usize },
}

/// Why a run was stopped from the outside.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelReason {
    #[error("stopped")]
    Stopped,
    #[error("{actor} disconnected")]
    Disconnected { actor: ActorId },
    #[error("engine shut down")]
    Shutdown,
}

/// The top-level error taxonomy surfaced to whoever triggered a program.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("compilation error: {0}")]
    Compilation(#[from] CompileError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("execution error: {0}")]
    Execution(#[from] ExecError),
    #[error("resource limit: {0}")]
    ResourceLimit(#[from] ResourceLimitError),
    #[error("cancelled: {0}")]
    Cancelled(#[from] CancelReason),
}
impl Error {
    /// Checks if retrying the same request later could succeed without any change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResourceLimit(ResourceLimitError::Concurrency { .. }))
    }
}

/// Settings to use for the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// The call depth used for functions that do not configure their own (default `32`).
    pub max_call_depth: usize,
    /// The maximum number of function calls active at once across all actors (default `256`).
    pub max_active_calls: usize,
    /// The maximum number of suspended runs per actor (default `64`).
    pub max_suspensions_per_actor: usize,
    /// The maximum number of nodes a single run may execute in one tick (default `10000`).
    pub max_steps_per_tick: usize,
    /// The time limit used for functions that do not configure their own (default `5000`).
    pub call_timeout_ms: u64,
    /// The iteration limit of `while` loops that do not configure their own (default `10000`).
    pub max_loop_iterations: u64,
    /// Runs that execute at least this many nodes in one tick are recorded as bottlenecks (default `1000`).
    pub bottleneck_steps: usize,
    /// Seed for the `random` formula function; [`None`] seeds from the clock (default [`None`]).
    pub rng_seed: Option<u64>,
}
impl Default for Settings {
    fn default() -> Self {
        Self {
            max_call_depth: 32,
            max_active_calls: 256,
            max_suspensions_per_actor: 64,
            max_steps_per_tick: 10_000,
            call_timeout_ms: 5_000,
            max_loop_iterations: 10_000,
            bottleneck_steps: 1_000,
            rng_seed: None,
        }
    }
}
impl Settings {
    /// Loads settings from json; missing fields keep their defaults.
    pub fn from_json(src: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(src)
    }
}

/// Holds a collection of variables in an execution context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolTable(VecMap<CompactString, Value, true>);
impl SymbolTable {
    /// Defines or redefines a variable in the symbol table.
    pub fn define_or_redefine(&mut self, var: &str, value: Value) {
        self.0.insert(CompactString::new(var), value);
    }
    /// Looks up the given variable in the symbol table.
    /// If a variable with the given name does not exist, returns [`None`].
    pub fn lookup(&self, var: &str) -> Option<&Value> {
        self.0.get(var)
    }
    /// Equivalent to [`SymbolTable::lookup`] except that it returns a mutable reference.
    pub fn lookup_mut(&mut self, var: &str) -> Option<&mut Value> {
        self.0.get_mut(var)
    }
    /// Removes a variable, returning its last value.
    pub fn remove(&mut self, var: &str) -> Option<Value> {
        self.0.remove(var)
    }
    /// Gets the number of symbols currently stored in the symbol table.
    pub fn len(&self) -> usize {
        self.0.len()
    }
    /// Checks if the symbol table is currently empty (no defined symbols).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    /// Iterates over the key value pairs stored in the symbol table.
    pub fn iter(&self) -> crate::vecmap::Iter<CompactString, Value> {
        self.0.iter()
    }
}

/// A request for the host to perform an action the runtime does not handle itself.
pub struct ActionRequest<'a> {
    pub actor: &'a ActorId,
    pub origin: &'a Origin,
    pub action: &'a str,
    pub args: &'a VecMap<CompactString, Value, false>,
}
impl fmt::Debug for ActionRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.args.iter().map(|(k, v)| format_compact!("{k}={v}")).collect::<Vec<_>>();
        write!(f, "{} {} {:?}", self.actor, self.action, args)
    }
}

/// The capabilities the runtime needs from the world it is embedded in.
pub trait Host {
    /// Checks if the actor is currently connected.
    fn is_connected(&self, actor: &ActorId) -> bool;
    /// Checks if the world exists (default: always).
    fn world_exists(&self, world: &str) -> bool {
        let _ = world;
        true
    }
    /// Performs an action with side effects in the world.
    /// The returned value, if any, is stored in the variable named by the node's `result` parameter.
    fn perform_action(&mut self, request: ActionRequest<'_>) -> Result<Option<Value>, ErrorCause>;
    /// Evaluates a condition that only the host can answer (default: unsupported).
    fn check_condition(&mut self, request: ActionRequest<'_>) -> Result<bool, ErrorCause> {
        Err(ErrorCause::NotSupported { action: request.action.into() })
    }
    /// Shows a message to the actor (default: ignored).
    fn print(&mut self, actor: &ActorId, text: &str) {
        let _ = (actor, text);
    }
}

/// The lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Running,
    Suspended,
    Branching,
    Looping,
    Completed,
    Failed,
    Cancelled,
}
impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }
}
