//! Shared protocol types for communication between the `canoe-link` client
//! and the Windows COM bridge process that holds the `CANoe.Application`
//! object.
//!
//! The protocol is JSON-over-stdio: one JSON object per line in each direction.
//! Remote objects never cross the wire; the bridge hands out `u64` handles and
//! keeps the `IDispatch` pointers in its own table until `Release`.

use serde::{Deserialize, Serialize};

/// Handle to a remote object (namespace, variable, CAPL function) issued by the bridge.
pub type ObjectHandle = u64;

/// A command sent from the client to the bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Monotonically increasing request ID for correlating responses.
    pub id: u64,
    /// The command to execute.
    #[serde(flatten)]
    pub command: Command,
}

/// Commands the client can send to the bridge.
///
/// `parent: None` addresses the root namespace collection (`Application.System.Namespaces`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum Command {
    /// Initialize COM and attach to (or launch) the application. Returns its identity.
    Init { prog_id: String },

    /// List the namespaces directly below `parent`.
    Namespaces { parent: Option<ObjectHandle> },

    /// Look up one namespace by name below `parent`.
    FindNamespace {
        parent: Option<ObjectHandle>,
        name: String,
    },

    /// Create a namespace below `parent`.
    AddNamespace {
        parent: Option<ObjectHandle>,
        name: String,
    },

    /// List the variables of a namespace.
    Variables { namespace: ObjectHandle },

    /// Look up one variable by name inside a namespace.
    FindVariable {
        namespace: ObjectHandle,
        name: String,
    },

    /// Create a variable inside a namespace with an initial value.
    AddVariable {
        namespace: ObjectHandle,
        name: String,
        initial: Value,
    },

    /// Read a variable's current value.
    GetValue { variable: ObjectHandle },

    /// Write a variable's value.
    SetValue { variable: ObjectHandle, value: Value },

    /// Look up a CAPL function by name.
    FindProcedure { name: String },

    /// Call a previously looked-up CAPL function.
    CallProcedure {
        procedure: ObjectHandle,
        args: Vec<Value>,
    },

    /// Query whether the measurement is running.
    MeasurementRunning,

    /// Start the measurement.
    StartMeasurement,

    /// Stop the measurement.
    StopMeasurement,

    /// Drop every handle, uninitialize COM and exit. The application keeps running.
    Release,
}

/// A scalar value exchanged with the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

/// Identity of the attached application, recorded for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    pub name: String,
    pub version: String,
}

/// A named child object in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub handle: ObjectHandle,
    pub name: String,
}

/// A response sent from the bridge back to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The request ID this response corresponds to.
    pub id: u64,
    /// The result of the command.
    #[serde(flatten)]
    pub result: ResponseResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ResponseResult {
    #[serde(rename = "ok")]
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Data returned in successful responses.
///
/// Externally tagged so that `{"lookup":null}` (a miss) can never be confused
/// with a handle or an empty listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseData {
    Identity(AppIdentity),
    Handle(ObjectHandle),
    Lookup(Option<ObjectHandle>),
    Entries(Vec<Entry>),
    Value(Value),
    Flag(bool),
}

impl Response {
    pub fn ok(id: u64, data: Option<ResponseData>) -> Self {
        Self {
            id,
            result: ResponseResult::Ok { data },
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: ResponseResult::Error {
                message: message.into(),
            },
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value. Booleans are not numbers here.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Name of the value's kind, used in type-mismatch diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
        }
    }

    /// Parse operator input: `true`/`false`, then a number, otherwise a string.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        match trimmed.parse::<f64>() {
            Ok(n) => Value::Number(n),
            Err(_) => Value::String(text.to_string()),
        }
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

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "<empty>"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
        }
    }
}
