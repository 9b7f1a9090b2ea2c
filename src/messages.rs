//! Message types exchanged between the pool and its workers, plus the
//! MessagePack encoding helpers used on every channel.
//!
//! Each worker has one duplex channel. The pool writes [`PoolFrame`]s
//! (lifecycle control and calls) and the worker answers with
//! [`WorkerFrame`]s (one readiness signal, then one [`Response`] per call).
//! Process workers carry these frames over their bridge connection, so the
//! child's stdio stays free for the module.
//!
//! Payload values are [`rmpv::Value`], so binary buffers survive the trip
//! byte-for-byte.

use std::collections::BTreeMap;

use rmpv::Value;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Method name used when the module itself is the callable.
pub const MODULE_EXPORT: &str = "__module__";

/// Errors that can occur during message encoding/decoding
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Frame of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { length: usize, limit: usize },
}

/// A call sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub call_id: u64,
    pub worker_id: u64,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Outcome of exactly one [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub call_id: u64,
    pub worker_id: u64,
    #[serde(default = "nil")]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

fn nil() -> Value {
    Value::Nil
}

impl Response {
    pub fn success(call_id: u64, worker_id: u64, result: Value) -> Self {
        Self {
            call_id,
            worker_id,
            result,
            error: None,
        }
    }

    pub fn failure(call_id: u64, worker_id: u64, error: ErrorRecord) -> Self {
        Self {
            call_id,
            worker_id,
            result: Value::Nil,
            error: Some(error),
        }
    }

    pub fn from_outcome(
        call_id: u64,
        worker_id: u64,
        outcome: Result<Value, ErrorRecord>,
    ) -> Self {
        match outcome {
            Ok(result) => Self::success(call_id, worker_id, result),
            Err(error) => Self::failure(call_id, worker_id, error),
        }
    }

    /// Resolve the response into the caller-facing result.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(record) => Err(RemoteError::from(record)),
            None => Ok(self.result),
        }
    }
}

/// Messages the pool sends on a worker's call channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerCommand {
    Call(Request),
    #[serde(rename_all = "camelCase")]
    Profiler {
        duration_ms: u64,
    },
    TakeSnapshot,
}

/// Messages the pool sends on a worker's control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    Start {
        module_path: String,
        async_worker_initialization: bool,
    },
    Exit,
}

/// Everything the pool sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PoolFrame {
    Control(ControlMessage),
    Command(WorkerCommand),
}

/// Everything a worker sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerFrame {
    Ready,
    Response(Response),
}

/// First frame a process worker sends after connecting to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeHello {
    pub worker_id: u64,
}

/// Serialized form of an error raised inside a worker.
///
/// Holds `type`, `message` and `stack` plus every custom field the module
/// attached, so the pool side can rebuild a faithful error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorRecord(BTreeMap<String, Value>);

impl ErrorRecord {
    pub const TYPE: &'static str = "type";
    pub const MESSAGE: &'static str = "message";
    pub const STACK: &'static str = "stack";

    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(Self::TYPE.to_string(), Value::from(type_name.into()));
        fields.insert(Self::MESSAGE.to_string(), Value::from(message.into()));
        Self(fields)
    }

    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind.type_name(), message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::of_kind(ErrorKind::TypeError, message)
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn with_stack(self, stack: impl Into<String>) -> Self {
        self.with_field(Self::STACK, stack.into())
    }

    pub fn type_name(&self) -> Option<&str> {
        self.0.get(Self::TYPE).and_then(Value::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.0.get(Self::MESSAGE).and_then(Value::as_str)
    }

    pub fn stack(&self) -> Option<&str> {
        self.0.get(Self::STACK).and_then(Value::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.0
    }
}

/// Built-in error categories a remote error maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
    EvalError,
    ReferenceError,
    SyntaxError,
    UriError,
}

impl ErrorKind {
    /// Map a remote type name onto a known kind; unknown names are generic.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "TypeError" => Self::TypeError,
            "RangeError" => Self::RangeError,
            "EvalError" => Self::EvalError,
            "ReferenceError" => Self::ReferenceError,
            "SyntaxError" => Self::SyntaxError,
            "URIError" => Self::UriError,
            _ => Self::Error,
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::TypeError => "TypeError",
            Self::RangeError => "RangeError",
            Self::EvalError => "EvalError",
            Self::ReferenceError => "ReferenceError",
            Self::SyntaxError => "SyntaxError",
            Self::UriError => "URIError",
        }
    }
}

/// An error raised by a module method, rebuilt on the pool side.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{type_name}: {message}")]
pub struct RemoteError {
    kind: ErrorKind,
    type_name: String,
    message: String,
    fields: BTreeMap<String, Value>,
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The type name as reported by the worker, e.g. a custom class name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.fields.get(ErrorRecord::STACK).and_then(Value::as_str)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }
}

impl From<ErrorRecord> for RemoteError {
    fn from(record: ErrorRecord) -> Self {
        let type_name = record.type_name().unwrap_or("Error").to_string();
        let message = record.message().unwrap_or_default().to_string();
        Self {
            kind: ErrorKind::from_type_name(&type_name),
            type_name,
            message,
            fields: record.into_fields(),
        }
    }
}

/// Encode a message into its MessagePack payload (without framing).
pub fn encode_message<M: Serialize>(message: &M) -> Result<Vec<u8>, MessageError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decode a MessagePack payload (without framing).
pub fn decode_message<M: DeserializeOwned>(bytes: &[u8]) -> Result<M, MessageError> {
    Ok(rmp_serde::from_slice(bytes)?)
}
