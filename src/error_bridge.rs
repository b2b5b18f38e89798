//! Moving uncaught failures across the thread boundary.
//!
//! The failing side serializes a [`Thrown`] value into bytes carried by an
//! `ErrorMessage` control message. Values that cannot be represented (opaque
//! resources, non-string panic payloads) fail serialization cleanly so the
//! caller can fall back to `UnserializableError`.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, WorkerError};

/// Error-shaped value: what a standard exception looks like on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLike {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

impl ErrorLike {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            properties: Map::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for ErrorLike {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Whatever a worker script failed with.
pub enum Thrown {
    Error(ErrorLike),
    Value(Value),
    /// Resource that only makes sense on the thread that produced it.
    Opaque(Box<dyn Any + Send>),
}

impl Thrown {
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Thrown::Error(ErrorLike::new(name, message))
    }

    pub fn opaque(value: impl Any + Send) -> Self {
        Thrown::Opaque(Box::new(value))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<String>() {
            Ok(msg) => return Thrown::error("Panic", *msg),
            Err(other) => other,
        };
        match payload.downcast::<&'static str>() {
            Ok(msg) => Thrown::error("Panic", *msg),
            Err(other) => Thrown::Opaque(other),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Thrown::Error(e) => Some(&e.message),
            Thrown::Value(Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Debug for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Thrown::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Thrown::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Thrown::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

impl From<anyhow::Error> for Thrown {
    fn from(err: anyhow::Error) -> Self {
        let stack = format!("{err:?}");
        Thrown::Error(ErrorLike::new("Error", err.to_string()).with_stack(stack))
    }
}

impl From<WorkerError> for Thrown {
    fn from(err: WorkerError) -> Self {
        Thrown::Error(ErrorLike::new("WorkerError", err.to_string()))
    }
}

impl From<ErrorLike> for Thrown {
    fn from(err: ErrorLike) -> Self {
        Thrown::Error(err)
    }
}

/// Reconstructed failure as seen by the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RemoteError {
    Error(ErrorLike),
    Value { value: Value },
}

impl RemoteError {
    pub fn message(&self) -> Option<&str> {
        match self {
            RemoteError::Error(e) => Some(&e.message),
            RemoteError::Value { value: Value::String(s) } => Some(s),
            RemoteError::Value { .. } => None,
        }
    }
}

/// Payload of a worker's "error" signal.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorEvent {
    Thrown(RemoteError),
    /// The worker failed with something that could not cross the boundary.
    Unserializable,
}

pub fn serialize_error(thrown: &Thrown) -> Result<Vec<u8>> {
    let wire = match thrown {
        Thrown::Error(e) => RemoteError::Error(e.clone()),
        Thrown::Value(v) => RemoteError::Value { value: v.clone() },
        Thrown::Opaque(_) => return Err(WorkerError::Unserializable),
    };
    Ok(serde_json::to_vec(&wire)?)
}

pub fn deserialize_error(bytes: &[u8]) -> Result<RemoteError> {
    Ok(serde_json::from_slice(bytes)?)
}
