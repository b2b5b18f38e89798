//! Control-channel wire protocol.
//!
//! Control messages travel over an ordinary message port as JSON values
//! tagged by `type`. Decoding anything that is not one of these variants
//! is a protocol violation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::{Result, WorkerError};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StdioStream {
    Stdin,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Worker finished loading and is about to run its script.
    Ready,
    /// First message to a new worker. `public_port` indexes the transferred ports.
    #[serde(rename_all = "camelCase")]
    Load {
        target: String,
        eval: bool,
        #[serde(default)]
        worker_data: Value,
        public_port: usize,
        has_stdin: bool,
    },
    /// A chunk of stdio bytes; `chunk: None` marks end-of-stream.
    StdioPayload {
        stream: StdioStream,
        chunk: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encoding: Option<String>,
    },
    /// The reading side drained what it had and wants the next chunk.
    WantsMoreData { stream: StdioStream },
    ErrorMessage { error: Vec<u8> },
    UnserializableError,
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn decode(value: &Value) -> Result<Self> {
        ControlMessage::deserialize(value)
            .map_err(|e| WorkerError::ProtocolViolation(format!("{e}: {value}")))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Ready => "ready",
            ControlMessage::Load { .. } => "load",
            ControlMessage::StdioPayload { .. } => "stdioPayload",
            ControlMessage::WantsMoreData { .. } => "wantsMoreData",
            ControlMessage::ErrorMessage { .. } => "errorMessage",
            ControlMessage::UnserializableError => "unserializableError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tags_on_the_wire() {
        let v = ControlMessage::WantsMoreData { stream: StdioStream::Stderr }
            .encode()
            .unwrap();
        assert_eq!(v, json!({"type": "wantsMoreData", "stream": "stderr"}));
        assert_eq!(ControlMessage::Ready.encode().unwrap(), json!({"type": "ready"}));
    }

    #[test]
    fn test_load_uses_camel_case_fields() {
        let v = ControlMessage::Load {
            target: "/srv/job.js".into(),
            eval: false,
            worker_data: json!({"n": 1}),
            public_port: 0,
            has_stdin: true,
        }
        .encode()
        .unwrap();
        assert_eq!(v["type"], "load");
        assert_eq!(v["publicPort"], 0);
        assert_eq!(v["hasStdin"], true);
        assert_eq!(v["workerData"]["n"], 1);
    }

    #[test]
    fn test_end_of_stream_payload_decodes() {
        let msg = ControlMessage::decode(&json!({
            "type": "stdioPayload", "stream": "stdout", "chunk": null
        }))
        .unwrap();
        assert_eq!(
            msg,
            ControlMessage::StdioPayload {
                stream: StdioStream::Stdout,
                chunk: None,
                encoding: None
            }
        );
    }

    #[test]
    fn test_unknown_type_is_protocol_violation() {
        let err = ControlMessage::decode(&json!({"type": "selfDestruct"})).unwrap_err();
        assert!(matches!(err, WorkerError::ProtocolViolation(_)));
        let err = ControlMessage::decode(&json!("ready")).unwrap_err();
        assert!(matches!(err, WorkerError::ProtocolViolation(_)));
    }

    #[test]
    fn test_stream_names_parse() {
        assert_eq!("stdin".parse::<StdioStream>().unwrap(), StdioStream::Stdin);
        assert_eq!(StdioStream::Stderr.to_string(), "stderr");
    }
}
