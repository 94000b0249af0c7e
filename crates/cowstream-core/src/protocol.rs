//! Control protocol messages
//!
//! Requests, responses and events are JSON objects, one per line:
//!
//! ```text
//! -> {"execute": "block-stream", "arguments": {"device": "drive0"}, "id": 1}
//! <- {"return": {}, "id": 1}
//! <- {"event": "BLOCK_JOB_COMPLETED", "data": {"type": "stream", ...}, "timestamp": {...}}
//! ```

use crate::error::{Error, ErrorClass, Result};
use crate::events::{Event, EventKind, JobType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::UNIX_EPOCH;

/// Event name for a job that ran to its end (or failed)
pub const BLOCK_JOB_COMPLETED: &str = "BLOCK_JOB_COMPLETED";

/// Event name for a job stopped on request
pub const BLOCK_JOB_CANCELLED: &str = "BLOCK_JOB_CANCELLED";

/// A raw request as received from a client
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Command name
    pub execute: String,

    /// Command arguments
    #[serde(default)]
    pub arguments: Option<Value>,

    /// Opaque client tag echoed in the response
    #[serde(default)]
    pub id: Option<Value>,
}

impl Request {
    /// Parse one request line
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Protocol(e.to_string()))
    }
}

/// Arguments of `block-stream`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockStreamArgs {
    /// Device to stream
    pub device: String,

    /// Layer to stop at; the whole chain when absent
    #[serde(default)]
    pub base: Option<String>,

    /// Speed limit in bytes per second
    #[serde(default)]
    pub speed: Option<i64>,
}

/// Arguments naming only a device
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceArgs {
    /// Target device
    pub device: String,
}

/// Arguments of `block-job-set-speed`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetSpeedArgs {
    /// Target device
    pub device: String,

    /// New speed limit in bytes per second
    pub speed: i64,
}

/// A validated control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Capability negotiation; accepted and ignored
    QmpCapabilities,
    /// `block-stream`
    BlockStream(BlockStreamArgs),
    /// `block-job-cancel`
    BlockJobCancel(DeviceArgs),
    /// `block-job-set-speed`
    BlockJobSetSpeed(SetSpeedArgs),
    /// `query-block-jobs`
    QueryBlockJobs,
}

impl Command {
    /// Decode the command named by `request`
    pub fn from_request(request: &Request) -> Result<Self> {
        let name = request.execute.as_str();
        let arguments = request.arguments.clone();
        match name {
            "qmp_capabilities" => Ok(Command::QmpCapabilities),
            "block-stream" => Ok(Command::BlockStream(decode_args(name, arguments)?)),
            "block-job-cancel" => Ok(Command::BlockJobCancel(decode_args(name, arguments)?)),
            "block-job-set-speed" => {
                Ok(Command::BlockJobSetSpeed(decode_args(name, arguments)?))
            }
            "query-block-jobs" => {
                decode_args::<Map<String, Value>>(name, arguments)?;
                Ok(Command::QueryBlockJobs)
            }
            other => Err(Error::CommandNotFound(other.to_string())),
        }
    }
}

fn decode_args<T: DeserializeOwned>(name: &str, arguments: Option<Value>) -> Result<T> {
    let arguments = arguments.unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(arguments)
        .map_err(|e| Error::Protocol(format!("invalid arguments for {}: {}", name, e)))
}

/// Error payload of a failed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error class
    pub class: ErrorClass,

    /// Human readable description
    pub desc: String,
}

/// Reply to one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    /// Success
    Return {
        /// Command result
        #[serde(rename = "return")]
        value: Value,
        /// Echo of the request id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
    },
    /// Failure
    Error {
        /// Error details
        error: ErrorBody,
        /// Echo of the request id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
    },
}

impl Response {
    /// Build a response from a command result
    pub fn from_result(result: Result<Value>, id: Option<Value>) -> Self {
        match result {
            Ok(value) => Response::Return { value, id },
            Err(e) => Response::error(&e, id),
        }
    }

    /// Build an error response
    pub fn error(error: &Error, id: Option<Value>) -> Self {
        Response::Error {
            error: ErrorBody {
                class: error.class(),
                desc: error.to_string(),
            },
            id,
        }
    }

    /// Whether this is a success response
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Return { .. })
    }
}

/// Payload of a block job event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    /// Job type tag
    #[serde(rename = "type")]
    pub job_type: JobType,

    /// Device the job ran on
    pub device: String,

    /// Total logical length of the image
    pub len: u64,

    /// Progress cursor at termination
    pub offset: u64,

    /// Speed limit at termination
    pub speed: u64,

    /// Failure detail, present only for failed jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wall clock time of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Whole seconds since the Unix epoch
    pub seconds: u64,

    /// Sub-second part in microseconds
    pub microseconds: u32,
}

/// Asynchronous event as sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event name
    pub event: String,

    /// Event payload
    pub data: EventData,

    /// When the event happened
    pub timestamp: Timestamp,
}

impl From<&Event> for EventMessage {
    fn from(event: &Event) -> Self {
        let name = match event.kind {
            EventKind::Completed | EventKind::Error => BLOCK_JOB_COMPLETED,
            EventKind::Cancelled => BLOCK_JOB_CANCELLED,
        };
        let since_epoch = event.timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            event: name.to_string(),
            data: EventData {
                job_type: event.job_type,
                device: event.device.clone(),
                len: event.len,
                offset: event.offset,
                speed: event.speed,
                error: event.error.clone(),
            },
            timestamp: Timestamp {
                seconds: since_epoch.as_secs(),
                microseconds: since_epoch.subsec_micros(),
            },
        }
    }
}

/// Banner sent when a client connects
#[derive(Debug, Clone, Serialize)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    qmp: GreetingBody,
}

#[derive(Debug, Clone, Serialize)]
struct GreetingBody {
    version: GreetingVersion,
    capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct GreetingVersion {
    package: String,
}

impl Greeting {
    /// Greeting naming this library's version
    pub fn new() -> Self {
        Self {
            qmp: GreetingBody {
                version: GreetingVersion {
                    package: format!("cowstream {}", env!("CARGO_PKG_VERSION")),
                },
                capabilities: Vec::new(),
            },
        }
    }
}

impl Default for Greeting {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, SystemTime};

    fn command(line: &str) -> Result<Command> {
        Command::from_request(&Request::parse(line)?)
    }

    #[test]
    fn test_parse_block_stream() {
        let cmd = command(
            r#"{"execute": "block-stream", "arguments": {"device": "drive0", "base": "mid.img", "speed": 1024}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::BlockStream(BlockStreamArgs {
                device: "drive0".to_string(),
                base: Some("mid.img".to_string()),
                speed: Some(1024),
            })
        );
    }

    #[test]
    fn test_parse_negative_speed_reaches_validation() {
        let cmd = command(
            r#"{"execute": "block-job-set-speed", "arguments": {"device": "drive0", "speed": -1}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::BlockJobSetSpeed(SetSpeedArgs {
                device: "drive0".to_string(),
                speed: -1,
            })
        );
    }

    #[test]
    fn test_parse_query_without_arguments() {
        assert_eq!(
            command(r#"{"execute": "query-block-jobs"}"#).unwrap(),
            Command::QueryBlockJobs
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(command("not json"), Err(Error::Protocol(_))));
        assert!(matches!(
            command(r#"{"execute": "block-stream"}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            command(r#"{"execute": "block-stream", "arguments": {"device": "d", "bogus": 1}}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            command(r#"{"execute": "eject"}"#),
            Err(Error::CommandNotFound(_))
        ));
    }

    #[test]
    fn test_response_serialization() {
        let ok = Response::from_result(Ok(json!({})), Some(json!(7)));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"return": {}, "id": 7})
        );

        let err = Response::error(&Error::DeviceNotFound("nope".into()), None);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"]["class"], "DeviceNotFound");
        assert!(value["error"]["desc"].as_str().unwrap().contains("nope"));
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_response_roundtrip_untagged() {
        let parsed: Response = serde_json::from_str(r#"{"return": []}"#).unwrap();
        assert!(parsed.is_ok());
        let parsed: Response =
            serde_json::from_str(r#"{"error": {"class": "GenericError", "desc": "x"}}"#).unwrap();
        assert!(!parsed.is_ok());
    }

    fn event(kind: EventKind, error: Option<&str>) -> Event {
        Event {
            kind,
            device: "drive0".to_string(),
            job_type: JobType::Stream,
            offset: 512,
            len: 1024,
            speed: 0,
            error: error.map(str::to_string),
            timestamp: UNIX_EPOCH + Duration::new(12, 345_678_000),
        }
    }

    #[test]
    fn test_event_message_completed() {
        let msg = EventMessage::from(&event(EventKind::Completed, None));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], BLOCK_JOB_COMPLETED);
        assert_eq!(value["data"]["type"], "stream");
        assert_eq!(value["data"]["device"], "drive0");
        assert_eq!(value["data"]["offset"], 512);
        assert_eq!(value["data"]["len"], 1024);
        assert!(value["data"].get("error").is_none());
        assert_eq!(value["timestamp"]["seconds"], 12);
        assert_eq!(value["timestamp"]["microseconds"], 345_678);
    }

    #[test]
    fn test_event_message_cancelled_and_error() {
        let msg = EventMessage::from(&event(EventKind::Cancelled, None));
        assert_eq!(msg.event, BLOCK_JOB_CANCELLED);

        let msg = EventMessage::from(&event(EventKind::Error, Some("EIO")));
        assert_eq!(msg.event, BLOCK_JOB_COMPLETED);
        assert_eq!(msg.data.error.as_deref(), Some("EIO"));
    }

    #[test]
    fn test_event_timestamp_before_epoch() {
        let mut ev = event(EventKind::Completed, None);
        ev.timestamp = SystemTime::UNIX_EPOCH - Duration::from_secs(1);
        let msg = EventMessage::from(&ev);
        assert_eq!(msg.timestamp.seconds, 0);
    }

    #[test]
    fn test_greeting() {
        let value = serde_json::to_value(Greeting::new()).unwrap();
        assert!(value["QMP"]["version"]["package"]
            .as_str()
            .unwrap()
            .starts_with("cowstream"));
        assert_eq!(value["QMP"]["capabilities"], json!([]));
    }
}
