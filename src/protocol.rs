//! Messages exchanged between the master and its workers.
//!
//! Every message is one JSON object on its own line. The master sends
//! [`ForwardRequest`]s; a worker answers each one with a reply followed by a
//! connection-closed signal, both modelled by [`WorkerMessage`].

use std::collections::BTreeMap;

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{ForwardError, ProtocolError, RouteError};

pub const INTERNAL_SERVER_ERROR: &str = "Internal Server Error";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    #[serde(rename = "HTTP")]
    Http,
}

/// Master to worker: one inbound HTTP request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub kind: RequestKind,
    pub headers: BTreeMap<String, String>,
    /// Request bodies are not forwarded; always `null` on the wire.
    #[serde(default)]
    pub body: Option<String>,
    /// Request target, query string included.
    pub path: String,
}

impl ForwardRequest {
    pub fn http(path: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self {
            kind: RequestKind::Http,
            headers,
            body: None,
            path: path.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    #[serde(rename = "404")]
    NotFound,
    #[serde(rename = "500")]
    InternalServerError,
    #[serde(rename = "502")]
    BadGateway,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Worker to master: the outcome of one [`ForwardRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    Data(String),
    Error { code: ErrorCode, message: String },
}

impl WorkerReply {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn internal_error() -> Self {
        Self::error(ErrorCode::InternalServerError, INTERNAL_SERVER_ERROR)
    }

    pub fn from_route_error(err: &RouteError) -> Self {
        let code = match err {
            RouteError::RuleNotFound(_) => ErrorCode::NotFound,
            RouteError::UpstreamNotFound(_) => ErrorCode::InternalServerError,
        };
        Self::error(code, err.to_string())
    }

    pub fn from_forward_error(err: &ForwardError) -> Self {
        Self::error(ErrorCode::BadGateway, err.to_string())
    }
}

/// Anything a worker writes to its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    Reply(WorkerReply),
    /// Sent after every reply; releases the worker's connection slot.
    ConnectionClosed,
}

/// Wire shape of [`WorkerMessage`]; only used to encode and to validate.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct RawWorkerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connection_closed: Option<bool>,
}

impl From<&WorkerMessage> for RawWorkerMessage {
    fn from(message: &WorkerMessage) -> Self {
        match message {
            WorkerMessage::Reply(WorkerReply::Data(data)) => Self {
                data: Some(data.clone()),
                ..Default::default()
            },
            WorkerMessage::Reply(WorkerReply::Error { code, message }) => Self {
                error_code: Some(*code),
                error_message: Some(message.clone()),
                ..Default::default()
            },
            WorkerMessage::ConnectionClosed => Self {
                connection_closed: Some(true),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<RawWorkerMessage> for WorkerMessage {
    type Error = ProtocolError;

    fn try_from(raw: RawWorkerMessage) -> Result<Self, Self::Error> {
        match raw.connection_closed {
            Some(true) => {
                if raw.data.is_some() || raw.error_code.is_some() || raw.error_message.is_some() {
                    return Err(ProtocolError::invalid(
                        "connection-closed signal must not carry a payload",
                    ));
                }
                return Ok(WorkerMessage::ConnectionClosed);
            }
            Some(false) => {
                return Err(ProtocolError::invalid("connectionClosed must be true when present"));
            }
            None => {}
        }

        match (raw.data, raw.error_code) {
            (Some(_), Some(_)) => Err(ProtocolError::ConflictingReply),
            (Some(data), None) => Ok(WorkerMessage::Reply(WorkerReply::Data(data))),
            (None, Some(code)) => {
                let message = raw
                    .error_message
                    .ok_or_else(|| ProtocolError::invalid("errorCode without errorMessage"))?;
                Ok(WorkerMessage::Reply(WorkerReply::Error { code, message }))
            }
            (None, None) => Err(ProtocolError::EmptyReply),
        }
    }
}

pub fn decode_request(line: &str) -> Result<ForwardRequest, ProtocolError> {
    Ok(serde_json::from_str(line.trim())?)
}

pub fn decode_worker_message(line: &str) -> Result<WorkerMessage, ProtocolError> {
    let raw: RawWorkerMessage = serde_json::from_str(line.trim())?;
    WorkerMessage::try_from(raw)
}

pub fn encode_request(request: &ForwardRequest) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    Ok(line)
}

pub fn encode_worker_message(message: &WorkerMessage) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(&RawWorkerMessage::from(message))?;
    line.push('\n');
    Ok(line)
}
