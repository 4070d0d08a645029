//! Error types shared across the master and worker sides.

use std::time::Duration;

use thiserror::Error;

/// Raised by the load balancer when it cannot pick a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadBalancerError {
    #[error("No workers available")]
    NoWorkersAvailable,
}

/// Raised by the routing resolver inside a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No rule pattern matched the request path.
    #[error("Rule not found for path {0}")]
    RuleNotFound(String),

    /// A rule matched but references an upstream id that is not configured.
    #[error("Upstream not found: {0}")]
    UpstreamNotFound(String),
}

/// Raised by the upstream forwarder. Every variant is a 502 on the wire.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Invalid upstream URI: {0}")]
    InvalidUri(String),

    #[error("Could not build upstream request: {0}")]
    InvalidRequest(#[from] http::Error),

    #[error("Failed to connect to upstream {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP handshake with upstream failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("Upstream request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("Failed to read upstream response body: {0}")]
    Body(#[source] hyper::Error),

    #[error("Upstream timed out after {0:?}")]
    Timeout(Duration),
}

/// Raised when a message crossing the worker channel cannot be decoded or encoded.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Reply carries both data and errorCode")]
    ConflictingReply,

    #[error("Reply carries neither data nor errorCode")]
    EmptyReply,
}

impl ProtocolError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }
}

/// Raised while loading or validating the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not decode configuration from environment: {0}")]
    Env(#[from] serde_json::Error),
}

/// Raised when the master cannot hand a request to a worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Channel to worker {0} is closed")]
    ChannelClosed(crate::worker::WorkerId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Ends an inbound connection without writing a response.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Worker {0} closed the request without replying")]
    Aborted(crate::worker::WorkerId),
}
