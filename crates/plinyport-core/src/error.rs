//! Error taxonomy shared by every plinyport crate.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::{DType, Endpoint};

/// Which part of a session's life an error happened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Upload,
    Run,
    Shutdown,
    Probe,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Connect => "connect",
            Phase::Upload => "upload",
            Phase::Run => "run",
            Phase::Shutdown => "shutdown",
            Phase::Probe => "probe",
        })
    }
}

pub const SINGLE_NODE_UNSUPPORTED: &str =
    "whole-graph execution is required; a remote round trip per operator is prohibitively expensive";

#[derive(Debug, Error)]
pub enum PlinyError {
    #[error("invalid graph: {}", problems.join("; "))]
    InvalidGraph { problems: Vec<String> },

    #[error("unsupported operation `{operation}`: {reason}")]
    UnsupportedOperation {
        operation: &'static str,
        reason: &'static str,
    },

    #[error("invalid endpoint `{input}`: {reason}")]
    InvalidEndpoint { input: String, reason: String },

    #[error("failed to connect to {endpoint}: {message}")]
    Connection { endpoint: Endpoint, message: String },

    #[error("{phase} against {endpoint} timed out after {elapsed:?}")]
    Timeout {
        endpoint: Endpoint,
        phase: Phase,
        elapsed: Duration,
    },

    #[error("connection to {endpoint} lost during {phase}: {message}")]
    ConnectionLost {
        endpoint: Endpoint,
        phase: Phase,
        message: String,
    },

    #[error("engine at {endpoint} rejected the graph: {message}")]
    GraphUpload { endpoint: Endpoint, message: String },

    #[error("engine at {endpoint} failed to run the graph: {message}")]
    RunFailed { endpoint: Endpoint, message: String },

    #[error("input `{input}` has an incompatible shape: {detail}")]
    InputShape { input: String, detail: String },

    #[error("input `{input}` has dtype {actual}, expected {expected}")]
    InputType {
        input: String,
        expected: DType,
        actual: DType,
    },

    /// The request was refused locally; nothing reached the engine.
    #[error("request of {len} bytes exceeds the {max} byte frame limit")]
    RequestTooLarge { len: usize, max: usize },

    #[error("malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("dtype {dtype} is not supported on the wire")]
    UnsupportedDtype { dtype: DType },

    #[error("invalid tensor: {message}")]
    InvalidTensor { message: String },

    #[error("session is closed")]
    SessionClosed,

    #[error("session is not ready (state: {state})")]
    NotReady { state: &'static str },
}

impl PlinyError {
    pub fn single_node_unsupported() -> Self {
        PlinyError::UnsupportedOperation {
            operation: "run_single_node",
            reason: SINGLE_NODE_UNSUPPORTED,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        PlinyError::MalformedResponse {
            message: message.into(),
        }
    }

    /// Transport faults: a fresh session against the same endpoint may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlinyError::Connection { .. }
                | PlinyError::Timeout { .. }
                | PlinyError::ConnectionLost { .. }
        )
    }

    /// Attaches endpoint and phase to protocol-level decode failures.
    pub fn in_phase(self, endpoint: &Endpoint, phase: Phase) -> Self {
        match self {
            PlinyError::MalformedResponse { message } => PlinyError::MalformedResponse {
                message: format!("{phase} response from {endpoint}: {message}"),
            },
            other => other,
        }
    }
}
