use std::process::ExitStatus;

use serde_json::Value;

use crate::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transport failed to start: {message}")]
    TransportStart {
        message: String,
        exit_status: Option<ExitStatus>,
    },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("session closed")]
    SessionClosed,
    #[error("ping failed: {0}")]
    PingFailed(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("profile store error: {0}")]
    Profile(String),
    #[error("settings store error: {0}")]
    Settings(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Exit status of a stdio server that died during start, if that is what failed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            Self::TransportStart { exit_status, .. } => *exit_status,
            _ => None,
        }
    }
}

impl From<mcplens_transport::Error> for Error {
    fn from(err: mcplens_transport::Error) -> Self {
        use mcplens_transport::Error as E;
        match err {
            E::Configuration(message) => Self::Configuration(message),
            E::Start {
                message,
                exit_status,
            } => Self::TransportStart {
                message,
                exit_status,
            },
            E::Unauthorized(message) => Self::Unauthorized(message),
            E::SendFailed(message) => Self::SendFailed(message),
            E::Closed => Self::SessionClosed,
            E::Io(err) => Self::Io(err),
            E::Json(err) => Self::SendFailed(format!("serialize message failed: {err}")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
