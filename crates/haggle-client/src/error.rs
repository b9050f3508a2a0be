//! Error taxonomy for the client library

use haggle_protocol::{codes, RpcError};
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`HaggleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RegistrationFailed,
    HandleDisposed,
    DaemonUnreachable,
    RejectedPayload,
    PartialBatch,
    Daemon,
    LaunchFailed,
    LaunchTimeout,
    LaunchAborted,
    Protocol,
    Config,
}

#[derive(Error, Debug)]
pub enum HaggleError {
    /// The name is already bound, or the daemon could not be reached at open time.
    #[error("Registration failed with value {code}: {message}")]
    RegistrationFailed { code: i32, message: String },

    /// The handle was disposed; no call was sent to the daemon.
    #[error("Handle disposed")]
    HandleDisposed,

    #[error("Daemon unreachable: {0}")]
    DaemonUnreachable(String),

    #[error("Payload rejected by daemon (code {code}): {message}")]
    RejectedPayload { code: i32, message: String },

    /// A batch call was only partly applied by the daemon.
    #[error("Daemon accepted {accepted} of {requested} items in batch")]
    PartialBatch { accepted: usize, requested: usize },

    #[error("Daemon error (code {code}): {message}")]
    Daemon { code: i32, message: String },

    #[error("Failed to launch daemon: {0}")]
    LaunchFailed(String),

    #[error("Daemon did not become ready within {0:?}")]
    LaunchTimeout(Duration),

    #[error("Daemon launch aborted by progress callback")]
    LaunchAborted,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HaggleError>;

impl HaggleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HaggleError::RegistrationFailed { .. } => ErrorKind::RegistrationFailed,
            HaggleError::HandleDisposed => ErrorKind::HandleDisposed,
            HaggleError::DaemonUnreachable(_) => ErrorKind::DaemonUnreachable,
            HaggleError::RejectedPayload { .. } => ErrorKind::RejectedPayload,
            HaggleError::PartialBatch { .. } => ErrorKind::PartialBatch,
            HaggleError::Daemon { .. } => ErrorKind::Daemon,
            HaggleError::LaunchFailed(_) => ErrorKind::LaunchFailed,
            HaggleError::LaunchTimeout(_) => ErrorKind::LaunchTimeout,
            HaggleError::LaunchAborted => ErrorKind::LaunchAborted,
            HaggleError::Protocol(_) => ErrorKind::Protocol,
            HaggleError::Config(_) => ErrorKind::Config,
        }
    }

    /// Integer status code, matching the daemon's code where there is one.
    pub fn code(&self) -> i32 {
        match self {
            HaggleError::RegistrationFailed { code, .. }
            | HaggleError::RejectedPayload { code, .. }
            | HaggleError::Daemon { code, .. } => *code,
            HaggleError::DaemonUnreachable(_) => codes::NOT_CONNECTED,
            HaggleError::HandleDisposed => codes::BAD_HANDLE,
            HaggleError::PartialBatch { .. } => codes::REJECTED_PAYLOAD,
            HaggleError::Protocol(_) => codes::PARSE_ERROR,
            HaggleError::LaunchFailed(_)
            | HaggleError::LaunchTimeout(_)
            | HaggleError::LaunchAborted
            | HaggleError::Config(_) => HAGGLE_ERROR,
        }
    }

    /// Whether the caller may reasonably retry after re-checking daemon state.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, HaggleError::HandleDisposed | HaggleError::Protocol(_))
    }

    /// Convert an error received in reply to `session.register`.
    pub(crate) fn registration(err: HaggleError) -> Self {
        match err {
            HaggleError::RegistrationFailed { .. } => err,
            other => HaggleError::RegistrationFailed {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

/// Generic failure status used by legacy libhaggle callers.
pub const HAGGLE_ERROR: i32 = -100;

impl From<RpcError> for HaggleError {
    fn from(err: RpcError) -> Self {
        match err.code {
            codes::NAME_IN_USE => HaggleError::RegistrationFailed {
                code: err.code,
                message: err.message,
            },
            codes::REJECTED_PAYLOAD | codes::INVALID_PARAMS => HaggleError::RejectedPayload {
                code: err.code,
                message: err.message,
            },
            code => HaggleError::Daemon {
                code,
                message: err.message,
            },
        }
    }
}

impl From<serde_json::Error> for HaggleError {
    fn from(err: serde_json::Error) -> Self {
        HaggleError::Protocol(err.to_string())
    }
}
