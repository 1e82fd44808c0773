use log::error;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use url::ParseError;

use crate::workers::FailureKind;

pub type Result<T, E = DakaraError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum DakaraError {
    #[error("Configuration Error: {0}")]
    ConfigurationError(String),

    #[error("Not Connected: {0}")]
    NotConnected(String),

    #[error("Connection Failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection Write Error: {0}")]
    ConnectionWriteError(String),

    #[error("Connection Read Error: {0}")]
    ConnectionReadError(String),

    #[error("Authentication Error: {0}")]
    AuthenticationError(String),

    #[error("Reconnection abandoned after {attempts} failed attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Shutdown Timeout Error: workers {workers:?} did not exit within {timeout:?}")]
    ShutdownTimeoutError {
        workers: Vec<String>,
        timeout: Duration,
    },

    #[error("Supervisor Failure: worker '{worker}' stopped on {kind}: {cause}")]
    SupervisorFailure {
        worker: String,
        kind: FailureKind,
        cause: String,
    },

    #[error("Config Not Found: {0}")]
    ConfigNotFound(String),

    #[error("Config Parse Error: {0}")]
    ConfigParseError(String),

    #[error("Config Invalid: {0}")]
    ConfigInvalid(String),

    #[error("Parameter Error: {0}")]
    ParameterError(String),

    #[error("Method Error: {0}")]
    MethodError(String),

    #[error("Not Authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Response Request Error: {0}")]
    ResponseRequestError(String),

    #[error("Response Invalid Error: status={status}, message={message}")]
    ResponseInvalidError { status: StatusCode, message: String },

    #[error("HTTP Client Error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON Serialization/Deserialization Error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("URL Parsing Error: {0}")]
    UrlParseError(#[from] ParseError),

    #[error("Progress Template Error: {0}")]
    TemplateError(#[from] indicatif::style::TemplateError),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Coarse classification of a [`DakaraError`], handed to `on_error` callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    NotConnected,
    ConnectionFailed,
    ConnectionWrite,
    ConnectionRead,
    Authentication,
    RetriesExhausted,
    ShutdownTimeout,
    Supervisor,
    Config,
    Http,
    Io,
    Other,
}

impl ErrorKind {
    /// Transport-level conditions the reconnect loop absorbs on its own.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::NotConnected
                | ErrorKind::ConnectionFailed
                | ErrorKind::ConnectionWrite
                | ErrorKind::ConnectionRead
        )
    }
}

impl DakaraError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DakaraError::ConfigurationError(_) => ErrorKind::Configuration,
            DakaraError::NotConnected(_) => ErrorKind::NotConnected,
            DakaraError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            DakaraError::ConnectionWriteError(_) => ErrorKind::ConnectionWrite,
            DakaraError::ConnectionReadError(_) => ErrorKind::ConnectionRead,
            DakaraError::AuthenticationError(_) | DakaraError::NotAuthenticated(_) => {
                ErrorKind::Authentication
            }
            DakaraError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            DakaraError::ShutdownTimeoutError { .. } => ErrorKind::ShutdownTimeout,
            DakaraError::SupervisorFailure { .. } => ErrorKind::Supervisor,
            DakaraError::ConfigNotFound(_)
            | DakaraError::ConfigParseError(_)
            | DakaraError::ConfigInvalid(_) => ErrorKind::Config,
            DakaraError::ResponseRequestError(_)
            | DakaraError::ResponseInvalidError { .. }
            | DakaraError::ReqwestError(_) => ErrorKind::Http,
            DakaraError::IoError(_) => ErrorKind::Io,
            DakaraError::ParameterError(_)
            | DakaraError::MethodError(_)
            | DakaraError::SerdeError(_)
            | DakaraError::UrlParseError(_)
            | DakaraError::TemplateError(_) => ErrorKind::Other,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind().is_recoverable()
    }
}

/// Turns the outcome of a program's main routine into a process exit code.
///
/// Known errors (`DakaraError` anywhere in the chain) are logged and give `1`.
/// Anything else is treated as a bug: it is logged with its whole chain, the
/// user is pointed at the bug tracker and the exit code is `2`.
pub fn exit_code(result: anyhow::Result<()>, bugtracker_url: &str, debug: bool) -> i32 {
    let error = match result {
        Ok(()) => return 0,
        Err(error) => error,
    };

    if debug {
        error!("{:?}", error);
    }

    if error.chain().any(|cause| cause.is::<DakaraError>()) {
        if !debug {
            error!("{:#}", error);
        }
        return 1;
    }

    if !debug {
        error!("Unexpected error: {:#}", error);
    }
    error!("Please fill a bug report at '{}'", bugtracker_url);
    2
}
