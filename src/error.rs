//! Error taxonomy for the supervisor.
//!
//! Leaf errors are `thiserror` enums scoped to the module that raises them;
//! `anyhow` is used at the outer edges (the reconciliation cycle body, the
//! binary's `main`).

use thiserror::Error;

/// Errors raised while loading or validating a [`crate::config::DesiredConfig`].
///
/// A config load error is one the caller logs and keeps running on the
/// previous config for; it never propagates as a process exit.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("config is schema-invalid: {0}")]
    Invalid(String),
}

/// Errors raised while a [`crate::slot::SlotRunner`] attaches to the JQ
/// broker. The `retriable` flag decides whether the slot's outer loop
/// backs off and retries, or exits outright.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct JqAttachError {
    pub message: String,
    pub retriable: bool,
}

impl JqAttachError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

/// Errors raised while dispatching a single job over HTTP.
///
/// Every variant here is handled by returning `WORK_FAIL` to the JQ server,
/// never by crashing the slot.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("form assembly error: {0}")]
    Form(String),

    #[error("http status {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("malformed result envelope: {0}")]
    Envelope(String),

    #[error("job exceeded max_job_running_time")]
    Timeout,

    #[error("aborted by global shutdown")]
    ShutdownAbort,
}
