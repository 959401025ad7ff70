//! Error taxonomy shared by the engine.
//!
//! Connection and bootstrap errors are host-scoped and become failure
//! envelopes; serialization defects are programmer errors and suppress the
//! envelope for the affected host; loader and formatter errors are
//! process-fatal at the CLI boundary.

use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Lossy capture of an error that crossed the host/remote boundary: only
/// the type name, a printable form and the argument tuple travel, so the
/// record stays primitive-serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {repr}")]
pub struct ExceptionInfo {
    pub name: String,
    pub repr: String,
    pub args: Vec<Value>,
}

impl ExceptionInfo {
    pub fn new(name: impl Into<String>, repr: impl Display) -> Self {
        ExceptionInfo {
            name: name.into(),
            repr: repr.to_string(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// A transport stream could not be opened or died underneath us.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("i/o failure on stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("no greeting from remote context within {0:?}")]
    ConnectTimeout(Duration),

    #[error("stream disconnected")]
    Disconnected,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("broker is shut down")]
    BrokerClosed,
}

/// The base transport for a host failed to open.
#[derive(Debug, thiserror::Error)]
#[error("error connecting to {host}: {cause}")]
pub struct ConnectionError {
    pub host: String,
    #[source]
    pub cause: StreamError,
}

impl ConnectionError {
    pub fn new(host: impl Into<String>, cause: StreamError) -> Self {
        ConnectionError { host: host.into(), cause }
    }
}

/// Remote environment creation or dependency installation failed. Carries
/// the installer's captured output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("bootstrap failed: {message}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
pub struct BootstrapError {
    pub message: String,
    pub stdout: String,
    pub stderr: String,
}

impl BootstrapError {
    pub fn new(message: impl Into<String>) -> Self {
        BootstrapError {
            message: message.into(),
            stdout: "<empty>".into(),
            stderr: "<empty>".into(),
        }
    }

    pub fn with_output(mut self, stdout: &[u8], stderr: &[u8]) -> Self {
        self.stdout = String::from_utf8_lossy(stdout).into_owned();
        self.stderr = String::from_utf8_lossy(stderr).into_owned();
        self
    }
}

/// Unknown target, connection-method type or formatter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("name not found: {0}")]
pub struct NameNotFound(pub String);

/// Failure of a single remote call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The remote side raised; provenance captured in [`ExceptionInfo`].
    #[error("remote call failed: {0}")]
    Remote(ExceptionInfo),

    /// The stream carrying the call died before a reply arrived.
    #[error("call aborted: {0}")]
    Stream(StreamError),
}

impl CallError {
    /// Marker carried by replies whose payload could not be decoded on the
    /// other side. These are implementation defects, not host failures, and
    /// the runner suppresses the envelope for them.
    pub const DECODE_MARKER: &'static str = "cannot decode";

    pub fn is_decode_defect(&self) -> bool {
        matches!(self, CallError::Remote(info) if info.repr.contains(Self::DECODE_MARKER))
    }
}
