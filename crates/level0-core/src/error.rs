//! Error taxonomy for the pipeline.
//!
//! Every failure that can end up on an execution record is classified by
//! [`ErrorKind`]. The kind decides whether the state machine retries the
//! step (transient) or fails the execution straight away (permanent).
//!
//! | Kind | Class | Raised by |
//! |------|-------|-----------|
//! | `UnroutableFileType` | permanent | routing |
//! | `MalformedFile` | permanent | parse / validation |
//! | `ChecksumMismatch` | permanent | read verification |
//! | `ObjectNotFound` | permanent | object store |
//! | `StoreUnavailable` | transient | object store, relational store |
//! | `Timeout` | transient | step deadline, pool acquire |
//! | `NotificationFailed` | transient unless rejected | notify |
//! | `Cancelled` | terminal | operator |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::machine::ExecutionState;

/// Classification recorded on a failed or retrying execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnroutableFileType,
    MalformedFile,
    ChecksumMismatch,
    ObjectNotFound,
    StoreUnavailable,
    Timeout,
    NotificationFailed,
    Cancelled,
}

impl ErrorKind {
    /// Transient kinds are retried within their step's budget.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::StoreUnavailable | ErrorKind::Timeout | ErrorKind::NotificationFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnroutableFileType => "UnroutableFileType",
            ErrorKind::MalformedFile => "MalformedFile",
            ErrorKind::ChecksumMismatch => "ChecksumMismatch",
            ErrorKind::ObjectNotFound => "ObjectNotFound",
            ErrorKind::StoreUnavailable => "StoreUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::NotificationFailed => "NotificationFailed",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "UnroutableFileType" => ErrorKind::UnroutableFileType,
            "MalformedFile" => ErrorKind::MalformedFile,
            "ChecksumMismatch" => ErrorKind::ChecksumMismatch,
            "ObjectNotFound" => ErrorKind::ObjectNotFound,
            "StoreUnavailable" => ErrorKind::StoreUnavailable,
            "Timeout" => ErrorKind::Timeout,
            "NotificationFailed" => ErrorKind::NotificationFailed,
            "Cancelled" => ErrorKind::Cancelled,
            other => return Err(format!("unknown error kind '{}'", other)),
        })
    }
}

/// Structural problems found while decoding a Level 0 file.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("file is empty")]
    Empty,
    #[error("file length {len} bytes is not a whole number of {block_bytes}-byte blocks")]
    Truncated { len: usize, block_bytes: usize },
    #[error("unknown block type word 0x{0:04x}")]
    UnknownBlockType(u16),
    #[error("block type {found} does not match the {expected} file type")]
    WrongBlockType {
        expected: &'static str,
        found: &'static str,
    },
    #[error("spectrum at stw 0x{stw:08x} has {blocks} of 12 data blocks")]
    IncompleteSpectrum { stw: u64, blocks: usize },
    #[error("file name '{0}' does not carry a hex time word")]
    InvalidFileName(String),
    #[error("attitude file: {0}")]
    Attitude(String),
    #[error("attitude line {line}: {reason}")]
    AttitudeRecord { line: usize, reason: String },
    #[error("implausible value: {0}")]
    Implausible(String),
}

/// Failure of the import step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ImportError {
    #[error("no import branch registered for file type '{0}'")]
    Unroutable(String),
    #[error("malformed file: {0}")]
    Malformed(#[from] ParseError),
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("object {key} (version {version}) not found")]
    ObjectNotFound { key: String, version: String },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl ImportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImportError::Unroutable(_) => ErrorKind::UnroutableFileType,
            ImportError::Malformed(_) => ErrorKind::MalformedFile,
            ImportError::ChecksumMismatch(_) => ErrorKind::ChecksumMismatch,
            ImportError::ObjectNotFound { .. } => ErrorKind::ObjectNotFound,
            ImportError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            ImportError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Failure of the notification step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NotifyError {
    #[error("subscriber '{0}' has no registered delivery")]
    UnknownSubscriber(String),
    #[error("subscriber '{subscriber}' rejected the notification: {reason}")]
    Rejected { subscriber: String, reason: String },
    #[error("delivery to '{subscriber}' failed: {reason}")]
    Undelivered { subscriber: String, reason: String },
    #[error("import summary missing from execution")]
    MissingSummary,
}

impl NotifyError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::NotificationFailed
    }

    /// Permanent failures end the notify step without further retries.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, NotifyError::Undelivered { .. })
    }
}

/// An event that the current execution state cannot accept.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("execution is terminal ({0}); no further transitions")]
    Terminal(ExecutionState),
    #[error("event '{event}' is not valid in state {state}")]
    Invalid {
        state: ExecutionState,
        event: &'static str,
    },
}

/// Infrastructure failure of a durable collaborator (execution store,
/// buffer, relational store).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store timed out: {0}")]
    Timeout(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Timeout(_) => ErrorKind::Timeout,
            StoreError::Unavailable(_) | StoreError::Corrupt(_) => ErrorKind::StoreUnavailable,
        }
    }
}

impl From<StoreError> for ImportError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout(msg) => ImportError::Timeout(msg),
            StoreError::Unavailable(msg) | StoreError::Corrupt(msg) => {
                ImportError::StoreUnavailable(msg)
            }
        }
    }
}

/// Failure reading a raw file from object storage.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReadError {
    #[error("object {key} (version {version}) not found")]
    NotFound { key: String, version: String },
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

impl From<ReadError> for ImportError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::NotFound { key, version } => ImportError::ObjectNotFound { key, version },
            ReadError::Unavailable(msg) => ImportError::StoreUnavailable(msg),
        }
    }
}
