//! Error types for log scanning and replay.
//!
//! Per-record and per-file errors are contained where they happen and end up as a log
//! line plus a dropped or failed record. Only [`ReplayError::PoolSaturation`] (and a
//! log directory that exists but cannot be listed) is allowed to end a run.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// A captured payload that does not have the structure of a decision request.
#[derive(Debug)]
pub enum PayloadParseError {
    InvalidJson(serde_json::Error),
    MissingField(&'static str),
}

impl fmt::Display for PayloadParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(e) => write!(f, "payload is not valid JSON: {}", e),
            Self::MissingField(path) => write!(f, "payload has no usable {}", path),
        }
    }
}

impl std::error::Error for PayloadParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidJson(e) => Some(e),
            Self::MissingField(_) => None,
        }
    }
}

/// Why one replay exchange with the decision service did not count as accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    Timeout,
    Transport(String),
    HttpStatus(u16),
    MalformedResponse(String),
    MissingStatus,
    Rejected(String),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::HttpStatus(code) => write!(f, "unexpected HTTP status {}", code),
            Self::MalformedResponse(e) => write!(f, "response body is not JSON: {}", e),
            Self::MissingStatus => write!(f, "response has no response.status field"),
            Self::Rejected(status) => write!(f, "service rejected request (status {})", status),
        }
    }
}

impl std::error::Error for RequestError {}

/// Run-level errors.
#[derive(Debug)]
pub enum ReplayError {
    /// One log file could not be opened or read. The file is skipped.
    FileRead { path: PathBuf, source: io::Error },
    /// The log directory exists but could not be listed.
    DirectoryList { path: PathBuf, source: io::Error },
    /// A batch was submitted while the queue was full and the pool already ran its
    /// maximum number of workers.
    PoolSaturation {
        queue_capacity: usize,
        max_workers: usize,
    },
    /// The pool stopped accepting work before the run finished.
    PoolClosed,
    InvalidConfig(String),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileRead { path, source } => {
                write!(f, "failed to read log file {}: {}", path.display(), source)
            }
            Self::DirectoryList { path, source } => {
                write!(f, "failed to list log directory {}: {}", path.display(), source)
            }
            Self::PoolSaturation {
                queue_capacity,
                max_workers,
            } => write!(
                f,
                "replay pool saturated: queue of {} full with {} workers running",
                queue_capacity, max_workers
            ),
            Self::PoolClosed => write!(f, "replay pool is no longer accepting work"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FileRead { source, .. } | Self::DirectoryList { source, .. } => Some(source),
            _ => None,
        }
    }
}
