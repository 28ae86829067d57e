//! Errors returned by `wrap`

use std::io;
use std::path::PathBuf;

use crate::forwarder::StreamKind;

/// Errors that can occur while setting up or supervising the payload
#[derive(Debug, thiserror::Error)]
pub enum WrapError {
    #[error("Invalid wrap configuration: {0}")]
    Config(String),

    #[error("Failed to locate the current executable: {0}")]
    Executable(#[source] io::Error),

    #[error("Failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O failure on a monitored stream. The child was still reaped, and
    /// `captured` tells whether the handler already ran.
    #[error("I/O error on child {stream} (child exited with {exit_status}): {source}")]
    Stream {
        stream: StreamKind,
        exit_status: i32,
        captured: bool,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] io::Error),
}

impl WrapError {
    /// Exit status of the child, for errors raised after it was reaped
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            WrapError::Stream { exit_status, .. } => Some(*exit_status),
            _ => None,
        }
    }

    /// Whether a crash capture was handed to the handler before the error
    pub fn captured(&self) -> bool {
        matches!(self, WrapError::Stream { captured: true, .. })
    }
}
