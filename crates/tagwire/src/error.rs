use std::{io, process::ExitStatus};

use thiserror::Error;

use crate::ChannelState;

/// Errors surfaced by a [`crate::Channel`].
///
/// Per-request failures (timeouts, a dead child) are not errors; they come back as
/// [`crate::Outcome`] variants.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("child {stream} unavailable")]
    StreamUnavailable { stream: &'static str },
    #[error("channel is {state}; requests need an open channel")]
    NotOpen { state: ChannelState },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to wait for child process: {source}")]
    Wait {
        #[source]
        source: io::Error,
    },
    #[error("failed to join reader task: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("child exited with {status}")]
    BadExit { status: ExitStatus },
}

impl ChannelError {
    /// Exit code carried by [`ChannelError::BadExit`], when the child exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::BadExit { status } => status.code(),
            _ => None,
        }
    }
}

/// Failure of a [`crate::Channel::scoped`] block.
///
/// An error returned by the body always wins over a teardown failure, so the caller's
/// own error is never masked by a bad exit status.
#[derive(Debug, Error)]
pub enum ScopeError<E> {
    #[error("{0}")]
    Body(E),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl<E> ScopeError<E> {
    /// Exit code of the child when the scope failed with a bad exit.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Channel(err) => err.exit_code(),
            Self::Body(_) => None,
        }
    }

    pub fn is_bad_exit(&self) -> bool {
        matches!(self, Self::Channel(ChannelError::BadExit { .. }))
    }
}
