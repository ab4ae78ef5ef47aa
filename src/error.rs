//! Error types for running commands and pipelines.

use crate::proc::ProcStatus;
use errno::Errno;
use thiserror::Error;

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

/// A command or pipeline which finished unsuccessfully while the error policy was
/// [`Raise`](crate::ErrorPolicy::Raise).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{command_line}: {status}")]
pub struct CommandError {
    /// The full command line; stages of a pipeline are joined with ` | `.
    pub command_line: String,
    pub status: ProcStatus,
}

impl CommandError {
    pub fn new(command_line: impl Into<String>, status: ProcStatus) -> Self {
        Self {
            command_line: command_line.into(),
            status,
        }
    }

    /// The exit code, or 128 plus the signal number for signal deaths.
    pub fn status_value(&self) -> i32 {
        self.status.status_value()
    }
}

/// The error type of every fallible operation in this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// The program could not be located or executed, or a task thread could not start.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: Errno,
    },

    /// A pipe could not be created.
    #[error("failed to allocate pipe: {0}")]
    PipeAllocation(#[source] nix::Error),

    /// An isolated callable panicked before producing a value.
    #[error("callable '{callable}' failed: {message}")]
    Execution { callable: String, message: String },

    /// A command failed under the raise policy.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// An operation was called with arguments it cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A redirection target or temporary file could not be opened or read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a spawn error
    pub fn spawn(command: impl Into<String>, source: Errno) -> Self {
        Self::Spawn {
            command: command.into(),
            source,
        }
    }

    /// Create an execution error
    pub fn execution(callable: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            callable: callable.into(),
            message: message.into(),
        }
    }

    /// Return the command error if this is one.
    pub fn as_command_error(&self) -> Option<&CommandError> {
        match self {
            Error::Command(err) => Some(err),
            _ => None,
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::PipeAllocation(err)
    }
}
