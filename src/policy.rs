//! What happens when a command finishes unsuccessfully.

use crate::error::{CommandError, Result};
use crate::flog::{write_to_fd, FLOG};
use crate::proc::ProcStatus;
use std::os::fd::RawFd;

/// How an unsuccessful status is treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ErrorPolicy {
    /// Report the outcome as `false`.
    #[default]
    Ignore,
    /// Write a one-line diagnostic to the current stderr, then report `false`.
    Warn,
    /// Fail with [`CommandError`].
    Raise,
}

/// Prefix of the diagnostic written under [`ErrorPolicy::Warn`].
pub const WARNING_PREFIX: &str = "shpipe: command error: ";

/// Format the diagnostic for a failed command.
pub fn warning_message(command_line: &str, status: ProcStatus) -> String {
    format!("{}{}: {}\n", WARNING_PREFIX, command_line, status)
}

/// Resolve `status` of `command_line` into a boolean outcome under `policy`.
/// `stderr` is where warnings go; None means stderr is closed and warnings are dropped.
pub fn apply_policy(
    policy: ErrorPolicy,
    status: ProcStatus,
    command_line: &str,
    stderr: Option<RawFd>,
) -> Result<bool> {
    if status.is_success() {
        return Ok(true);
    }
    FLOG!(
        command_error,
        format!("'{}'", command_line),
        status,
        format!("(policy {:?})", policy)
    );
    match policy {
        ErrorPolicy::Ignore => Ok(false),
        ErrorPolicy::Warn => {
            if let Some(fd) = stderr {
                let msg = warning_message(command_line, status);
                if let Err(err) = write_to_fd(msg.as_bytes(), fd) {
                    FLOG!(warning, "Could not write command error to fd", fd, ":", err);
                }
            }
            Ok(false)
        }
        ErrorPolicy::Raise => Err(CommandError::new(command_line, status).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_policy, warning_message, ErrorPolicy};
    use crate::proc::ProcStatus;

    #[test]
    fn test_success_is_true_under_every_policy() {
        for policy in [ErrorPolicy::Ignore, ErrorPolicy::Warn, ErrorPolicy::Raise] {
            assert!(apply_policy(policy, ProcStatus::success(), "true", None).unwrap());
        }
    }

    #[test]
    fn test_failure_by_policy() {
        let failed = ProcStatus::from_exit_code(2);
        assert!(!apply_policy(ErrorPolicy::Ignore, failed, "false", None).unwrap());
        assert!(!apply_policy(ErrorPolicy::Warn, failed, "false", None).unwrap());
        let err = apply_policy(ErrorPolicy::Raise, failed, "grep x", None).unwrap_err();
        let err = err.as_command_error().unwrap();
        assert_eq!(err.command_line, "grep x");
        assert_eq!(err.status, failed);
    }

    #[test]
    fn test_warning_message() {
        assert_eq!(
            warning_message("false", ProcStatus::from_exit_code(1)),
            "shpipe: command error: false: exited with 1\n"
        );
        assert_eq!(
            warning_message("yes | head", ProcStatus::from_signal(libc::SIGPIPE)),
            "shpipe: command error: yes | head: killed by SIGPIPE\n"
        );
    }
}
