//! Descriptions of what a spawn runs: an external program or an in-process callable.

use crate::common::join_command_line;
use crate::io::{IoChain, IoClose, IoDataRef, IoFd, IoFile, IoStreams, OutputStream};
use crate::proc::ProcStatus;
use libc::{EXIT_FAILURE, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::os::fd::RawFd;
use std::sync::Arc;

/// An external program with its arguments and its own fd options.
/// The options are applied on top of the redirections in effect when it is spawned.
#[derive(Clone)]
pub struct Command {
    argv: Vec<OsString>,
    redirections: IoChain,
    close: Vec<RawFd>,
    close_others: bool,
}

impl Command {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Command {
            argv: vec![program.as_ref().to_owned()],
            redirections: IoChain::new(),
            close: vec![],
            close_others: false,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.argv.push(arg.as_ref().to_owned());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.argv
            .extend(args.into_iter().map(|s| s.as_ref().to_owned()));
        self
    }

    /// Add an fd override. Later overrides for the same fd win.
    pub fn redirect(mut self, io: IoDataRef) -> Self {
        self.redirections.push(io);
        self
    }

    pub fn stdin_file(self, file: File) -> Self {
        self.redirect(Arc::new(IoFile::new(STDIN_FILENO, file)))
    }

    pub fn stdout_file(self, file: File) -> Self {
        self.redirect(Arc::new(IoFile::new(STDOUT_FILENO, file)))
    }

    pub fn stderr_file(self, file: File) -> Self {
        self.redirect(Arc::new(IoFile::new(STDERR_FILENO, file)))
    }

    /// Send stderr wherever stdout goes at this point in the option list.
    pub fn stderr_to_stdout(self) -> Self {
        self.redirect(Arc::new(IoFd::new(STDERR_FILENO, STDOUT_FILENO)))
    }

    /// Close `fd` in the child before exec.
    pub fn close(mut self, fd: RawFd) -> Self {
        self.close.push(fd);
        self
    }

    /// If set, the child inherits no descriptors other than 0, 1, 2 and explicit redirection
    /// targets.
    pub fn close_others(mut self, close_others: bool) -> Self {
        self.close_others = close_others;
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.argv[0]
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    pub fn redirections(&self) -> &IoChain {
        &self.redirections
    }

    pub fn close_fds(&self) -> &[RawFd] {
        &self.close
    }

    pub fn closes_others(&self) -> bool {
        self.close_others
    }

    /// The command line, quoted so it could be pasted into a shell.
    pub fn command_line(&self) -> String {
        join_command_line(&self.argv)
    }

    /// Add the close list as close entries of `chain`.
    pub(crate) fn append_close_list(&self, chain: &mut IoChain) {
        for &fd in &self.close {
            chain.push(Arc::new(IoClose::new(fd)));
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("argv", &self.argv)
            .field("redirections", &self.redirections)
            .field("close", &self.close)
            .field("close_others", &self.close_others)
            .finish()
    }
}

/// Build a [`Command`] from a program and its arguments.
///
/// ```rust
/// let tr = shpipe::cmd!("tr", "ab", "AB");
/// assert_eq!(tr.command_line(), "tr ab AB");
/// ```
#[macro_export]
macro_rules! cmd {
    ($program:expr $(, $arg:expr)* $(,)?) => {
        $crate::Command::new($program)$(.arg($arg))*
    };
}

/// The value a callable returns, turned into the status its stage finishes with.
pub trait TaskResult {
    /// Return the status. Failures may be described on the task's stderr.
    fn into_status(self, name: &str, stderr: &mut OutputStream) -> ProcStatus;
}

impl TaskResult for () {
    fn into_status(self, _name: &str, _stderr: &mut OutputStream) -> ProcStatus {
        ProcStatus::success()
    }
}

impl TaskResult for bool {
    fn into_status(self, _name: &str, _stderr: &mut OutputStream) -> ProcStatus {
        if self {
            ProcStatus::success()
        } else {
            ProcStatus::from_exit_code(EXIT_FAILURE)
        }
    }
}

impl TaskResult for ProcStatus {
    fn into_status(self, _name: &str, _stderr: &mut OutputStream) -> ProcStatus {
        self
    }
}

impl<T> TaskResult for Option<T> {
    fn into_status(self, name: &str, stderr: &mut OutputStream) -> ProcStatus {
        self.is_some().into_status(name, stderr)
    }
}

impl<T, E: fmt::Display> TaskResult for Result<T, E> {
    fn into_status(self, name: &str, stderr: &mut OutputStream) -> ProcStatus {
        match self {
            Ok(_) => ProcStatus::success(),
            Err(err) => {
                let _ = writeln!(stderr, "{}: {}", name, err);
                ProcStatus::from_exit_code(EXIT_FAILURE)
            }
        }
    }
}

type CallableBody = Box<dyn FnOnce(&mut IoStreams<'_>) -> ProcStatus + Send + 'static>;

/// A unit of in-process work which can stand in a pipeline like a program.
pub struct Callable {
    name: String,
    body: CallableBody,
}

impl Callable {
    pub fn new<F, R>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(&mut IoStreams<'_>) -> R + Send + 'static,
        R: TaskResult,
    {
        let name = name.into();
        let task_name = name.clone();
        Callable {
            name,
            body: Box::new(move |streams: &mut IoStreams<'_>| {
                let result = f(streams);
                result.into_status(&task_name, &mut streams.stderr)
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the body against `streams`, returning its status.
    pub fn invoke(self, streams: &mut IoStreams<'_>) -> ProcStatus {
        (self.body)(streams)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").field("name", &self.name).finish()
    }
}

/// One element of a pipeline.
#[derive(Debug)]
pub enum Stage {
    External(Command),
    Callable(Callable),
}

impl Stage {
    /// The command line, or the callable's name.
    pub fn display_name(&self) -> String {
        match self {
            Stage::External(cmd) => cmd.command_line(),
            Stage::Callable(callable) => callable.name().to_owned(),
        }
    }
}

impl From<Command> for Stage {
    fn from(cmd: Command) -> Self {
        Stage::External(cmd)
    }
}

impl From<Callable> for Stage {
    fn from(callable: Callable) -> Self {
        Stage::Callable(callable)
    }
}

#[cfg(test)]
mod tests {
    use super::{Callable, Command, Stage, TaskResult};
    use crate::io::OutputStream;
    use crate::proc::ProcStatus;

    #[test]
    fn test_command_builder() {
        let cmd = crate::cmd!("printf", "%s", "it's")
            .args(["a", "b c"])
            .close(7)
            .close_others(true);
        assert_eq!(cmd.program(), "printf");
        assert_eq!(cmd.argv().len(), 5);
        assert_eq!(cmd.close_fds(), &[7]);
        assert!(cmd.closes_others());
        assert_eq!(cmd.command_line(), r"printf %s 'it'\''s' a 'b c'");
    }

    #[test]
    fn test_stage_names() {
        let stage: Stage = Command::new("true").into();
        assert_eq!(stage.display_name(), "true");
        let stage: Stage = Callable::new("upcase", |_| ()).into();
        assert_eq!(stage.display_name(), "upcase");
        assert!(matches!(stage, Stage::Callable(_)));
    }

    #[test]
    fn test_task_results() {
        let mut sink = OutputStream::Null;
        assert!(().into_status("t", &mut sink).is_success());
        assert!(!false.into_status("t", &mut sink).is_success());
        assert!(Some(3).into_status("t", &mut sink).is_success());
        assert!(!None::<i32>.into_status("t", &mut sink).is_success());
        let failed: Result<(), String> = Err("boom".into());
        assert_eq!(failed.into_status("t", &mut sink).exit_code(), 1);
        let status = ProcStatus::from_exit_code(4);
        assert_eq!(status.into_status("t", &mut sink), status);
    }
}
