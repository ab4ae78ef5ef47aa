//! Capturing output and feeding input, built on redirections and pipes.

use crate::command::Stage;
use crate::error::{Error, Result};
use crate::exec::SpawnOptions;
use crate::fds::make_autoclose_pipes;
use crate::flog::FLOG;
use crate::io::{IoFd, IoPipe};
use crate::proc::{Pid, SpawnHandle};
use crate::shell::Shell;
use crate::tempfile;
use bitflags::bitflags;
use libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// Read everything written to `file` from the start.
fn read_back(file: &mut File) -> Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Split captured output into lines, without their terminators.
fn split_lines(output: &str) -> Vec<String> {
    output.lines().map(str::to_owned).collect()
}

impl Shell {
    /// Run `f` with stdout going to a buffer. Returns what was written, and the value of `f`.
    pub fn out_s<R>(&self, f: impl FnOnce(&Shell) -> Result<R>) -> Result<(String, R)> {
        let mut buffer = tempfile::new_unlinked()?;
        let value = self.with_redirect_stdout_to(&buffer, f)?;
        Ok((read_back(&mut buffer)?, value))
    }

    /// Like [`Shell::out_s`], with trailing whitespace removed from the output.
    pub fn out_ss<R>(&self, f: impl FnOnce(&Shell) -> Result<R>) -> Result<(String, R)> {
        let (mut output, value) = self.out_s(f)?;
        output.truncate(output.trim_end().len());
        Ok((output, value))
    }

    /// Like [`Shell::out_s`], with the output split into lines.
    pub fn out_lines<R>(&self, f: impl FnOnce(&Shell) -> Result<R>) -> Result<(Vec<String>, R)> {
        let (output, value) = self.out_s(f)?;
        Ok((split_lines(&output), value))
    }

    /// Like [`Shell::out_s`], capturing stderr into the same buffer.
    pub fn out_err_s<R>(&self, f: impl FnOnce(&Shell) -> Result<R>) -> Result<(String, R)> {
        self.out_s(|sh| sh.with_redirect_stderr_to_stdout(f))
    }

    /// Like [`Shell::out_err_s`], with trailing whitespace removed from the output.
    pub fn out_err_ss<R>(&self, f: impl FnOnce(&Shell) -> Result<R>) -> Result<(String, R)> {
        let (mut output, value) = self.out_err_s(f)?;
        output.truncate(output.trim_end().len());
        Ok((output, value))
    }

    /// Run `stage`, calling `on_line` for every line of its stdout as it arrives. Lines are
    /// passed without their terminator. Returns the outcome of the stage under the current
    /// policy.
    pub fn each_line(
        &self,
        stage: impl Into<Stage>,
        mut on_line: impl FnMut(&str),
    ) -> Result<bool> {
        let stage = stage.into();
        let context = stage.display_name();
        let pipe = make_autoclose_pipes()?;
        let options =
            SpawnOptions::new().stdout(Arc::new(IoPipe::new(STDOUT_FILENO, pipe.write)));
        let handle = self.spawn(stage, options)?;

        let mut reader = BufReader::new(File::from(pipe.read));
        let mut line = Vec::new();
        let read_result = loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break Ok(()),
                Ok(_) => {
                    if line.last() == Some(&b'\n') {
                        line.pop();
                    }
                    on_line(&String::from_utf8_lossy(&line));
                }
                Err(err) => break Err(err),
            }
        };
        // Close our end before waiting, so a writer we stopped reading from sees EPIPE.
        drop(reader);
        let status = handle
            .wait()
            .map_err(|err| Error::spawn(context.as_str(), err))?;
        read_result?;
        self.check_status(status, &context)
    }

    /// Run `f` with stdin reading `input`.
    pub fn in_s<R>(&self, input: &str, f: impl FnOnce(&Shell) -> Result<R>) -> Result<R> {
        let mut buffer = tempfile::new_unlinked()?;
        buffer.write_all(input.as_bytes())?;
        buffer.seek(SeekFrom::Start(0))?;
        self.with_redirect_stdin_to(&buffer, f)
    }

    /// Run `f` with stdin reading `lines`, each followed by a newline.
    pub fn in_lines<I, S, R>(&self, lines: I, f: impl FnOnce(&Shell) -> Result<R>) -> Result<R>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut input = String::new();
        for line in lines {
            input.push_str(line.as_ref());
            input.push('\n');
        }
        self.in_s(&input, f)
    }

    /// Run `f` with stdin reading `input` and stdout going to a buffer.
    pub fn io_s<R>(&self, input: &str, f: impl FnOnce(&Shell) -> Result<R>) -> Result<(String, R)> {
        self.in_s(input, |sh| sh.out_s(f))
    }

    /// Like [`Shell::io_s`], with trailing whitespace removed from the output.
    pub fn io_ss<R>(&self, input: &str, f: impl FnOnce(&Shell) -> Result<R>) -> Result<(String, R)> {
        self.in_s(input, |sh| sh.out_ss(f))
    }

    /// Start `stage` with pipes for the selected standard streams, returning our ends of them.
    ///
    /// [`PopenStreams::STDERR_TO_STDOUT`] sends stderr into the stdout pipe; it needs
    /// [`PopenStreams::STDOUT`] and excludes [`PopenStreams::STDERR`].
    pub fn popen(&self, stage: impl Into<Stage>, streams: PopenStreams) -> Result<Popen<'_>> {
        if streams.contains(PopenStreams::STDERR_TO_STDOUT) {
            if !streams.contains(PopenStreams::STDOUT) {
                return Err(Error::InvalidArgument(
                    "stderr cannot follow stdout unless stdout is piped".into(),
                ));
            }
            if streams.contains(PopenStreams::STDERR) {
                return Err(Error::InvalidArgument(
                    "stderr cannot be piped separately and into stdout".into(),
                ));
            }
        }
        let stage = stage.into();
        let command_line = stage.display_name();
        let mut options = SpawnOptions::new();
        let (mut stdin, mut stdout, mut stderr) = (None, None, None);
        if streams.contains(PopenStreams::STDIN) {
            let pipe = make_autoclose_pipes()?;
            options = options.stdin(Arc::new(IoPipe::new(STDIN_FILENO, pipe.read)));
            stdin = Some(File::from(pipe.write));
        }
        if streams.contains(PopenStreams::STDOUT) {
            let pipe = make_autoclose_pipes()?;
            options = options.stdout(Arc::new(IoPipe::new(STDOUT_FILENO, pipe.write)));
            stdout = Some(File::from(pipe.read));
        }
        if streams.contains(PopenStreams::STDERR) {
            let pipe = make_autoclose_pipes()?;
            options = options.stderr(Arc::new(IoPipe::new(STDERR_FILENO, pipe.write)));
            stderr = Some(File::from(pipe.read));
        }
        if streams.contains(PopenStreams::STDERR_TO_STDOUT) {
            options = options.stderr(Arc::new(IoFd::new(STDERR_FILENO, STDOUT_FILENO)));
        }
        let handle = self.spawn(stage, options)?;
        FLOG!(exec_pipeline, "popen", format!("{:?}", handle), format!("{:?}", streams));
        Ok(Popen {
            shell: self,
            command_line,
            handle: Some(handle),
            stdin,
            stdout,
            stderr,
        })
    }
}

bitflags! {
    /// Which standard streams of a [`Popen`] are connected to the caller.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PopenStreams: u8 {
        const STDIN = 1 << 0;
        const STDOUT = 1 << 1;
        const STDERR = 1 << 2;
        /// Stderr shares the stdout pipe.
        const STDERR_TO_STDOUT = 1 << 3;
    }
}

/// A stage started by [`Shell::popen`]. Dropping it without waiting detaches the stage.
pub struct Popen<'a> {
    shell: &'a Shell,
    command_line: String,
    handle: Option<SpawnHandle>,
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
}

impl<'a> Popen<'a> {
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// The process id, for an external stage which has not been waited for.
    pub fn pid(&self) -> Option<Pid> {
        self.handle.as_ref().and_then(SpawnHandle::pid)
    }

    /// The write end of the stage's stdin, if requested and not yet taken.
    pub fn stdin(&mut self) -> Option<&mut File> {
        self.stdin.as_mut()
    }

    /// The read end of the stage's stdout.
    pub fn stdout(&mut self) -> Option<&mut File> {
        self.stdout.as_mut()
    }

    /// The read end of the stage's stderr.
    pub fn stderr(&mut self) -> Option<&mut File> {
        self.stderr.as_mut()
    }

    /// Take ownership of the stdin pipe. Dropping it signals end of input.
    pub fn take_stdin(&mut self) -> Option<File> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<File> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<File> {
        self.stderr.take()
    }

    /// Close our ends of the pipes, wait for the stage, and resolve its status under the
    /// policy of the shell it was started from.
    pub fn wait(mut self) -> Result<bool> {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        let Some(handle) = self.handle.take() else {
            return Ok(true);
        };
        let status = handle
            .wait()
            .map_err(|err| Error::spawn(self.command_line.as_str(), err))?;
        self.shell.check_status(status, &self.command_line)
    }
}

impl Drop for Popen<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            FLOG!(
                proc_reap_external,
                "Detaching unwaited popen",
                format!("'{}'", self.command_line)
            );
            handle.detach();
        }
    }
}

impl fmt::Debug for Popen<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Popen")
            .field("command_line", &self.command_line)
            .field("handle", &self.handle)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}
