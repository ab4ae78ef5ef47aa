//! Launching one stage: an external program as a child process, or a callable on its own thread.

use crate::command::{Callable, Command, Stage};
use crate::common::exit_without_destructors;
use crate::env::EnvStack;
use crate::error::{Error, Result};
use crate::fds::make_autoclose_pipes;
use crate::flog::FLOG;
use crate::fork_exec::flog_safe::FLOG_SAFE;
use crate::fork_exec::postfork::{
    child_setup_process, close_others_limit, execute_fork, report_errno_to_parent,
    safe_report_exec_error,
};
#[cfg(use_posix_spawn)]
use crate::fork_exec::spawn::PosixSpawner;
use crate::fork_exec::{exit_code_for_exec_error, PATH_BSHELL};
use crate::io::{IoChain, IoClose, IoDataRef, IoStreams};
use crate::null_terminated_array::OwningNullTerminatedArray;
use crate::path::resolve_program;
use crate::proc::{
    reap_pending_pids, wait_pid, ExternalProc, InternalProc, Pid, ProcStatus, SpawnHandle,
};
use crate::redirection::{dup2_list_resolve_chain, Dup2List};
use crate::shell::Shell;
use crate::threads;
use errno::{errno, set_errno, Errno};
use libc::{c_char, EXIT_FAILURE, ENOEXEC};
use std::any::Any;
use std::ffi::{CStr, CString, OsStr};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Number of calls to fork() or posix_spawn().
static FORK_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Per-spawn fd overrides, layered on top of the context's redirections.
#[derive(Clone, Debug, Default)]
pub struct SpawnOptions {
    pub stdin: Option<IoDataRef>,
    pub stdout: Option<IoDataRef>,
    pub stderr: Option<IoDataRef>,
    /// Fds to close in an external child before exec. Ignored for callables, which share our
    /// fd table.
    pub close: Vec<RawFd>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Default::default()
    }
    pub fn stdin(mut self, io: IoDataRef) -> Self {
        self.stdin = Some(io);
        self
    }
    pub fn stdout(mut self, io: IoDataRef) -> Self {
        self.stdout = Some(io);
        self
    }
    pub fn stderr(mut self, io: IoDataRef) -> Self {
        self.stderr = Some(io);
        self
    }
    pub fn close(mut self, fd: RawFd) -> Self {
        self.close.push(fd);
        self
    }
}

/// Launch `stage` under the redirections of `shell` plus `options`.
///
/// The chain is ordered: context redirections, then stdout and stderr overrides, then the
/// command's own redirections, and finally the stdin override. An output pipe is thus in place
/// before the command's own redirections refer to it, while an input override wins over them.
pub fn spawn_stage(shell: &Shell, stage: Stage, options: SpawnOptions) -> Result<SpawnHandle> {
    let SpawnOptions {
        stdin,
        stdout,
        stderr,
        close,
    } = options;
    reap_pending_pids();
    let mut chain = shell.materialize();
    chain.extend(stdout);
    chain.extend(stderr);
    match stage {
        Stage::External(cmd) => {
            chain.append(cmd.redirections());
            chain.extend(stdin);
            for fd in close {
                chain.push(Arc::new(IoClose::new(fd)));
            }
            cmd.append_close_list(&mut chain);
            exec_external_command(&cmd, &chain, &shell.env())
        }
        Stage::Callable(callable) => {
            chain.extend(stdin);
            spawn_internal(callable, chain, shell)
        }
    }
}

/// Executes an external command with the environment and working directory of `env`.
/// Returns once the program is running, or has failed to start.
fn exec_external_command(cmd: &Command, chain: &IoChain, env: &EnvStack) -> Result<SpawnHandle> {
    let fail = |err: Errno| Error::spawn(cmd.command_line(), err);

    // Get everything the child needs before we fork.
    let search_path = env.get(OsStr::new("PATH"));
    let actual_cmd =
        resolve_program(cmd.program(), search_path.as_deref(), env.pwd()).map_err(fail)?;
    let actual_cmd =
        CString::new(actual_cmd.into_os_string().into_vec()).map_err(|_| fail(Errno(libc::EINVAL)))?;
    let argv = OwningNullTerminatedArray::from_os_strs(cmd.argv())
        .map_err(|_| fail(Errno(libc::EINVAL)))?;
    let envv = env.export_array();
    let cwd = env
        .pwd()
        .map(|pwd| CString::new(pwd.as_os_str().as_bytes()))
        .transpose()
        .map_err(|_| fail(Errno(libc::EINVAL)))?;

    // Convert our IO chain to a dup2 sequence.
    let dup2s = dup2_list_resolve_chain(chain);
    FLOG!(redirect, "dup2s for", cmd.command_line(), format!("{:?}", dup2s));

    let command_line = cmd.command_line();
    let pid = launch_process(
        &actual_cmd,
        &argv,
        &envv,
        &dup2s,
        cwd.as_deref(),
        cmd.closes_others(),
        &command_line,
    )
    .map_err(fail)?;
    let pid = Pid::new(pid).ok_or_else(|| fail(Errno(libc::ECHILD)))?;
    Ok(SpawnHandle::External(ExternalProc { pid, command_line }))
}

// Returns whether we can use posix_spawn for a given command.
#[cfg(use_posix_spawn)]
fn can_use_posix_spawn(dup2s: &Dup2List, cwd: Option<&CStr>, close_others: bool) -> bool {
    // Is it globally disabled?
    if !crate::config::use_posix_spawn() {
        return false;
    }
    // There is no portable file action for changing directory.
    if cwd.is_some() {
        return false;
    }
    // Marking inherited fds CLOEXEC needs code in the child.
    if close_others {
        return false;
    }
    // Hack - do not use posix_spawn if there are self-fd redirections.
    // An fd which is already at its target keeps CLO_EXEC even if we add a dup2 action, so
    // instead we'll call fork() and clear the CLO_EXEC bit manually.
    if dup2s.has_self_dup() {
        return false;
    }
    // Closing an fd which is not open fails the whole spawn on some platforms.
    !dup2s.get_actions().iter().any(|act| act.target < 0)
}

/// Start the program, preferring posix_spawn. Returns the pid, or the errno of the failure.
fn launch_process(
    actual_cmd: &CStr,
    argv: &OwningNullTerminatedArray,
    envv: &OwningNullTerminatedArray,
    dup2s: &Dup2List,
    cwd: Option<&CStr>,
    close_others: bool,
    command_line: &str,
) -> std::result::Result<libc::pid_t, Errno> {
    #[cfg(use_posix_spawn)]
    // Prefer to use posix_spawn, since it's faster on some systems like OS X.
    if can_use_posix_spawn(dup2s, cwd, close_others) {
        let count = FORK_COUNT.fetch_add(1, Ordering::Relaxed) + 1; // spawn counts as a fork+exec
        let pid = PosixSpawner::new(dup2s).and_then(|mut spawner| {
            spawner.spawn(actual_cmd.as_ptr(), argv.get_mut(), envv.get_mut())
        });
        let pid = match pid {
            Ok(pid) => pid,
            Err(err) => {
                safe_report_exec_error(err.0, actual_cmd, argv, envv);
                return Err(err);
            }
        };
        FLOG!(
            exec_fork,
            format!("Fork #{}, pid {}: spawn external command '{}'", count, pid, command_line)
        );
        return Ok(pid);
    }

    fork_child_for_process(actual_cmd, argv, envv, dup2s, cwd, close_others, command_line)
}

/// Call fork(), set up the child and exec the program in it.
/// The child reports a failed exec over a CLOEXEC pipe: EOF means exec succeeded, four bytes are
/// the errno of the failure. A child which failed is reaped before returning.
fn fork_child_for_process(
    actual_cmd: &CStr,
    argv: &OwningNullTerminatedArray,
    envv: &OwningNullTerminatedArray,
    dup2s: &Dup2List,
    cwd: Option<&CStr>,
    close_others: bool,
    command_line: &str,
) -> std::result::Result<libc::pid_t, Errno> {
    let report = make_autoclose_pipes().map_err(|err| Errno(err as i32))?;
    let close_others_below = close_others.then(close_others_limit);

    // A redirection landing on the report pipe would clobber it. Don't report in that case.
    let report_fd = report.write.as_raw_fd();
    let report_fd = if dup2s
        .get_actions()
        .iter()
        .any(|act| act.target == report_fd || act.src == report_fd)
    {
        -1
    } else {
        report_fd
    };

    // Time to fork.
    let pid = execute_fork().map_err(Errno)?;
    if pid == 0 {
        // Set up the child process and exec.
        let err = child_setup_process(dup2s, cwd, close_others_below);
        if err != 0 {
            report_errno_to_parent(report_fd, err);
            exit_without_destructors(EXIT_FAILURE);
        }
        safe_launch_process(actual_cmd, argv, envv, report_fd);
    }

    let count = FORK_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    FLOG!(
        exec_fork,
        format!("Fork #{}, pid {}: fork external command '{}'", count, pid, command_line)
    );

    // Close our copy of the write end, so we see EOF once the child has exec'd.
    drop(report.write);
    let mut buf = Vec::with_capacity(4);
    if let Err(err) = File::from(report.read).read_to_end(&mut buf) {
        FLOG!(warning, "Could not read exec status of pid", pid, ":", err);
    }
    if buf.len() < 4 {
        return Ok(pid);
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[..4]);
    let err = Errno(i32::from_ne_bytes(raw));
    if let Some(child) = Pid::new(pid) {
        let status = wait_pid(child);
        FLOG!(exec_fork, "pid", pid, "failed to exec:", err, format!("{:?}", status));
    }
    Err(err)
}

/// This is a 'looks like text' check.
/// Return true if either there is no NUL byte, or there is a line containing a lowercase letter
/// before the first NUL byte.
fn is_thompson_shell_payload(p: &[u8]) -> bool {
    if !p.contains(&b'\0') {
        return true;
    };
    let mut haslower = false;
    for c in p {
        if c.is_ascii_lowercase() || *c == b'$' || *c == b'`' {
            haslower = true;
        }
        if haslower && *c == b'\n' {
            return true;
        }
    }
    false
}

/// This function checks the beginning of a file to see if it's safe to
/// pass to the system interpreter when execve() returns ENOEXEC.
///
/// The motivation is to be able to run classic shell scripts which
/// didn't have shebang, while protecting the user from accidentally
/// running a binary file which may corrupt terminal driver state. We
/// check for lowercase letters because the ASCII magic of binary files
/// is usually uppercase, e.g. PNG, JFIF, MZ, etc.
/// N.B.: this is called after fork, it must not allocate heap memory.
pub fn is_thompson_shell_script(path: &CStr) -> bool {
    let e = errno();
    let mut res = false;
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_NOCTTY | libc::O_CLOEXEC) };
    if fd >= 0 {
        let mut buf = [b'\0'; 256];
        let got = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if got >= 0 && is_thompson_shell_payload(&buf[..got as usize]) {
            res = true;
        }
        unsafe { libc::close(fd) };
    }
    set_errno(e);
    res
}

/// This function is executed by the child process created by a call to fork(). It should be called
/// after `child_setup_process`. It calls execve to replace our process image with the program.
/// It never returns. Called in a forked child! Do not allocate memory, etc.
fn safe_launch_process(
    actual_cmd: &CStr,
    argv: &OwningNullTerminatedArray,
    envv: &OwningNullTerminatedArray,
    report_fd: RawFd,
) -> ! {
    unsafe { libc::execve(actual_cmd.as_ptr(), argv.get(), envv.get()) };
    let err = errno();

    // The shebang wasn't introduced until UNIX Seventh Edition, so if
    // the kernel won't run the binary we hand it off to the interpreter
    // after performing a binary safety check, recommended by POSIX: a
    // line needs to exist before the first \0 with a lowercase letter

    if err.0 == ENOEXEC && is_thompson_shell_script(actual_cmd) {
        // Construct new argv.
        // We must not allocate memory, so only 128 args are supported.
        const MAXARGS: usize = 128;
        let nargs = argv.len();
        let argv = unsafe { slice::from_raw_parts(argv.get(), nargs) };
        if nargs <= MAXARGS {
            // +1 for /bin/sh, +1 for terminating nullptr
            let mut argv2 = [std::ptr::null(); 1 + MAXARGS + 1];
            let bshell = PATH_BSHELL.as_ptr() as *const c_char;
            argv2[0] = bshell;
            argv2[1..argv.len() + 1].copy_from_slice(argv);
            // The command to call should use the full path,
            // not what we would pass as argv0.
            argv2[1] = actual_cmd.as_ptr();
            unsafe {
                libc::execve(bshell, &argv2[0], envv.get());
            }
        }
    }

    FLOG_SAFE!(exec_fork, "execve failed with errno ", err.0);
    safe_report_exec_error(err.0, actual_cmd, argv, envv);
    report_errno_to_parent(report_fd, err.0);
    exit_without_destructors(exit_code_for_exec_error(err.0));
}

/// Extract a printable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Thread names may not contain NUL.
fn thread_name(name: &str) -> String {
    format!("shpipe task {}", name.replace('\0', ""))
}

/// Run a callable to completion in the current thread, under `shell`.
/// A panic is turned into a failed status with a diagnostic on the callable's stderr.
pub(crate) fn run_task(shell: &Shell, callable: Callable) -> ProcStatus {
    let mut streams = IoStreams::new(shell);
    let name = callable.name().to_owned();
    match panic::catch_unwind(AssertUnwindSafe(|| callable.invoke(&mut streams))) {
        Ok(status) => status,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            FLOG!(proc_internal_proc, format!("'{}' panicked:", name), message);
            let _ = writeln!(
                streams.stderr,
                "shpipe: callable '{}' panicked: {}",
                name, message
            );
            ProcStatus::from_exit_code(EXIT_FAILURE)
        }
    }
}

/// Start a callable on its own thread. Its context is `chain` with a copy of the environment and
/// policy of `shell`; everything it needs moves into the thread.
fn spawn_internal(callable: Callable, chain: IoChain, shell: &Shell) -> Result<SpawnHandle> {
    let task_shell = Shell::for_task(chain, shell);
    let id = InternalProc::next_id();
    let name = callable.name().to_owned();
    FLOG!(proc_internal_proc, "Starting internal proc", id, format!("('{}')", name));
    let thread = threads::spawn(thread_name(&name), move || run_task(&task_shell, callable))
        .map_err(|err| {
            Error::spawn(
                name.clone(),
                Errno(err.raw_os_error().unwrap_or(libc::EAGAIN)),
            )
        })?;
    Ok(SpawnHandle::Internal(InternalProc::new(id, name, thread)))
}

/// Run `f` on its own thread with a snapshot of `shell`, and return its value.
pub(crate) fn run_isolated<R, F>(shell: &Shell, name: String, f: F) -> Result<R>
where
    F: FnOnce(&mut IoStreams<'_>) -> R + Send + 'static,
    R: Send + 'static,
{
    let task_shell = shell.snapshot();
    let thread = threads::spawn(thread_name(&name), move || {
        let mut streams = IoStreams::new(&task_shell);
        panic::catch_unwind(AssertUnwindSafe(|| f(&mut streams)))
            .map_err(|payload| panic_message(payload.as_ref()))
    })
    .map_err(|err| {
        Error::spawn(
            name.clone(),
            Errno(err.raw_os_error().unwrap_or(libc::EAGAIN)),
        )
    })?;
    match thread.join() {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(Error::execution(name, message)),
        Err(payload) => Err(Error::execution(name, panic_message(payload.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use super::{is_thompson_shell_payload, panic_message};

    #[test]
    fn test_thompson_shell_payload() {
        assert!(is_thompson_shell_payload(b"echo hello\n"));
        assert!(is_thompson_shell_payload(b""));
        assert!(is_thompson_shell_payload(b"echo $x\n\0binary"));
        assert!(!is_thompson_shell_payload(b"\x7fELF\0\x02\x01"));
        assert!(!is_thompson_shell_payload(b"PNG\0\n"));
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }
}
