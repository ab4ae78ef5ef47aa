// The stuff that happens after fork.
// Everything in this module must be async-signal safe.
// That means no locking, no allocating, no freeing memory, etc!
use super::flog_safe::FLOG_SAFE;
use crate::flog::FLOG;
use crate::null_terminated_array::OwningNullTerminatedArray;
use crate::redirection::Dup2List;
use crate::signal::signal_reset_handlers;
use libc::pid_t;
use std::ffi::CStr;
use std::os::fd::RawFd;
use std::time::Duration;

/// The number of times to try to call fork() before giving up.
const FORK_LAPS: usize = 5;

/// The number of nanoseconds to sleep between attempts to call fork().
const FORK_SLEEP_TIME: Duration = Duration::from_nanos(1000000);

/// The highest fd we will visit when marking inherited fds CLOEXEC.
const MAX_CLOSE_OTHERS_FD: RawFd = 65536;

/// Clear FD_CLOEXEC on a file descriptor.
fn clear_cloexec(fd: i32) -> i32 {
    // Note we don't want to overwrite existing flags like O_NONBLOCK which may be set. So fetch the
    // existing flags and modify them.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
    if flags < 0 {
        return -1;
    }
    let new_flags = flags & !libc::FD_CLOEXEC;
    if flags == new_flags {
        return 0;
    } else {
        return unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) };
    }
}

/// Set FD_CLOEXEC on a file descriptor, ignoring fds which are not open.
fn mark_cloexec(fd: i32) {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
    if flags >= 0 && flags & libc::FD_CLOEXEC == 0 {
        unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    }
}

/// Return the exclusive upper bound of fds to visit for close_others.
/// This must be computed before fork, since sysconf is not async-signal safe.
pub fn close_others_limit() -> RawFd {
    let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if open_max <= 0 {
        return MAX_CLOSE_OTHERS_FD;
    }
    RawFd::try_from(open_max)
        .unwrap_or(MAX_CLOSE_OTHERS_FD)
        .min(MAX_CLOSE_OTHERS_FD)
}

/// Set up redirections, the working directory and signal handling in the forked child.
/// If `close_others_below` is set, every fd from 3 up to it which is not a dup2 target is marked
/// CLOEXEC, so only the standard streams and explicit redirections survive exec.
/// Return 0 on success, or the value of errno on failure.
pub fn child_setup_process(
    dup2s: &Dup2List,
    cwd: Option<&CStr>,
    close_others_below: Option<RawFd>,
) -> i32 {
    // Note we are called in a forked child.
    for act in &dup2s.actions {
        let err;
        if act.target < 0 {
            // Closing an fd which is already closed is fine.
            err = unsafe { libc::close(act.src) };
            if err < 0 && errno::errno().0 == libc::EBADF {
                continue;
            }
        } else if act.target != act.src {
            // Normal redirection.
            err = unsafe { libc::dup2(act.src, act.target) };
        } else {
            // This is a weird case like `Command::redirect(IoFile::new(6, file))` where the opened
            // file (which is CLO_EXEC) already sits at its own fd. We need to unset the CLO_EXEC flag.
            err = clear_cloexec(act.src);
        }
        if err < 0 {
            let errno = errno::errno().0;
            FLOG_SAFE!(
                warning,
                "failed to set up file descriptors in child_setup_process, errno ",
                errno
            );
            return errno;
        }
    }
    if let Some(cwd) = cwd {
        if unsafe { libc::chdir(cwd.as_ptr()) } < 0 {
            let errno = errno::errno().0;
            FLOG_SAFE!(warning, "failed to change directory to ", cwd, ", errno ", errno);
            return errno;
        }
    }
    if let Some(limit) = close_others_below {
        for fd in 3..limit {
            if !dup2s.is_target(fd) {
                mark_cloexec(fd);
            }
        }
    }
    // Give the program default dispositions and an empty signal mask.
    signal_reset_handlers();
    0
}

/// Send `err` to the parent over the exec status pipe `fd`. A negative fd means the parent is not
/// listening.
pub fn report_errno_to_parent(fd: RawFd, err: i32) {
    if fd < 0 {
        return;
    }
    let bytes = err.to_ne_bytes();
    // A short or failed write leaves the parent assuming success; nothing else we can do here.
    unsafe {
        let _ = libc::write(fd, bytes.as_ptr().cast(), bytes.len());
    }
}

/// This function is a wrapper around fork. If the fork calls fails with EAGAIN, it is retried
/// FORK_LAPS times, with a very slight delay between each lap.
/// Return the pid (0 in the child), or the errno of the last failure.
pub fn execute_fork() -> Result<pid_t, i32> {
    let mut err = 0;
    for i in 0..FORK_LAPS {
        let pid = unsafe { libc::fork() };
        if pid >= 0 {
            return Ok(pid);
        }
        err = errno::errno().0;
        if err != libc::EAGAIN {
            break;
        }
        // Don't sleep on the final lap
        if i != FORK_LAPS - 1 {
            std::thread::sleep(FORK_SLEEP_TIME);
        }
    }

    match err {
        libc::EAGAIN => {
            FLOG!(
                error,
                "fork: Out of resources. Check RLIMIT_NPROC and pid_max."
            );
        }
        libc::ENOMEM => {
            FLOG!(error, "fork: Out of memory.");
        }
        _ => {
            FLOG!(error, "fork: Unknown error number", err);
        }
    }
    Err(err)
}

pub(crate) fn safe_report_exec_error(
    err: i32,
    actual_cmd: &CStr,
    argvv: &OwningNullTerminatedArray,
    envv: &OwningNullTerminatedArray,
) {
    match err {
        libc::E2BIG => {
            let szenv = envv.iter().map(|s| s.to_bytes().len()).sum::<usize>();
            let sz = szenv + argvv.iter().map(|s| s.to_bytes().len()).sum::<usize>();

            let arg_max = unsafe { libc::sysconf(libc::_SC_ARG_MAX) };
            if arg_max > 0 && sz >= arg_max as usize {
                FLOG_SAFE!(
                    exec,
                    "Failed to execute process '",
                    actual_cmd,
                    "': the total size of the argument list and environment exceeds the OS limit."
                );
            } else {
                FLOG_SAFE!(
                    exec,
                    "Failed to execute process '",
                    actual_cmd,
                    "': An argument or environment variable exceeds the OS argument length limit."
                );
            }
        }

        libc::ENOEXEC => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process: '",
                actual_cmd,
                "' the file could not be run by the operating system."
            );
            let mut interpreter_buf = [b'\0'; 128];
            if get_interpreter(actual_cmd, &mut interpreter_buf).is_none() {
                FLOG_SAFE!(exec, "Maybe the interpreter directive (#! line) is broken?");
            }
        }
        libc::EACCES | libc::ENOENT => {
            let mut interpreter_buf = [b'\0'; 128];
            if let Some(interpreter) = get_interpreter(actual_cmd, &mut interpreter_buf) {
                if unsafe { libc::access(interpreter.as_ptr(), libc::X_OK) } != 0 {
                    // Detect Windows line endings and complain specifically about them.
                    if interpreter.to_bytes().last() == Some(&b'\r') {
                        FLOG_SAFE!(
                            exec,
                            "Failed to execute process '",
                            actual_cmd,
                            "':  The file uses Windows line endings (\\r\\n). Run dos2unix or similar to fix it."
                        );
                    } else {
                        FLOG_SAFE!(
                            exec,
                            "Failed to execute process '",
                            actual_cmd,
                            "': The file specified the interpreter '",
                            interpreter,
                            "', which is not an executable command."
                        );
                    }
                }
            } else if unsafe { libc::access(actual_cmd.as_ptr(), libc::X_OK) } == 0 {
                FLOG_SAFE!(
                    exec,
                    "Failed to execute process '",
                    actual_cmd,
                    "': The file exists and is executable. Check the interpreter or linker?"
                );
            } else if err == libc::ENOENT {
                FLOG_SAFE!(
                    exec,
                    "Failed to execute process '",
                    actual_cmd,
                    "': The file does not exist or could not be executed."
                );
            } else {
                FLOG_SAFE!(
                    exec,
                    "Failed to execute process '",
                    actual_cmd,
                    "': The file could not be accessed."
                );
            }
        }

        libc::ENOMEM => {
            FLOG_SAFE!(exec, "Out of memory");
        }

        libc::ETXTBSY => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': File is currently open for writing.",
            );
        }

        libc::ELOOP => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': Too many layers of symbolic links. Maybe a loop?"
            );
        }

        libc::EISDIR => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': File is a directory."
            );
        }
        libc::ENOTDIR => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': A path component is not a directory."
            );
        }

        libc::EMFILE => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': Too many open files in this process."
            );
        }
        libc::EPERM => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': No permission. \
                Either suid/sgid is forbidden or you lack capabilities."
            );
        }

        #[cfg(apple)]
        libc::EBADARCH => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': Bad CPU type in executable."
            );
        }

        err => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "', unknown error number ",
                err,
            );
        }
    }
}

/// Returns the interpreter for the specified script. Returns None if file is not a script with a
/// shebang.
fn get_interpreter<'a>(command: &CStr, buffer: &'a mut [u8]) -> Option<&'a CStr> {
    // OK to not use CLO_EXEC here because this is only called after fork.
    let fd = unsafe { libc::open(command.as_ptr(), libc::O_RDONLY) };
    let mut idx = 0;
    if fd >= 0 {
        while idx + 1 < buffer.len() {
            let mut ch = b'\0';
            let amt = unsafe {
                libc::read(
                    fd,
                    std::ptr::addr_of_mut!(ch).cast(),
                    std::mem::size_of_val(&ch),
                )
            };
            if amt <= 0 || ch == b'\n' {
                break;
            }
            buffer[idx] = ch;
            idx += 1;
        }
        buffer[idx] = b'\0';
        idx += 1;
        unsafe { libc::close(fd) };
    }

    let offset = if buffer.starts_with(b"#! /") {
        3
    } else if buffer.starts_with(b"#!") {
        2
    } else {
        return None;
    };
    CStr::from_bytes_with_nul(&buffer[offset..idx.max(offset)]).ok()
}
