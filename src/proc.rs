//! Process handles, exit statuses, waiting and reaping.

use crate::flog::FLOG;
use crate::threads;
use cfg_if::cfg_if;
use errno::Errno;
use libc::{EXIT_SUCCESS, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WTERMSIG};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// A ProcStatus is a value type that encapsulates logic around exited vs signaled,
/// etc. It contains an i32 status as returned by waitpid().
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ProcStatus(i32);

impl ProcStatus {
    /// Returns the raw `i32` status value.
    pub fn raw(&self) -> i32 {
        self.0
    }

    /// Encode a return value `ret` and signal `sig` into a status value like waitpid() does.
    const fn w_exitcode(ret: i32, sig: i32) -> i32 {
        cfg_if! {
            if #[cfg(waitstatus_signal_ret)] {
                // It's encoded signal and then status
                // The return status is in the lower byte.
                (sig << 8) | ret
            } else {
                // The status is encoded in the upper byte.
                // This should be W_EXITCODE(ret, sig) but that's not available everywhere.
                (ret << 8) | sig
            }
        }
    }

    /// Construct from a status returned from a waitpid call.
    pub fn from_waitpid(status: i32) -> ProcStatus {
        ProcStatus(status)
    }

    /// Construct directly from an exit code.
    pub fn from_exit_code(ret: i32) -> ProcStatus {
        assert!(
            (0..256).contains(&ret),
            "trying to create ProcStatus from an invalid exit code"
        );
        ProcStatus(Self::w_exitcode(ret, 0 /* sig */))
    }

    /// Construct directly from a signal.
    pub fn from_signal(signal: libc::c_int) -> ProcStatus {
        ProcStatus(Self::w_exitcode(0 /* ret */, signal))
    }

    /// The status of a successful run.
    pub fn success() -> ProcStatus {
        Self::from_exit_code(EXIT_SUCCESS)
    }

    /// Return if we exited normally (not a signal).
    pub fn normal_exited(&self) -> bool {
        WIFEXITED(self.0)
    }

    /// Return if we exited because of a signal.
    pub fn signal_exited(&self) -> bool {
        WIFSIGNALED(self.0)
    }

    /// Return the signal code, given that we signal exited.
    pub fn signal_code(&self) -> libc::c_int {
        assert!(self.signal_exited(), "Process is not signal exited");
        WTERMSIG(self.0)
    }

    /// Return the exit code, given that we normal exited.
    pub fn exit_code(&self) -> u8 {
        assert!(self.normal_exited(), "Process is not normal exited");
        (WEXITSTATUS(self.0) & 0xff) as u8
    }

    /// Return if this status represents success.
    pub fn is_success(&self) -> bool {
        self.normal_exited() && i32::from(self.exit_code()) == EXIT_SUCCESS
    }

    /// Return the value a shell would put in `$?`.
    pub fn status_value(&self) -> i32 {
        if self.signal_exited() {
            128 + self.signal_code()
        } else {
            i32::from(self.exit_code())
        }
    }
}

/// Describes why a process failed, e.g. "exited with 1" or "killed by SIGTERM".
impl fmt::Display for ProcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.signal_exited() {
            let sig = self.signal_code();
            match nix::sys::signal::Signal::try_from(sig) {
                Ok(signal) => write!(f, "killed by {}", signal.as_str()),
                Err(_) => write!(f, "killed by signal {}", sig),
            }
        } else if self.normal_exited() {
            write!(f, "exited with {}", self.exit_code())
        } else {
            write!(f, "unknown status {:#x}", self.0)
        }
    }
}

impl fmt::Debug for ProcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcStatus({})", self)
    }
}

/// A type-safe equivalent to [`libc::pid_t`].
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct Pid(NonZeroU32);

impl Pid {
    /// Return None for pids which cannot name a child (zero or negative).
    #[inline(always)]
    pub fn new(pid: libc::pid_t) -> Option<Self> {
        u32::try_from(pid).ok().and_then(NonZeroU32::new).map(Self)
    }
    #[inline(always)]
    pub fn get(&self) -> i32 {
        self.0.get() as i32
    }
    #[inline(always)]
    pub fn as_pid_t(&self) -> libc::pid_t {
        #[allow(clippy::useless_conversion)]
        self.get().into()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.get(), f)
    }
}

/// Block until `pid` exits, retrying on EINTR. Must be called at most once per pid.
pub fn wait_pid(pid: Pid) -> Result<ProcStatus, Errno> {
    loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid.as_pid_t(), &mut status, 0) };
        if ret >= 0 {
            return Ok(ProcStatus::from_waitpid(status));
        }
        let err = errno::errno();
        if err.0 != libc::EINTR {
            return Err(err);
        }
    }
}

/// Hand `pid` to a reaper thread which waits for it and discards its status. If no thread can
/// be started, the pid is polled for instead, see [`reap_pending_pids`].
pub fn reap_in_background(pid: Pid, command_line: String) {
    reap_pending_pids();
    let spawned = threads::spawn(format!("reap {}", pid), move || {
        match wait_pid(pid) {
            Ok(status) => {
                FLOG!(
                    proc_reap_external,
                    "Reaped detached pid",
                    pid,
                    format!("('{}'),", command_line),
                    status
                );
            }
            // Someone else collected it; nothing left to do.
            Err(err) if err.0 == libc::ECHILD => (),
            Err(err) => {
                FLOG!(warning, "waitpid for detached pid", pid, "failed:", err);
            }
        }
    });
    if let Err(err) = spawned {
        FLOG!(warning, "Could not start reaper for pid", pid, ":", err);
        defer_reap(pid);
        reap_pending_pids();
    }
}

/// Detached pids which no reaper thread is waiting for. They are kept until they exit.
static PENDING_REAPS: Mutex<Vec<Pid>> = Mutex::new(Vec::new());

fn pending_reaps() -> MutexGuard<'static, Vec<Pid>> {
    PENDING_REAPS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Add `pid` to the pids reaped by [`reap_pending_pids`].
pub(crate) fn defer_reap(pid: Pid) {
    pending_reaps().push(pid);
}

/// Reap any pending pids which have exited. Called whenever a stage is spawned or detached.
pub fn reap_pending_pids() {
    // waitpid returns 0 iff the pid has not changed state. Anything else, including ECHILD,
    // means there is nothing left to wait for.
    pending_reaps().retain(|pid| {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid.as_pid_t(), &mut status, libc::WNOHANG) };
        if ret > 0 {
            FLOG!(proc_reap_external, "Reaped pending pid", *pid);
        }
        ret == 0
    });
}

/// An OS process spawned from an external command.
pub struct ExternalProc {
    pub pid: Pid,
    pub command_line: String,
}

/// A structure representing a "process" internal to this crate: a callable running on its own
/// thread instead of a separate process.
pub struct InternalProc {
    /// An identifier for internal processes.
    /// This is used for logging purposes only.
    internal_proc_id: u64,

    name: String,

    thread: JoinHandle<ProcStatus>,
}

impl InternalProc {
    pub fn next_id() -> u64 {
        static NEXT_PROC_ID: AtomicU64 = AtomicU64::new(0);
        NEXT_PROC_ID.fetch_add(1, Ordering::SeqCst)
    }

    pub fn new(internal_proc_id: u64, name: String, thread: JoinHandle<ProcStatus>) -> Self {
        InternalProc {
            internal_proc_id,
            name,
            thread,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A handle to something started by [`crate::Shell::spawn`]. Waiting consumes the handle, so
/// each spawn resolves at most one status.
pub enum SpawnHandle {
    External(ExternalProc),
    Internal(InternalProc),
}

impl SpawnHandle {
    /// The process id, for external processes.
    pub fn pid(&self) -> Option<Pid> {
        match self {
            SpawnHandle::External(proc) => Some(proc.pid),
            SpawnHandle::Internal(_) => None,
        }
    }

    /// The command line or callable name, for diagnostics.
    pub fn command_line(&self) -> &str {
        match self {
            SpawnHandle::External(proc) => &proc.command_line,
            SpawnHandle::Internal(proc) => proc.name(),
        }
    }

    /// Block until the spawned unit finishes and return its status.
    pub fn wait(self) -> Result<ProcStatus, Errno> {
        match self {
            SpawnHandle::External(proc) => wait_pid(proc.pid),
            SpawnHandle::Internal(proc) => {
                let status = proc.thread.join().unwrap_or_else(|_| {
                    // Panics are caught inside the task; treat an escaped one as a failure.
                    ProcStatus::from_exit_code(1)
                });
                FLOG!(
                    proc_internal_proc,
                    "Internal proc",
                    proc.internal_proc_id,
                    format!("('{}')", proc.name),
                    "finished:",
                    status
                );
                Ok(status)
            }
        }
    }

    /// Stop tracking the spawned unit. External processes are still reaped in the background;
    /// internal tasks run to completion on their own.
    pub fn detach(self) {
        match self {
            SpawnHandle::External(proc) => reap_in_background(proc.pid, proc.command_line),
            SpawnHandle::Internal(proc) => {
                FLOG!(
                    proc_internal_proc,
                    "Detached internal proc",
                    proc.internal_proc_id,
                    format!("('{}')", proc.name)
                );
                drop(proc.thread);
            }
        }
    }
}

impl fmt::Debug for SpawnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnHandle::External(proc) => write!(f, "External({}, {:?})", proc.pid, proc.command_line),
            SpawnHandle::Internal(proc) => write!(f, "Internal({}, {:?})", proc.internal_proc_id, proc.name),
        }
    }
}
