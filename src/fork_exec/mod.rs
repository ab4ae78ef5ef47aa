// A module concerned with the exec side of fork/exec.
// This concerns posix_spawn support, and async-signal
// safe code which happens in between fork and exec.

pub mod flog_safe;
pub mod postfork;
#[cfg(use_posix_spawn)]
pub mod spawn;

// Bravely define _PATH_BSHELL. On practice it's /bin/sh everywhere, except on Android.
#[cfg(not(target_os = "android"))]
pub static PATH_BSHELL: &[u8] = b"/bin/sh\0";

#[cfg(target_os = "android")]
pub static PATH_BSHELL: &[u8] = b"/system/bin/sh\0";

/// Exit status of a child whose program could not be found.
pub const STATUS_CMD_UNKNOWN: i32 = 127;

/// Exit status of a child whose program was found but could not be executed.
pub const STATUS_NOT_EXECUTABLE: i32 = 126;

/// Return the exit status a child uses to report a failed exec with errno `err`.
pub fn exit_code_for_exec_error(err: i32) -> i32 {
    if err == libc::ENOENT {
        STATUS_CMD_UNKNOWN
    } else {
        STATUS_NOT_EXECUTABLE
    }
}
