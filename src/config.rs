//! Run-time configuration read from the environment.
//!
//! - `SHPIPE_DEBUG`: comma-separated flog category patterns to enable, like `exec-*,-exec-fork`.
//! - `SHPIPE_DEBUG_OUTPUT`: a file to write flog output to instead of stderr.
//! - `SHPIPE_USE_POSIX_SPAWN`: set to `0` (or `n`, `f`) to always fork and exec.
//!
//! The environment is read once, when the first [`Shell`](crate::Shell) is created.

use crate::flog::{activate_flog_categories_by_pattern, set_flog_file_fd, FLOG};
use once_cell::sync::OnceCell;
use std::ffi::OsStr;
use std::fs::File;
use std::os::fd::IntoRawFd;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether to use `posix_spawn()` when possible.
static USE_POSIX_SPAWN: AtomicBool = AtomicBool::new(allow_use_posix_spawn());

const fn allow_use_posix_spawn() -> bool {
    // OpenBSD's posix_spawn returns status 127 instead of erroring with ENOEXEC when faced with a
    // shebang-less script. Disable posix_spawn on OpenBSD.
    cfg!(all(use_posix_spawn, not(target_os = "openbsd")))
}

/// Whether external commands may be launched with `posix_spawn()`.
pub fn use_posix_spawn() -> bool {
    USE_POSIX_SPAWN.load(Ordering::Relaxed)
}

/// Enable or disable `posix_spawn()`. It stays disabled where it is not supported.
pub fn set_use_posix_spawn(enabled: bool) {
    USE_POSIX_SPAWN.store(enabled && allow_use_posix_spawn(), Ordering::Relaxed);
}

/// Interpret a yes/no setting: anything starting with y, t or 1 is true.
pub fn bool_from_string(x: &OsStr) -> bool {
    matches!(x.as_bytes().first(), Some(b'Y' | b'T' | b'y' | b't' | b'1'))
}

/// Apply the environment settings. Only the first call has any effect.
pub fn init() {
    static DONE: OnceCell<()> = OnceCell::new();
    DONE.get_or_init(|| {
        if let Some(debug_categories) = std::env::var_os("SHPIPE_DEBUG") {
            activate_flog_categories_by_pattern(&debug_categories.to_string_lossy());
        }

        if let Some(debug_path) = std::env::var_os("SHPIPE_DEBUG_OUTPUT") {
            match File::options()
                .write(true)
                .truncate(true)
                .create(true)
                .open(&debug_path)
            {
                // Rust sets O_CLOEXEC by default, so children don't inherit the log.
                Ok(dbg_file) => set_flog_file_fd(dbg_file.into_raw_fd()),
                Err(e) => FLOG!(
                    warning,
                    "Could not open debug output file",
                    format!("{:?}:", debug_path),
                    e
                ),
            }
        }

        if let Some(var) = std::env::var_os("SHPIPE_USE_POSIX_SPAWN") {
            // An empty value means the default.
            set_use_posix_spawn(var.is_empty() || bool_from_string(&var));
        }
        FLOG!(config, "posix_spawn enabled:", use_posix_spawn());
    });
}
