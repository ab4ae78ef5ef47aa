//! Signal dispositions handed to spawned children.

use once_cell::sync::Lazy;
use std::mem::MaybeUninit;

/// Signals whose disposition a child gets reset to the default.
/// The Rust runtime ignores SIGPIPE, and ignored dispositions survive exec.
const SIGNALS_TO_RESET: &[libc::c_int] = &[
    libc::SIGPIPE,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGCHLD,
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
];

/// The set of signals which a posix_spawned child should reset to default.
pub static signals_to_default: Lazy<libc::sigset_t> = Lazy::new(|| {
    let mut set = MaybeUninit::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        for &sig in SIGNALS_TO_RESET {
            libc::sigaddset(set.as_mut_ptr(), sig);
        }
        set.assume_init()
    }
});

/// An empty signal set, for resetting a child's signal mask.
pub fn empty_sigset() -> libc::sigset_t {
    let mut set = MaybeUninit::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

/// Reset the handlers of SIGNALS_TO_RESET to their defaults, and unblock every signal.
/// This is called after fork, so it must be async-signal safe.
pub fn signal_reset_handlers() {
    let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe { libc::sigemptyset(&mut act.sa_mask) };
    act.sa_flags = 0;
    act.sa_sigaction = libc::SIG_DFL;

    for &sig in SIGNALS_TO_RESET {
        unsafe {
            libc::sigaction(sig, &act, std::ptr::null_mut());
        };
    }

    let mask = empty_sigset();
    unsafe { libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut()) };
}
