use libc::c_int;
use std::sync::atomic::{AtomicI32, Ordering};

#[rustfmt::skip::macros(category)]
pub mod categories {
    use std::sync::atomic::AtomicBool;

    pub struct category_t {
        pub name: &'static str,
        pub description: &'static str,
        pub enabled: AtomicBool,
    }

    /// Macro to declare a static variable identified by $var,
    /// with the given name and description, and optionally enabled by default.
    macro_rules! declare_category {
        (
            ($var:ident, $name:literal, $description:literal, $enabled:expr)
        ) => {
            pub static $var: category_t = category_t {
                name: $name,
                description: $description,
                enabled: AtomicBool::new($enabled),
            };
        };
        (
            ($var:ident, $name:expr, $description:expr)
        ) => {
            declare_category!(($var, $name, $description, false));
        };
    }

    /// Macro to extract the variable name for a category.
    macro_rules! category_name {
        (($var:ident, $name:literal, $description:literal, $enabled:expr)) => {
            $var
        };
        (($var:ident, $name:literal, $description:literal)) => {
            $var
        };
    }

    macro_rules! categories {
        (
            // A repetition of categories, separated by semicolons.
            $($cats:tt);*

            // Allow trailing semicolon.
            $(;)?
        ) => {
            // Declare each category.
            $(
                declare_category!($cats);
            )*

            // Define a function which gives you a Vector of all categories.
            pub fn all_categories() -> Vec<&'static category_t> {
                vec![
                    $(
                        & category_name!($cats),
                    )*
                ]
            }
        };
    }

    categories!(
        (error, "error", "Serious unexpected errors (on by default)", true);

        (warning, "warning", "Warnings (on by default)", true);

        (config, "config", "Reading configuration from the environment");

        (exec, "exec", "Errors reported by exec (on by default)", true);

        (exec_fork, "exec-fork", "Calls to fork() and posix_spawn()");

        (exec_pipeline, "exec-pipeline", "Pipeline construction");

        (command_error, "command-error", "Commands failing under the error policy");

        (redirect, "redirect", "Redirection scopes being entered and left");

        (env, "env", "Environment and working directory scopes");

        (proc_internal_proc, "proc-internal-proc", "In-process tasks starting and finishing");

        (proc_reap_external, "proc-reap-external", "Reaping external (forked) processes");

        (iothread, "iothread", "Background thread events");
    );
}

/// FLOG formats values. By default we would like to use Display, and fall back to Debug.
/// However that would require specialization. So instead we make two "separate" traits, bring them both in scope,
/// and let Rust figure it out.
/// Clients can opt a Debug type into Floggable by implementing FloggableDebug:
///    impl FloggableDebug for MyType {}
pub trait FloggableDisplay {
    /// Return a string representation of this thing.
    fn to_flog_str(&self) -> String;
}

impl<T: std::fmt::Display> FloggableDisplay for T {
    fn to_flog_str(&self) -> String {
        self.to_string()
    }
}

pub trait FloggableDebug: std::fmt::Debug {
    fn to_flog_str(&self) -> String {
        format!("{:?}", self)
    }
}

/// Write to our FLOG file.
pub fn flog_impl(s: &str) {
    let fd = get_flog_file_fd();
    if fd < 0 {
        return;
    }
    let _ = write_to_fd(s.as_bytes(), fd);
}

/// Write all of `input` to `fd`, retrying on EINTR and short writes.
pub fn write_to_fd(input: &[u8], fd: c_int) -> nix::Result<usize> {
    let mut written = 0;
    while written < input.len() {
        let remaining = &input[written..];
        let amt = unsafe {
            libc::write(
                fd,
                remaining.as_ptr() as *const libc::c_void,
                remaining.len(),
            )
        };
        if amt < 0 {
            let err = nix::Error::last();
            if err == nix::Error::EINTR {
                continue;
            }
            return Err(err);
        }
        written += amt as usize;
    }
    Ok(written)
}

/// The entry point for flogging.
#[macro_export]
macro_rules! FLOG {
    ($category:ident, $($elem:expr),+ $(,)*) => {
        if $crate::flog::categories::$category.enabled.load(std::sync::atomic::Ordering::Relaxed) {
            #[allow(unused_imports)]
            use $crate::flog::{FloggableDisplay, FloggableDebug};
            let mut vs = vec![format!("{}:", $crate::flog::categories::$category.name)];
            $(
                {
                   vs.push($elem.to_flog_str())
                }
            )+
            // We don't use locking here so we have to append our own newline to avoid multiple writes.
            let mut v = vs.join(" ");
            v.push('\n');
            $crate::flog::flog_impl(&v);
        }
    };
}

#[macro_export]
macro_rules! should_flog {
    ($category:ident) => {
        $crate::flog::categories::$category
            .enabled
            .load(std::sync::atomic::Ordering::Relaxed)
    };
}

pub use {should_flog, FLOG};

/// Match a category name against a pattern where `*` matches any run of characters and `?`
/// matches one character.
fn wildcard_match(name: &str, pattern: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut n, mut p) = (0, 0);
    // Position of the last star in the pattern, and the name position it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            n += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, n));
            p += 1;
        } else if let Some((star, tried)) = backtrack {
            p = star + 1;
            n = tried + 1;
            backtrack = Some((star, n));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// For each category, if its name matches the wildcard, set its enabled to the given sense.
/// Return whether any category matched.
fn apply_one_wildcard(wc: &str, sense: bool) -> bool {
    let mut match_found = false;
    for cat in categories::all_categories() {
        if wildcard_match(cat.name, wc) {
            cat.enabled.store(sense, Ordering::Relaxed);
            match_found = true;
        }
    }
    if !match_found {
        FLOG!(warning, "Failed to match debug category:", wc);
    }
    match_found
}

/// Set the active flog categories according to the given comma-separated wildcards.
/// A leading `-` disables the matching categories instead.
pub fn activate_flog_categories_by_pattern(wc: &str) {
    // Normalize underscores to dashes, allowing the user to be sloppy.
    let wc = wc.replace('_', "-");
    for s in wc.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Some(negated) = s.strip_prefix('-') {
            apply_one_wildcard(negated, false);
        } else {
            apply_one_wildcard(s, true);
        }
    }
}

/// The flog output fd. Defaults to stderr. A value < 0 disables flog.
static FLOG_FD: AtomicI32 = AtomicI32::new(libc::STDERR_FILENO);

pub fn set_flog_file_fd(fd: c_int) {
    FLOG_FD.store(fd, Ordering::Relaxed);
}

#[inline]
pub fn get_flog_file_fd() -> c_int {
    FLOG_FD.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::{activate_flog_categories_by_pattern, categories, wildcard_match};
    use crate::tests::prelude::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("exec-fork", "exec-fork"));
        assert!(wildcard_match("exec-fork", "exec-*"));
        assert!(wildcard_match("exec-fork", "*fork"));
        assert!(wildcard_match("exec-fork", "e?ec-*k"));
        assert!(wildcard_match("exec", "exec*"));
        assert!(!wildcard_match("exec", "exec-*"));
        assert!(!wildcard_match("proc-reap-external", "exec*"));
        assert!(wildcard_match("anything", "*"));
    }

    #[test]
    #[serial]
    fn test_activate_by_pattern() {
        let _cleanup = test_init();
        let enabled = |cat: &categories::category_t| cat.enabled.load(Ordering::Relaxed);
        activate_flog_categories_by_pattern("exec_*,-exec-fork");
        assert!(enabled(&categories::exec_pipeline));
        assert!(!enabled(&categories::exec_fork));
        activate_flog_categories_by_pattern("-exec-pipeline");
        assert!(!enabled(&categories::exec_pipeline));
        assert!(enabled(&categories::exec));
    }
}
