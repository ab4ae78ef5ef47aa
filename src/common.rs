//! Small helpers shared across the crate.

use std::ffi::OsStr;
use std::ops::{Deref, DerefMut};
use std::os::unix::ffi::OsStrExt;

/// Exits without invoking destructors (via _exit), useful for code after fork.
pub fn exit_without_destructors(code: libc::c_int) -> ! {
    unsafe { libc::_exit(code) };
}

/// A RAII cleanup object. We can't just provide a callback that modifies live objects, because
/// then there would be two &mut references to the same object: the variable we keep using and
/// the reference captured by the closure.
///
/// Instead `ScopeGuard` takes exclusive ownership of (a reference to) the managed object, and
/// hands it back out through [`Deref`] and [`DerefMut`].
///
/// ```rust
/// use shpipe::common::ScopeGuard;
///
/// let mut log = Vec::new();
/// {
///     let mut log = ScopeGuard::new(&mut log, |log| log.push("goodbye"));
///     log.push("hello");
/// }
/// assert_eq!(log, ["hello", "goodbye"]);
/// ```
pub struct ScopeGuard<T, F: FnOnce(&mut T)>(Option<(T, F)>);

impl<T, F: FnOnce(&mut T)> ScopeGuard<T, F> {
    /// Creates a new `ScopeGuard` wrapping `value`. The `on_drop` callback is executed when the
    /// ScopeGuard's lifetime expires or when it is manually dropped.
    pub fn new(value: T, on_drop: F) -> Self {
        Self(Some((value, on_drop)))
    }

    /// Invokes the callback and returns the wrapped value, consuming the ScopeGuard.
    pub fn commit(mut guard: Self) -> T {
        let (mut value, on_drop) = guard.0.take().expect("Should always have Some value");
        on_drop(&mut value);
        value
    }

    /// Cancels the invocation of the callback, returning the original wrapped value.
    pub fn cancel(mut guard: Self) -> T {
        let (value, _) = guard.0.take().expect("Should always have Some value");
        value
    }
}

impl<T, F: FnOnce(&mut T)> Deref for ScopeGuard<T, F> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0.as_ref().unwrap().0
    }
}

impl<T, F: FnOnce(&mut T)> DerefMut for ScopeGuard<T, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0.as_mut().unwrap().0
    }
}

impl<T, F: FnOnce(&mut T)> Drop for ScopeGuard<T, F> {
    fn drop(&mut self) {
        if let Some((mut value, on_drop)) = self.0.take() {
            on_drop(&mut value);
        }
    }
}

/// A trait expressing what ScopeGuard can do. This is necessary because the scoped_* functions
/// return an `impl Trait` object and therefore methods on ScopeGuard which take a self parameter
/// cannot be used.
pub trait ScopeGuarding: DerefMut {
    /// Invokes the callback and returns the wrapped value, consuming the ScopeGuard.
    fn commit(guard: Self) -> Self::Target;
}

impl<T, F: FnOnce(&mut T)> ScopeGuarding for ScopeGuard<T, F> {
    fn commit(guard: Self) -> T {
        ScopeGuard::commit(guard)
    }
}

/// Similar to a save-and-restore of a variable, but takes a function like `Cell::replace`
/// instead of a function that returns a mutable reference. The replacer is called with the new
/// value now, and with the saved value when the guard is dropped.
pub fn scoped_push_replacer<Replacer, T>(
    replacer: Replacer,
    new_value: T,
) -> impl ScopeGuarding<Target = ()>
where
    Replacer: Fn(T) -> T,
{
    let saved = replacer(new_value);
    let restore_saved = move |_ctx: &mut ()| {
        replacer(saved);
    };
    ScopeGuard::new((), restore_saved)
}

pub const fn assert_send<T: Send>() {}
pub const fn assert_sync<T: Sync>() {}

/// Quote an argument for display in a command line, the way a POSIX shell would need it.
/// Arguments made only of "safe" characters are returned unchanged.
pub fn escape_arg(arg: &OsStr) -> String {
    let bytes = arg.as_bytes();
    let is_safe = |c: &u8| c.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(c);
    if !bytes.is_empty() && bytes.iter().all(is_safe) {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('\'');
    for chunk in String::from_utf8_lossy(bytes).split('\'').enumerate() {
        if chunk.0 > 0 {
            out.push_str("'\\''");
        }
        out.push_str(chunk.1);
    }
    out.push('\'');
    out
}

/// Join an argument vector into a single displayable command line.
pub fn join_command_line<S: AsRef<OsStr>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| escape_arg(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::{escape_arg, join_command_line, scoped_push_replacer, ScopeGuard};
    use std::cell::Cell;
    use std::ffi::OsStr;

    #[test]
    fn test_scope_guard_runs_on_drop() {
        let hit = Cell::new(false);
        {
            let _guard = ScopeGuard::new((), |()| hit.set(true));
            assert!(!hit.get());
        }
        assert!(hit.get());
    }

    #[test]
    fn test_scope_guard_cancel() {
        let hit = Cell::new(false);
        let guard = ScopeGuard::new(5, |_| hit.set(true));
        assert_eq!(ScopeGuard::cancel(guard), 5);
        assert!(!hit.get());
    }

    #[test]
    fn test_scoped_push_replacer() {
        let value = Cell::new(1);
        {
            let _saved = scoped_push_replacer(|v| value.replace(v), 2);
            assert_eq!(value.get(), 2);
        }
        assert_eq!(value.get(), 1);
    }

    #[test]
    fn test_escape_arg() {
        assert_eq!(escape_arg(OsStr::new("tr")), "tr");
        assert_eq!(escape_arg(OsStr::new("a b")), "'a b'");
        assert_eq!(escape_arg(OsStr::new("")), "''");
        assert_eq!(escape_arg(OsStr::new("it's")), "'it'\\''s'");
        assert_eq!(join_command_line(&["echo", "-n", "a b"]), "echo -n 'a b'");
    }
}
