//! Environment variables and the working directory, as seen by one context.
//!
//! Changes made with [`Shell::with_env`] and [`Shell::with_cwd`] are recorded in the context,
//! never applied to the process. Programs started from the context get them through the
//! environment and working directory they are launched with; callables read them through
//! [`Shell::var`] and [`Shell::current_dir`]. A callable stage works on its own copy, so
//! nothing it changes is seen by its caller or by other stages.

use crate::error::Result;
use crate::null_terminated_array::OwningNullTerminatedArray;
use crate::path::apply_working_directory;
use crate::shell::Shell;
use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Variable changes and a working directory, layered over those of the process.
#[derive(Clone, Debug, Default)]
pub struct EnvStack {
    /// Changes in the order they were made; `None` removes the variable.
    changes: Vec<(OsString, Option<OsString>)>,
    /// The working directory, if one was set. Always absolute.
    pwd: Option<PathBuf>,
}

impl EnvStack {
    pub fn new() -> Self {
        Default::default()
    }

    /// The value of `name`: the latest change to it, or else the process environment.
    pub fn get(&self, name: &OsStr) -> Option<OsString> {
        match self.changes.iter().rev().find(|(key, _)| key == name) {
            Some((_, value)) => value.clone(),
            None => std::env::var_os(name),
        }
    }

    /// Every variable a program started from here would see.
    pub fn vars(&self) -> BTreeMap<OsString, OsString> {
        let mut vars: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
        for (name, value) in &self.changes {
            match value {
                Some(value) => vars.insert(name.clone(), value.clone()),
                None => vars.remove(name),
            };
        }
        if let Some(pwd) = &self.pwd {
            vars.insert(OsString::from("PWD"), pwd.clone().into_os_string());
        }
        vars
    }

    /// Return a newly allocated export array, as `KEY=VALUE` strings for exec.
    pub fn export_array(&self) -> OwningNullTerminatedArray {
        let export_list = self
            .vars()
            .into_iter()
            .filter_map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry).ok()
            })
            .collect();
        OwningNullTerminatedArray::new(export_list)
    }

    /// The working directory set for this context, if any.
    pub fn pwd(&self) -> Option<&Path> {
        self.pwd.as_deref()
    }

    /// Resolve `path` against the working directory of this context.
    pub fn apply_working_directory(&self, path: &Path) -> PathBuf {
        apply_working_directory(path, self.pwd())
    }

    pub(crate) fn push_changes(&mut self, changes: Vec<(OsString, Option<OsString>)>) -> usize {
        let depth = self.changes.len();
        self.changes.extend(changes);
        depth
    }

    pub(crate) fn truncate_changes(&mut self, depth: usize) {
        self.changes.truncate(depth);
    }

    pub(crate) fn replace_pwd(&mut self, pwd: Option<PathBuf>) -> Option<PathBuf> {
        std::mem::replace(&mut self.pwd, pwd)
    }
}

/// Names must be non-empty and free of `=` and NUL; values must be free of NUL.
fn check_var(name: &OsStr, value: Option<&OsStr>) -> io::Result<()> {
    let name_ok = !name.is_empty() && !name.as_bytes().iter().any(|&c| c == b'=' || c == 0);
    let value_ok = value.map_or(true, |v| !v.as_bytes().contains(&0));
    if name_ok && value_ok {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid environment variable {:?}", name),
        ))
    }
}

impl Shell {
    /// Run `f` with environment variables changed: `Some(value)` sets a variable, `None`
    /// removes it. The changes last until `f` returns, fails or panics.
    ///
    /// Nothing is changed if any name or value is invalid.
    pub fn with_env<K, V, R>(
        &self,
        changes: impl IntoIterator<Item = (K, Option<V>)>,
        f: impl FnOnce(&Shell) -> Result<R>,
    ) -> Result<R>
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let mut checked = Vec::new();
        for (name, value) in changes {
            let name = name.as_ref();
            let value = value.as_ref().map(|v| v.as_ref());
            check_var(name, value)?;
            checked.push((name.to_owned(), value.map(OsStr::to_owned)));
        }
        let _pop = self.push_env(checked);
        f(self)
    }

    /// Run `f` with `dir` as the working directory. A relative `dir` is taken relative to the
    /// current one. Fails if `dir` is not a directory.
    pub fn with_cwd<R>(&self, dir: impl AsRef<Path>, f: impl FnOnce(&Shell) -> Result<R>) -> Result<R> {
        let dir = self.resolve_path(dir.as_ref()).canonicalize()?;
        if !dir.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR).into());
        }
        let _restore = self.push_cwd(dir);
        f(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{check_var, EnvStack};
    use std::ffi::{OsStr, OsString};
    use std::path::{Path, PathBuf};

    #[test]
    fn test_check_var() {
        assert!(check_var(OsStr::new("SHPIPE_X"), Some(OsStr::new("1"))).is_ok());
        assert!(check_var(OsStr::new("SHPIPE_X"), None).is_ok());
        assert!(check_var(OsStr::new(""), None).is_err());
        assert!(check_var(OsStr::new("A=B"), None).is_err());
        assert!(check_var(OsStr::new("A"), Some(OsStr::new("x\0y"))).is_err());
    }

    #[test]
    fn test_later_changes_win() {
        let mut env = EnvStack::new();
        let name = OsStr::new("SHPIPE_TEST_LAYERED");
        let depth = env.push_changes(vec![(name.to_owned(), Some(OsString::from("one")))]);
        env.push_changes(vec![(name.to_owned(), Some(OsString::from("two")))]);
        assert_eq!(env.get(name), Some(OsString::from("two")));
        assert_eq!(env.vars().get(name), Some(&OsString::from("two")));

        env.push_changes(vec![(name.to_owned(), None)]);
        assert_eq!(env.get(name), None);
        assert!(!env.vars().contains_key(name));

        env.truncate_changes(depth);
        assert_eq!(env.get(name), None);
    }

    #[test]
    fn test_export_array_carries_pwd() {
        let mut env = EnvStack::new();
        env.replace_pwd(Some(PathBuf::from("/shpipe/work")));
        env.push_changes(vec![(OsString::from("SHPIPE_TEST_EXPORT"), Some(OsString::from("a b")))]);
        let exported: Vec<_> = env.export_array().iter().map(|s| s.to_bytes().to_vec()).collect();
        assert!(exported.contains(&b"PWD=/shpipe/work".to_vec()));
        assert!(exported.contains(&b"SHPIPE_TEST_EXPORT=a b".to_vec()));
        assert!(exported.iter().all(|entry| entry.contains(&b'=')));
        assert_eq!(env.apply_working_directory(Path::new("x")), Path::new("/shpipe/work/x"));
    }
}
