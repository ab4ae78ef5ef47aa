//! Locating programs on $PATH, and resolving paths against a working directory.

use crate::flog::FLOG;
use errno::Errno;
use nix::unistd::{access, AccessFlags};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// The search path used when $PATH is unset.
const DEFAULT_PATH: &str = "/usr/bin:/bin";

/// Make a relative `path` relative to `working_directory`. Absolute paths, and any path when
/// there is no working directory, are returned unchanged.
pub fn apply_working_directory(path: &Path, working_directory: Option<&Path>) -> PathBuf {
    match working_directory {
        Some(wd) if path.is_relative() => {
            // Remove up to one "./".
            let path = path.strip_prefix(".").unwrap_or(path);
            wd.join(path)
        }
        _ => path.to_owned(),
    }
}

/// Return whether `path` is a regular file we may execute.
fn is_executable_file(path: &Path) -> Result<(), Errno> {
    match std::fs::metadata(path) {
        Ok(md) if md.is_dir() => Err(Errno(libc::EACCES)),
        Ok(_) => access(path, AccessFlags::X_OK).map_err(|err| Errno(err as i32)),
        Err(err) => Err(Errno(err.raw_os_error().unwrap_or(libc::ENOENT))),
    }
}

/// Find the file to execute for `program`, searching `search_path` if the name has no slash.
/// Relative names and search path entries are taken relative to `working_directory`.
/// Returns ENOENT if nothing was found, or EACCES if only non-executable candidates were found.
pub fn resolve_program_in(
    program: &OsStr,
    search_path: &OsStr,
    working_directory: Option<&Path>,
) -> Result<PathBuf, Errno> {
    if program.is_empty() {
        return Err(Errno(libc::ENOENT));
    }
    if program.as_bytes().contains(&b'/') {
        // Explicit paths are not searched. Let exec decide about permissions and interpreters.
        let path = apply_working_directory(Path::new(program), working_directory);
        return match std::fs::metadata(&path) {
            Ok(_) => Ok(path),
            Err(err) => Err(Errno(err.raw_os_error().unwrap_or(libc::ENOENT))),
        };
    }

    let mut err = Errno(libc::ENOENT);
    for dir in std::env::split_paths(search_path) {
        // An empty component means the current directory.
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir
        };
        let candidate = apply_working_directory(&dir, working_directory).join(program);
        match is_executable_file(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.0 == libc::EACCES => err = e,
            Err(_) => (),
        }
    }
    Err(err)
}

/// Find the file to execute for `program` using `search_path`, the value of $PATH in the
/// context it is spawned from.
pub fn resolve_program(
    program: &OsStr,
    search_path: Option<&OsStr>,
    working_directory: Option<&Path>,
) -> Result<PathBuf, Errno> {
    let search_path = search_path.unwrap_or(OsStr::new(DEFAULT_PATH));
    let result = resolve_program_in(program, search_path, working_directory);
    if let Err(err) = &result {
        FLOG!(
            exec,
            "Unknown command",
            format!("'{}':", program.to_string_lossy()),
            err
        );
    }
    result
}
