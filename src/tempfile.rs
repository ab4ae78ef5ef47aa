//! Unlinked temporary files, used to buffer captured output and fed input.

use crate::flog::FLOG;
use rand::distr::{Alphanumeric, SampleString};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

/// Length of the random part of a temporary file name.
const SUFFIX_LEN: usize = 10;

fn random_temp_path() -> PathBuf {
    let suffix = Alphanumeric.sample_string(&mut rand::rng(), SUFFIX_LEN);
    std::env::temp_dir().join(format!("shpipe_buf_{}", suffix))
}

/// Create a read/write temporary file and unlink it immediately.
/// The file lives until the last descriptor referring to it is closed, and no name is left
/// behind even if the process dies.
pub fn new_unlinked() -> io::Result<File> {
    let (path, file) = loop {
        let path = random_temp_path();
        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path);
        match opened {
            Ok(file) => break (path, file),
            // Someone got there first; pick another name.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    };
    if let Err(err) = std::fs::remove_file(&path) {
        FLOG!(warning, "Could not unlink temporary file", path.display(), ":", err);
    }
    Ok(file)
}
