//! Shell-style pipelines of external programs and in-process callables.
//!
//! A [`Shell`] carries the redirections and the [`ErrorPolicy`] that commands run under.
//! Stages are either external programs ([`Command`]) or Rust closures ([`Callable`]), and can
//! be connected with pipes:
//!
//! ```rust
//! use shpipe::{cmd, Shell};
//!
//! let sh = Shell::new();
//! let (out, ok) = sh.out_s(|sh| {
//!     sh.pipe([cmd!("echo", "-n", "abc").into(), cmd!("tr", "ab", "AB").into()])
//! })?;
//! assert_eq!(out, "ABc");
//! assert!(ok);
//! # Ok::<(), shpipe::Error>(())
//! ```

#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(unknown_lints)]
#![allow(clippy::bool_assert_comparison)]
#![allow(clippy::collapsible_if)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::doc_lazy_continuation)]
#![allow(clippy::incompatible_msrv)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::uninlined_format_args)]

#[macro_use]
pub mod common;

pub mod capture;
pub mod command;
pub mod config;
pub mod env;
pub mod error;
pub mod exec;
pub mod fds;
pub mod flog;
pub mod fork_exec;
pub mod io;
pub mod null_terminated_array;
pub mod path;
pub mod pipeline;
pub mod policy;
pub mod proc;
pub mod redirection;
pub mod shell;
pub mod signal;
pub mod tempfile;
pub mod threads;

pub use capture::{Popen, PopenStreams};
pub use command::{Callable, Command, Stage, TaskResult};
pub use config::set_use_posix_spawn;
pub use error::{CommandError, Error, Result};
pub use exec::SpawnOptions;
pub use io::{InputStream, IoStreams, OutputStream};
pub use policy::ErrorPolicy;
pub use proc::{ProcStatus, SpawnHandle};
pub use shell::Shell;

#[cfg(test)]
mod tests;
