//! The execution context: redirections, environment and error policy in effect for one thread
//! of control.

use crate::command::{Callable, Command, Stage};
use crate::common::{scoped_push_replacer, ScopeGuard, ScopeGuarding};
use crate::config;
use crate::env::EnvStack;
use crate::error::{Error, Result};
use crate::exec::{self, SpawnOptions};
use crate::flog::FLOG;
use crate::io::{IoChain, IoClose, IoDataRef, IoFd, IoFile, IoStreams};
use crate::policy::{apply_policy, ErrorPolicy};
use crate::proc::{ProcStatus, SpawnHandle};
use crate::redirection::RedirectionStack;
use libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use std::cell::{Cell, Ref, RefCell};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::os::fd::{AsFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The state commands run under: a stack of fd redirections, environment changes, a working
/// directory and an error policy.
///
/// A `Shell` belongs to one thread. Work started on another thread (a callable stage) gets its
/// own copy, taken with [`Shell::snapshot`] when it is spawned, so changes made there are never
/// seen by the caller.
pub struct Shell {
    redirections: RefCell<RedirectionStack>,
    env: RefCell<EnvStack>,
    policy: Cell<ErrorPolicy>,
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}

impl Shell {
    /// A context with no redirections and the [`Ignore`](ErrorPolicy::Ignore) policy.
    pub fn new() -> Self {
        Self::with_policy(ErrorPolicy::default())
    }

    pub fn with_policy(policy: ErrorPolicy) -> Self {
        config::init();
        Shell {
            redirections: RefCell::new(RedirectionStack::new()),
            env: RefCell::new(EnvStack::new()),
            policy: Cell::new(policy),
        }
    }

    /// A context for a task, starting from an already materialized chain and the environment
    /// and policy of `parent`.
    pub(crate) fn for_task(redirections: IoChain, parent: &Shell) -> Self {
        Shell {
            redirections: RefCell::new(RedirectionStack::from(redirections)),
            env: RefCell::new(parent.env.borrow().clone()),
            policy: Cell::new(parent.policy.get()),
        }
    }

    /// Copy the current redirections, environment and policy into an independent context.
    pub fn snapshot(&self) -> Shell {
        Shell {
            redirections: RefCell::new(self.redirections.borrow().clone()),
            env: RefCell::new(self.env.borrow().clone()),
            policy: Cell::new(self.policy.get()),
        }
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.policy.get()
    }

    /// The number of redirections currently pushed.
    pub fn redirection_depth(&self) -> usize {
        self.redirections.borrow().len()
    }

    /// The redirections to hand to a spawn.
    pub fn materialize(&self) -> IoChain {
        self.redirections.borrow().materialize()
    }

    pub(crate) fn env(&self) -> Ref<'_, EnvStack> {
        self.env.borrow()
    }

    /// The value of environment variable `name` in this context.
    pub fn var(&self, name: impl AsRef<OsStr>) -> Option<OsString> {
        self.env.borrow().get(name.as_ref())
    }

    /// All environment variables of this context, as a program started from it would see them.
    pub fn vars(&self) -> BTreeMap<OsString, OsString> {
        self.env.borrow().vars()
    }

    /// The working directory of this context.
    pub fn current_dir(&self) -> Result<PathBuf> {
        match self.env.borrow().pwd() {
            Some(pwd) => Ok(pwd.to_owned()),
            None => Ok(std::env::current_dir()?),
        }
    }

    /// Resolve a relative `path` against the working directory of this context.
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.env.borrow().apply_working_directory(path.as_ref())
    }

    /// Apply environment changes, which are undone when the returned guard is dropped.
    pub(crate) fn push_env(
        &self,
        changes: Vec<(OsString, Option<OsString>)>,
    ) -> impl ScopeGuarding<Target = ()> + '_ {
        FLOG!(env, "push", format!("{:?}", changes));
        let depth = self.env.borrow_mut().push_changes(changes);
        ScopeGuard::new((), move |()| {
            self.env.borrow_mut().truncate_changes(depth);
        })
    }

    /// Set the working directory, which is put back when the returned guard is dropped.
    pub(crate) fn push_cwd(&self, dir: PathBuf) -> impl ScopeGuarding<Target = ()> + '_ {
        FLOG!(env, "cwd", dir.display());
        scoped_push_replacer(|pwd| self.env.borrow_mut().replace_pwd(pwd), Some(dir))
    }

    /// The fd that stdout currently refers to, or None if it is closed.
    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.materialize().resolve_fd(STDOUT_FILENO)
    }

    /// The fd that stderr currently refers to, or None if it is closed.
    pub fn stderr_fd(&self) -> Option<RawFd> {
        self.materialize().resolve_fd(STDERR_FILENO)
    }

    /// Push a redirection, which is popped when the returned guard is dropped.
    /// Guards must be dropped in the reverse order they were created.
    pub fn push_redirection(&self, io: IoDataRef) -> impl ScopeGuarding<Target = ()> + '_ {
        FLOG!(redirect, "push", format!("{:?}", io));
        let depth = {
            let mut stack = self.redirections.borrow_mut();
            stack.push(io);
            stack.len()
        };
        ScopeGuard::new((), move |()| {
            let mut stack = self.redirections.borrow_mut();
            debug_assert_eq!(stack.len(), depth, "Redirection scopes must nest");
            if let Some(io) = stack.pop() {
                FLOG!(redirect, "pop", format!("{:?}", io));
            }
        })
    }

    /// Run `f` with `io` pushed. It is popped on every exit path, including unwinding.
    pub fn with_redirect<R>(&self, io: IoDataRef, f: impl FnOnce(&Shell) -> R) -> R {
        let _pop = self.push_redirection(io);
        f(self)
    }

    /// Run `f` with `fd` redirected to a duplicate of `source`.
    fn with_redirect_fd_to<R>(
        &self,
        fd: RawFd,
        source: impl AsFd,
        f: impl FnOnce(&Shell) -> Result<R>,
    ) -> Result<R> {
        let io = IoFile::dup_of(fd, source)?;
        self.with_redirect(Arc::new(io), f)
    }

    pub fn with_redirect_stdin_to<R>(
        &self,
        source: impl AsFd,
        f: impl FnOnce(&Shell) -> Result<R>,
    ) -> Result<R> {
        self.with_redirect_fd_to(STDIN_FILENO, source, f)
    }

    pub fn with_redirect_stdout_to<R>(
        &self,
        target: impl AsFd,
        f: impl FnOnce(&Shell) -> Result<R>,
    ) -> Result<R> {
        self.with_redirect_fd_to(STDOUT_FILENO, target, f)
    }

    pub fn with_redirect_stderr_to<R>(
        &self,
        target: impl AsFd,
        f: impl FnOnce(&Shell) -> Result<R>,
    ) -> Result<R> {
        self.with_redirect_fd_to(STDERR_FILENO, target, f)
    }

    pub fn with_redirect_stdin_to_file<R>(
        &self,
        path: impl AsRef<Path>,
        f: impl FnOnce(&Shell) -> Result<R>,
    ) -> Result<R> {
        let file = File::open(self.resolve_path(path))?;
        self.with_redirect_fd_to(STDIN_FILENO, file, f)
    }

    /// Run `f` with stdout going to `path`, which is created or truncated.
    pub fn with_redirect_stdout_to_file<R>(
        &self,
        path: impl AsRef<Path>,
        f: impl FnOnce(&Shell) -> Result<R>,
    ) -> Result<R> {
        let file = File::create(self.resolve_path(path))?;
        self.with_redirect_fd_to(STDOUT_FILENO, file, f)
    }

    /// Run `f` with stdout appended to `path`, which is created if missing.
    pub fn with_redirect_stdout_to_file_append<R>(
        &self,
        path: impl AsRef<Path>,
        f: impl FnOnce(&Shell) -> Result<R>,
    ) -> Result<R> {
        let file = File::options()
            .append(true)
            .create(true)
            .open(self.resolve_path(path))?;
        self.with_redirect_fd_to(STDOUT_FILENO, file, f)
    }

    pub fn with_redirect_stderr_to_file<R>(
        &self,
        path: impl AsRef<Path>,
        f: impl FnOnce(&Shell) -> Result<R>,
    ) -> Result<R> {
        let file = File::create(self.resolve_path(path))?;
        self.with_redirect_fd_to(STDERR_FILENO, file, f)
    }

    /// Run `f` with stderr going wherever stdout currently goes.
    pub fn with_redirect_stderr_to_stdout<R>(&self, f: impl FnOnce(&Shell) -> R) -> R {
        self.with_redirect(Arc::new(IoFd::new(STDERR_FILENO, STDOUT_FILENO)), f)
    }

    /// Run `f` with stdout going wherever stderr currently goes.
    pub fn with_redirect_stdout_to_stderr<R>(&self, f: impl FnOnce(&Shell) -> R) -> R {
        self.with_redirect(Arc::new(IoFd::new(STDOUT_FILENO, STDERR_FILENO)), f)
    }

    pub fn with_stdin_closed<R>(&self, f: impl FnOnce(&Shell) -> R) -> R {
        self.with_redirect(Arc::new(IoClose::new(STDIN_FILENO)), f)
    }

    pub fn with_stdout_closed<R>(&self, f: impl FnOnce(&Shell) -> R) -> R {
        self.with_redirect(Arc::new(IoClose::new(STDOUT_FILENO)), f)
    }

    /// Run `f` under `policy`; the enclosing policy is restored afterwards.
    pub fn with_error_policy<R>(&self, policy: ErrorPolicy, f: impl FnOnce(&Shell) -> R) -> R {
        let _restore = scoped_push_replacer(|p| self.policy.replace(p), policy);
        f(self)
    }

    pub fn ignore_on_command_error<R>(&self, f: impl FnOnce(&Shell) -> R) -> R {
        self.with_error_policy(ErrorPolicy::Ignore, f)
    }

    pub fn warn_on_command_error<R>(&self, f: impl FnOnce(&Shell) -> R) -> R {
        self.with_error_policy(ErrorPolicy::Warn, f)
    }

    pub fn raise_on_command_error<R>(&self, f: impl FnOnce(&Shell) -> R) -> R {
        self.with_error_policy(ErrorPolicy::Raise, f)
    }

    /// Resolve the status of `command_line` under the current policy.
    pub fn check_status(&self, status: ProcStatus, command_line: &str) -> Result<bool> {
        apply_policy(self.error_policy(), status, command_line, self.stderr_fd())
    }

    /// Launch a stage with `options` layered over the current redirections.
    /// The returned handle must be waited for or detached.
    pub fn spawn(&self, stage: impl Into<Stage>, options: SpawnOptions) -> Result<SpawnHandle> {
        exec::spawn_stage(self, stage.into(), options)
    }

    /// Launch a stage and forget about it. External processes are still reaped.
    pub fn spawn_detached(&self, stage: impl Into<Stage>, options: SpawnOptions) -> Result<()> {
        self.spawn(stage, options)?.detach();
        Ok(())
    }

    /// Run an external command to completion, then apply the error policy.
    pub fn run(&self, cmd: Command) -> Result<bool> {
        let command_line = cmd.command_line();
        let handle = self.spawn(cmd, SpawnOptions::default())?;
        let status = handle.wait().map_err(|err| Error::spawn(&command_line, err))?;
        self.check_status(status, &command_line)
    }

    /// Run a callable in this thread under the current redirections, then apply the error
    /// policy to its status.
    pub fn run_callable(&self, callable: Callable) -> Result<bool> {
        let name = callable.name().to_owned();
        let status = self.call(|streams| callable.invoke(streams));
        self.check_status(status, &name)
    }

    /// Run either kind of stage to completion.
    pub fn run_stage(&self, stage: impl Into<Stage>) -> Result<bool> {
        match stage.into() {
            Stage::External(cmd) => self.run(cmd),
            Stage::Callable(callable) => self.run_callable(callable),
        }
    }

    /// Run `f` in this thread with streams for the current redirections.
    pub fn call<R>(&self, f: impl FnOnce(&mut IoStreams<'_>) -> R) -> R {
        let mut streams = IoStreams::new(self);
        f(&mut streams)
    }

    /// Run `f` on its own thread with a snapshot of this context and return its value.
    /// Nothing `f` does to its context is visible here. A panic in `f` becomes
    /// [`Error::Execution`].
    pub fn call_isolated<R, F>(&self, name: impl Into<String>, f: F) -> Result<R>
    where
        F: FnOnce(&mut IoStreams<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        exec::run_isolated(self, name.into(), f)
    }

    /// Run each stage in order. The result is that of the last stage.
    pub fn run_seq(&self, stages: impl IntoIterator<Item = Stage>) -> Result<bool> {
        let mut result = true;
        for stage in stages {
            result = self.run_stage(stage)?;
        }
        Ok(result)
    }

    /// Run stages in order until one succeeds. Failures of all but the last stage are ignored
    /// regardless of policy.
    pub fn run_or(&self, stages: impl IntoIterator<Item = Stage>) -> Result<bool> {
        let mut stages = stages.into_iter().peekable();
        while let Some(stage) = stages.next() {
            if stages.peek().is_none() {
                return self.run_stage(stage);
            }
            if self.ignore_on_command_error(|sh| sh.run_stage(stage))? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Run stages in order until one fails.
    pub fn run_and(&self, stages: impl IntoIterator<Item = Stage>) -> Result<bool> {
        for stage in stages {
            if !self.run_stage(stage)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Debug for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shell")
            .field("redirections", &*self.redirections.borrow())
            .field("env", &*self.env.borrow())
            .field("policy", &self.policy.get())
            .finish()
    }
}
