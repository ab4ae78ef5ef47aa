//! Connecting stages with pipes.

use crate::command::Stage;
use crate::error::{Error, Result};
use crate::exec::SpawnOptions;
use crate::fds::make_autoclose_pipes;
use crate::flog::FLOG;
use crate::io::{IoPipe, IoStreams};
use crate::proc::SpawnHandle;
use crate::shell::Shell;
use libc::{STDIN_FILENO, STDOUT_FILENO};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

/// Stages whose status nobody waits for. They are detached when this goes out of scope, on
/// success and on error alike.
#[derive(Default)]
struct Detached(Vec<SpawnHandle>);

impl Drop for Detached {
    fn drop(&mut self) {
        for handle in self.0.drain(..) {
            handle.detach();
        }
    }
}

/// The pipeline as a command line, for diagnostics.
fn pipeline_context(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(Stage::display_name)
        .collect::<Vec<_>>()
        .join(" | ")
}

fn stdin_from(read: OwnedFd) -> Arc<IoPipe> {
    Arc::new(IoPipe::new(STDIN_FILENO, read))
}

fn stdout_to(write: OwnedFd) -> Arc<IoPipe> {
    Arc::new(IoPipe::new(STDOUT_FILENO, write))
}

impl Shell {
    /// Launch `stages`, each writing into the next one, and the last one into `stdout`.
    /// Stages are launched right to left. Our copies of each pipe end are closed as soon as the
    /// stage using it has been spawned. Nothing launched here is waited for.
    fn launch_upstream(&self, stages: Vec<Stage>, stdout: OwnedFd) -> Result<()> {
        let mut launched = Detached::default();
        let mut stdout = stdout;
        for (idx, stage) in stages.into_iter().enumerate().rev() {
            let mut options = SpawnOptions::new().stdout(stdout_to(stdout));
            let upstream = if idx > 0 {
                let pipe = make_autoclose_pipes()?;
                FLOG!(
                    exec_pipeline,
                    format!(
                        "pipe {} -> {} feeds stage {}",
                        pipe.write.as_raw_fd(),
                        pipe.read.as_raw_fd(),
                        idx
                    )
                );
                options = options.stdin(stdin_from(pipe.read));
                Some(pipe.write)
            } else {
                None
            };
            let handle = self.spawn(stage, options)?;
            FLOG!(exec_pipeline, "launched stage", idx, format!("{:?}", handle));
            launched.0.push(handle);
            match upstream {
                Some(write) => stdout = write,
                None => break,
            }
        }
        Ok(())
    }

    /// Run `stages` as a pipeline: the stdout of each stage is the stdin of the next.
    ///
    /// The outcome is that of the last stage, resolved under the current error policy with the
    /// whole pipeline as the command line. Failures of earlier stages are not reported. An
    /// external last stage is waited for; a callable last stage runs in this thread. Earlier
    /// stages are detached, and reaped once they exit.
    ///
    /// A pipeline without stages is an [`Error::InvalidArgument`].
    pub fn pipe(&self, stages: impl IntoIterator<Item = Stage>) -> Result<bool> {
        let mut stages: Vec<Stage> = stages.into_iter().collect();
        let Some(last) = stages.pop() else {
            return Err(Error::InvalidArgument("pipeline has no stages".into()));
        };
        if stages.is_empty() {
            return self.run_stage(last);
        }
        let mut context = pipeline_context(&stages);
        context.push_str(" | ");
        context.push_str(&last.display_name());
        FLOG!(exec_pipeline, "Running pipeline", format!("'{}'", context));

        let pipe = make_autoclose_pipes()?;
        let status = match last {
            Stage::External(cmd) => {
                let handle = self.spawn(cmd, SpawnOptions::new().stdin(stdin_from(pipe.read)))?;
                if let Err(err) = self.launch_upstream(stages, pipe.write) {
                    handle.detach();
                    return Err(err);
                }
                handle
                    .wait()
                    .map_err(|err| Error::spawn(context.as_str(), err))?
            }
            Stage::Callable(callable) => {
                self.launch_upstream(stages, pipe.write)?;
                self.with_redirect(stdin_from(pipe.read), |sh| {
                    sh.call(|streams| callable.invoke(streams))
                })
            }
        };
        self.check_status(status, &context)
    }

    /// Run `stages` as a pipeline feeding `last`, which runs in this thread with its stdin
    /// reading from the pipeline. Returns the value of `last`.
    ///
    /// With no stages, `last` runs under the current stdin.
    pub fn pipe_to<R>(
        &self,
        stages: impl IntoIterator<Item = Stage>,
        last: impl FnOnce(&mut IoStreams<'_>) -> R,
    ) -> Result<R> {
        let stages: Vec<Stage> = stages.into_iter().collect();
        if stages.is_empty() {
            return Ok(self.call(last));
        }
        FLOG!(
            exec_pipeline,
            "Running pipeline into caller",
            format!("'{}'", pipeline_context(&stages))
        );
        let pipe = make_autoclose_pipes()?;
        self.launch_upstream(stages, pipe.write)?;
        Ok(self.with_redirect(stdin_from(pipe.read), |sh| sh.call(last)))
    }
}
