//! Jobs that run in a separate OS process.
//!
//! A child process shares no memory with the pool: its arguments, environment
//! and stdin go in, and only its exit code, stdout and stderr come back.

use crate::error::PoolError;
use crate::task::Job;

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

/// What a finished child process produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
  /// `None` if the process was terminated by a signal.
  pub exit_code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
}

/// Builder for a command executed as a pool job.
#[derive(Debug, Clone)]
pub struct ProcessJob {
  program: OsString,
  args: Vec<OsString>,
  envs: Vec<(OsString, OsString)>,
  current_dir: Option<PathBuf>,
  stdin: Option<Vec<u8>>,
  allow_failure: bool,
}

impl ProcessJob {
  pub fn new(program: impl Into<OsString>) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
      envs: Vec::new(),
      current_dir: None,
      stdin: None,
      allow_failure: false,
    }
  }

  pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn args<I>(mut self, args: I) -> Self
  where
    I: IntoIterator,
    I::Item: Into<OsString>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
    self.envs.push((key.into(), value.into()));
    self
  }

  pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.current_dir = Some(dir.into());
    self
  }

  /// Bytes written to the child's stdin, which is then closed.
  pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
    self.stdin = Some(input.into());
    self
  }

  /// Return the output even when the exit status is non-zero, instead of
  /// failing the task.
  pub fn allow_failure(mut self, allow: bool) -> Self {
    self.allow_failure = allow;
    self
  }

  pub fn into_job(self) -> Job<ProcessOutput> {
    Job::from_body(self.run())
  }

  async fn run(self) -> Result<ProcessOutput, PoolError> {
    let program = self.program.to_string_lossy().into_owned();
    let mut command = Command::new(&self.program);
    command
      .args(&self.args)
      .envs(self.envs.iter().map(|(k, v)| (k, v)))
      .stdin(if self.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    if let Some(dir) = &self.current_dir {
      command.current_dir(dir);
    }

    let mut child = command
      .spawn()
      .map_err(|e| PoolError::TaskFailed(format!("failed to spawn `{}`: {}", program, e)))?;
    debug!(program = %program, pid = ?child.id(), "Spawned child process.");

    let stdin_pipe = child.stdin.take();
    let input = self.stdin;
    let feed_stdin = async move {
      if let (Some(mut pipe), Some(input)) = (stdin_pipe, input) {
        pipe.write_all(&input).await?;
        pipe.shutdown().await?;
      }
      Ok::<(), std::io::Error>(())
    };

    let (fed, output) = tokio::join!(feed_stdin, child.wait_with_output());
    let output = output.map_err(|e| PoolError::TaskFailed(format!("failed to wait for `{}`: {}", program, e)))?;
    if let Err(e) = fed {
      // A child that exits without reading its input closes the pipe early.
      trace!(program = %program, "Writing stdin failed: {}", e);
    }

    let result = ProcessOutput {
      exit_code: output.status.code(),
      stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
      stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if !output.status.success() && !self.allow_failure {
      return Err(PoolError::TaskFailed(format!(
        "`{}` exited with {}: {}",
        program,
        output.status,
        result.stderr.trim()
      )));
    }
    Ok(result)
  }
}

impl Job<ProcessOutput> {
  /// Shorthand for [`ProcessJob::into_job`].
  pub fn process(job: ProcessJob) -> Self {
    job.into_job()
  }
}
