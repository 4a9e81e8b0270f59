//! Child process ownership with graceful-then-forced termination

use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Error, Result};

const EXIT_POLL: Duration = Duration::from_millis(20);

/// Program and arguments for an external command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build the `Command`. Children get their own process group so a
    /// terminal Ctrl-C reaches only us.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).process_group(0);
        cmd
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How a process ended when asked to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing to stop: never started, or already exited on its own.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Graceful(ExitStatus),
    /// Ignored SIGTERM and was killed.
    Killed(ExitStatus),
}

/// Read side of a child's stdout, handed to the reader thread.
pub struct ProcessOutput {
    stdout: ChildStdout,
}

impl ProcessOutput {
    /// Read whatever is available, up to `max_bytes`. Empty bytes mean the
    /// process closed its output.
    pub fn read(&mut self, max_bytes: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(max_bytes);
        loop {
            match self.stdout.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf.freeze());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// One external process and its output pipe.
pub struct ExternalProcess {
    spec: CommandSpec,
    child: Option<Child>,
    output: Option<ProcessOutput>,
}

impl ExternalProcess {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            child: None,
            output: None,
        }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Launch with stdout captured. Returns the pid; a second call while the
    /// process is alive returns the same pid without relaunching.
    pub fn start(&mut self) -> Result<u32> {
        if let Some(pid) = self.running_pid() {
            debug!(pid, "Process already running");
            return Ok(pid);
        }

        let mut child = self
            .spec
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::ProcessStart {
                program: self.spec.program.clone(),
                source,
            })?;

        let pid = child.id();
        self.output = child.stdout.take().map(|stdout| ProcessOutput { stdout });
        self.child = Some(child);
        info!(pid, command = %self.spec, "Started process");
        Ok(pid)
    }

    /// Hand the stdout pipe to a reader. Only the first caller after a start
    /// gets it.
    pub fn take_output(&mut self) -> Option<ProcessOutput> {
        self.output.take()
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Pid of the child if it has not exited yet.
    pub fn running_pid(&mut self) -> Option<u32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(None) => Some(child.id()),
            Ok(Some(_)) | Err(_) => None,
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.running_pid().is_some()
    }

    /// SIGTERM, wait up to `graceful_timeout`, then SIGKILL and wait for exit.
    pub fn terminate(&mut self, graceful_timeout: Duration) -> io::Result<Termination> {
        self.output = None;
        let Some(mut child) = self.child.take() else {
            return Ok(Termination::AlreadyExited);
        };

        if child.try_wait()?.is_some() {
            debug!(pid = child.id(), "Process had already exited");
            return Ok(Termination::AlreadyExited);
        }

        let pid = Pid::from_raw(child.id() as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!(%pid, error = %e, "SIGTERM failed");
        }

        if let Some(status) = wait_timeout(&mut child, graceful_timeout)? {
            info!(%pid, %status, "Process terminated");
            return Ok(Termination::Graceful(status));
        }

        warn!(%pid, ?graceful_timeout, "Process not responding, force killing");
        // kill() only errors if the child already exited; wait() reaps either way.
        let _ = child.kill();
        let status = child.wait()?;
        info!(%pid, %status, "Process killed");
        Ok(Termination::Killed(status))
    }
}

/// Poll `child` until it exits or `timeout` elapses.
pub fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(EXIT_POLL.min(deadline - now));
    }
}

/// Run a command to completion with a hard deadline, discarding output.
pub fn run_with_timeout(spec: &CommandSpec, timeout: Duration) -> Result<ExitStatus> {
    let mut child = spec
        .command()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| Error::ProcessStart {
            program: spec.program.clone(),
            source,
        })?;

    match wait_timeout(&mut child, timeout)? {
        Some(status) => Ok(status),
        None => {
            let _ = child.kill();
            child.wait()?;
            Err(Error::Command {
                command: spec.to_string(),
                message: format!("timed out after {timeout:?}"),
            })
        }
    }
}

impl Drop for ExternalProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                warn!(pid = child.id(), "Process dropped while running, killing");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}
