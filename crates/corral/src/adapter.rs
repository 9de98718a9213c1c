// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child-process adapter: one CLI invocation per call.
//!
//! Each `execute` spawns the configured command, writes the prompt to its
//! stdin, closes the stream, and drains stdout/stderr to EOF while waiting
//! for exit, all under the per-call timeout. The CLI is known to exit
//! non-zero on success in some configurations, so the exit code only
//! matters when stdout came back empty.

use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// How a CLI call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliError {
    SpawnFailed(String),
    EmptyOutput { exit_code: Option<i32> },
    Timeout { limit: Duration },
    BrokenIo(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpawnFailed(e) => write!(f, "failed to spawn CLI: {e}"),
            Self::EmptyOutput { exit_code } => {
                write!(f, "CLI produced no output (exit code {exit_code:?})")
            }
            Self::Timeout { limit } => write!(f, "CLI call exceeded {}s", limit.as_secs()),
            Self::BrokenIo(e) => write!(f, "CLI i/o failed: {e}"),
        }
    }
}

/// The command the broker fronts, plus the environment it runs under.
#[derive(Debug, Clone)]
pub struct CliCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl CliCommand {
    /// Build from an argv-style vector; the first element is the program.
    pub fn from_argv(argv: &[String]) -> Self {
        let (program, args) = match argv.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => ("claude".to_owned(), Vec::new()),
        };
        Self { program, args, envs: Vec::new() }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_owned(), value.to_owned()));
        self
    }
}

/// A successful CLI call.
#[derive(Debug, Clone)]
pub struct CliReply {
    pub text: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Drives one CLI child per call and force-kills it on timeout.
pub struct CliAdapter {
    command: CliCommand,
    timeout: Duration,
    current_pid: Mutex<Option<u32>>,
}

impl CliAdapter {
    pub fn new(command: CliCommand, timeout: Duration) -> Self {
        Self { command, timeout, current_pid: Mutex::new(None) }
    }

    /// Run one prompt through a fresh child process.
    pub async fn execute(&self, prompt: &str) -> Result<CliReply, CliError> {
        if prompt.is_empty() {
            return Err(CliError::BrokenIo("empty prompt".to_owned()));
        }

        let started = Instant::now();
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.command.envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| CliError::SpawnFailed(e.to_string()))?;
        *self.current_pid.lock() = child.id();

        // Write the prompt once and close the stream.
        let Some(mut stdin) = child.stdin.take() else {
            self.clear_pid();
            return Err(CliError::BrokenIo("child stdin unavailable".to_owned()));
        };
        if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
            self.clear_pid();
            return Err(CliError::BrokenIo(e.to_string()));
        }
        if let Err(e) = stdin.shutdown().await {
            self.clear_pid();
            return Err(CliError::BrokenIo(e.to_string()));
        }
        drop(stdin);

        let Some(mut stdout) = child.stdout.take() else {
            self.clear_pid();
            return Err(CliError::BrokenIo("child stdout unavailable".to_owned()));
        };
        let Some(mut stderr) = child.stderr.take() else {
            self.clear_pid();
            return Err(CliError::BrokenIo("child stderr unavailable".to_owned()));
        };

        // Drain both streams to EOF concurrently with the wait, so a chatty
        // child never deadlocks on a full pipe.
        let run = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (read_out, read_err) =
                tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
            read_out.map_err(|e| CliError::BrokenIo(e.to_string()))?;
            read_err.map_err(|e| CliError::BrokenIo(e.to_string()))?;
            let status =
                child.wait().await.map_err(|e| CliError::BrokenIo(e.to_string()))?;
            Ok::<_, CliError>((out, err, status))
        };

        let result = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                // Stuck child: force-kill and reap.
                let _ = child.start_kill();
                let _ = child.wait().await;
                self.clear_pid();
                warn!(limit_secs = self.timeout.as_secs(), "CLI call timed out, child killed");
                return Err(CliError::Timeout { limit: self.timeout });
            }
        };
        self.clear_pid();

        let (out, err, status) = result?;
        let text = String::from_utf8_lossy(&out).into_owned();
        let stderr_text = String::from_utf8_lossy(&err).into_owned();

        if text.trim().is_empty() {
            debug!(exit_code = ?status.code(), stderr = %stderr_text, "CLI emitted no output");
            return Err(CliError::EmptyOutput { exit_code: status.code() });
        }
        if !status.success() {
            // Non-zero with output is a success for this CLI family.
            debug!(exit_code = ?status.code(), "CLI exited non-zero with output, treating as success");
        }

        Ok(CliReply { text, stderr: stderr_text, duration: started.elapsed() })
    }

    /// Force-kill whatever child is currently in flight.
    pub fn terminate(&self) {
        if let Some(pid) = *self.current_pid.lock() {
            kill_pid(pid);
        }
    }

    fn clear_pid(&self) {
        *self.current_pid.lock() = None;
    }
}

/// Deliver SIGKILL to a pid, ignoring races with normal exit.
fn kill_pid(pid: u32) {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return;
    };
    let _ = signal::kill(Pid::from_raw(pid_i32), Signal::SIGKILL);
}

#[cfg(test)]
#[path = "adapter_tests.rs"]
mod tests;
