// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for running the salt command-line tools as child processes.

use std::process::ExitStatus;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("Command [{command}] did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
}

impl ExecutionError {
    /// Returns true if the command ran out of time rather than failing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::TimedOut { .. })
    }
}

pub fn command_to_string(command: &std::process::Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into())
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn output_to_exec_error(
    command: &std::process::Command,
    output: &Output,
) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(command),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}

/// Runs `command` to completion and checks its exit code.
pub async fn execute_async(
    command: &mut Command,
) -> Result<Output, ExecutionError> {
    let output = command.output().await.map_err(|err| {
        ExecutionError::ExecutionStart {
            command: command_to_string(command.as_std()),
            err,
        }
    })?;

    if !output.status.success() {
        return Err(output_to_exec_error(command.as_std(), &output));
    }

    Ok(output)
}

/// Like [`execute_async`], but kills the child if it has not exited after
/// `timeout`.
pub async fn execute_async_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<Output, ExecutionError> {
    // Dropping the `output()` future on timeout must take the child with it.
    command.kill_on_drop(true);
    match tokio::time::timeout(timeout, execute_async(command)).await {
        Ok(result) => result,
        Err(_) => Err(ExecutionError::TimedOut {
            command: command_to_string(command.as_std()),
            timeout,
        }),
    }
}
