// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running jobs on minions with the `salt` and `salt-run` tools.

use crate::config::SaltConfigPaths;
use crate::config::Tunables;
use crate::remote_job::JobHandle;
use crate::remote_job::JobSpec;
use crate::remote_job::RemoteJobApi;
use crate::remote_job::RemoteJobError;
use crate::remote_job::RunningJob;
use camino::Utf8PathBuf;
use saltcloud_worker_common::process::execute_async_with_timeout;
use saltcloud_worker_common::process::ExecutionError;
use serde_json::Value;
use slog::debug;
use slog::o;
use slog::Logger;
use std::time::Duration;
use tokio::process::Command;

pub const SALT: &str = "salt";
pub const SALT_RUN: &str = "salt-run";

const JOB_ID_MARKER: &str = "job ID:";
const NO_RETURN_MARKER: &str = "did not return";

/// [`RemoteJobApi`] backed by the salt command-line tools.
pub struct SaltCli {
    log: Logger,
    config_dir: Utf8PathBuf,
    command_timeout: Duration,
}

impl SaltCli {
    pub fn new(
        log: &Logger,
        paths: &SaltConfigPaths,
        tunables: &Tunables,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "SaltCli")),
            config_dir: paths.config_dir().to_path_buf(),
            command_timeout: tunables.poll_timeout,
        }
    }

    fn salt(&self, program: &str) -> Command {
        let mut command = Command::new(program);
        command.arg("-c").arg(&self.config_dir);
        command
    }

    /// Runs `command` and returns its stdout.
    ///
    /// salt exits non-zero when a minion does not answer, but still reports
    /// which minions did; that output is returned as well.
    async fn stdout(
        &self,
        operation: &'static str,
        target: &str,
        mut command: Command,
        timeout: Duration,
    ) -> Result<String, RemoteJobError> {
        debug!(
            self.log, "running salt";
            "operation" => operation,
            "target" => target,
        );
        match execute_async_with_timeout(&mut command, timeout).await {
            Ok(output) => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Err(ExecutionError::CommandFailure(info))
                if !info.stdout.trim().is_empty() =>
            {
                Ok(info.stdout)
            }
            Err(err) if err.is_timeout() => Err(RemoteJobError::Timeout {
                operation,
                target: target.to_string(),
            }),
            Err(err) => Err(RemoteJobError::Execution {
                operation,
                target: target.to_string(),
                err,
            }),
        }
    }
}

#[async_trait::async_trait]
impl RemoteJobApi for SaltCli {
    async fn dispatch(
        &self,
        target: &str,
        job: JobSpec,
    ) -> Result<Option<JobHandle>, RemoteJobError> {
        let mut command = self.salt(SALT);
        command.arg("--async").arg(target).arg(job.function());
        let stdout = self
            .stdout("dispatch", target, command, self.command_timeout)
            .await?;
        Ok(parse_job_id(&stdout))
    }

    async fn list_running(
        &self,
        target: &str,
    ) -> Result<Vec<RunningJob>, RemoteJobError> {
        let mut command = self.salt(SALT);
        command
            .args(["--out=json", "--static", "-t"])
            .arg(self.command_timeout.as_secs().max(1).to_string())
            .arg(target)
            .arg("saltutil.running");
        let stdout = self
            .stdout("list_running", target, command, self.command_timeout)
            .await?;
        parse_running(target, &stdout)
    }

    async fn fetch_result(
        &self,
        handle: &JobHandle,
        target: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, RemoteJobError> {
        let mut command = self.salt(SALT_RUN);
        command.arg("--out=json").arg("jobs.lookup_jid").arg(handle.as_str());
        let stdout =
            self.stdout("fetch_result", target, command, timeout).await?;
        parse_lookup(target, &stdout)
    }
}

/// Finds the job id in the output of `salt --async`, which reads like
/// "Executed command with job ID: 20261019120000123456".
fn parse_job_id(stdout: &str) -> Option<JobHandle> {
    stdout.lines().find_map(|line| {
        let (_, rest) = line.split_once(JOB_ID_MARKER)?;
        let jid = rest.trim();
        (!jid.is_empty()).then(|| JobHandle::new(jid))
    })
}

fn parse_error(
    target: &str,
    operation: &'static str,
    reason: String,
) -> RemoteJobError {
    RemoteJobError::Parse { operation, target: target.to_string(), reason }
}

fn parse_running(
    target: &str,
    stdout: &str,
) -> Result<Vec<RunningJob>, RemoteJobError> {
    const OPERATION: &str = "list_running";
    let timeout = || RemoteJobError::Timeout {
        operation: OPERATION,
        target: target.to_string(),
    };

    let document: Value = serde_json::from_str(stdout.trim())
        .map_err(|err| parse_error(target, OPERATION, err.to_string()))?;
    let entries = match document.get(target) {
        // Minions that did not answer are either left out or reported with
        // a message in place of their return.
        None => return Err(timeout()),
        Some(Value::String(message))
            if message.contains(NO_RETURN_MARKER) =>
        {
            return Err(timeout());
        }
        Some(Value::Bool(false)) => return Err(timeout()),
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            return Err(parse_error(
                target,
                OPERATION,
                format!("expected a list of jobs, got: {other}"),
            ));
        }
    };

    entries
        .iter()
        .map(|entry| {
            let jid = match entry.get("jid") {
                Some(Value::String(jid)) => jid.clone(),
                Some(Value::Number(jid)) => jid.to_string(),
                _ => {
                    return Err(parse_error(
                        target,
                        OPERATION,
                        format!("running job without a jid: {entry}"),
                    ));
                }
            };
            let function =
                entry.get("fun").and_then(Value::as_str).map(str::to_string);
            Ok(RunningJob { jid: JobHandle::new(jid), function })
        })
        .collect()
}

/// Reshapes the output of `salt-run jobs.lookup_jid` into
/// `{target: {"ret": ...}}`.
fn parse_lookup(
    target: &str,
    stdout: &str,
) -> Result<Option<Value>, RemoteJobError> {
    const OPERATION: &str = "fetch_result";

    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(None);
    }
    let mut document: Value = serde_json::from_str(stdout)
        .map_err(|err| parse_error(target, OPERATION, err.to_string()))?;

    // Some outputters wrap the returns along with the name of the outputter
    // that should display them.
    if document.get("outputter").is_some() {
        if let Some(data) = document.get_mut("data") {
            document = data.take();
        }
    }

    let Some(ret) = document.get_mut(target).map(Value::take) else {
        return Ok(None);
    };
    let ret = match ret {
        Value::Object(mut entry)
            if entry.len() == 1 && entry.contains_key("ret") =>
        {
            entry.remove("ret").unwrap_or(Value::Null)
        }
        other => other,
    };
    let mut normalized = serde_json::Map::new();
    normalized.insert(target.to_string(), serde_json::json!({ "ret": ret }));
    Ok(Some(Value::Object(normalized)))
}
