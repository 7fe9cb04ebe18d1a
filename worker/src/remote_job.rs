// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the remote-execution service that runs jobs on minions.

use saltcloud_worker_common::process::ExecutionError;
use std::time::Duration;

/// Opaque identifier of a dispatched job.
///
/// Only ever compared for equality; the contents are never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(jid: impl Into<String>) -> Self {
        Self(jid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job the controller knows how to dispatch.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr,
)]
pub enum JobSpec {
    /// Converge the minion to its declared state.
    #[strum(serialize = "state.highstate")]
    Highstate,
}

impl JobSpec {
    /// The execution-module function implementing this job.
    pub fn function(self) -> &'static str {
        self.into()
    }
}

/// One entry of a target's "currently running jobs" listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunningJob {
    pub jid: JobHandle,
    pub function: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteJobError {
    #[error("{operation} on {target} timed out")]
    Timeout { operation: &'static str, target: String },

    #[error("{operation} on {target} failed")]
    Execution {
        operation: &'static str,
        target: String,
        #[source]
        err: ExecutionError,
    },

    #[error("unexpected output from {operation} on {target}: {reason}")]
    Parse { operation: &'static str, target: String, reason: String },
}

impl RemoteJobError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RemoteJobError::Timeout { .. })
    }
}

/// Dispatch, observe and collect jobs on minions.
#[async_trait::async_trait]
pub trait RemoteJobApi: Send + Sync {
    /// Publishes `job` to `target` without waiting for it to run.
    ///
    /// Returns `Ok(None)` if the service accepted the request but did not
    /// hand back a job id.
    async fn dispatch(
        &self,
        target: &str,
        job: JobSpec,
    ) -> Result<Option<JobHandle>, RemoteJobError>;

    /// Lists the jobs currently running on `target`.
    async fn list_running(
        &self,
        target: &str,
    ) -> Result<Vec<RunningJob>, RemoteJobError>;

    /// Fetches the full return of `handle` for `target`, shaped
    /// `{target: {"ret": ...}}`. Returns `Ok(None)` if no return is known.
    async fn fetch_result(
        &self,
        handle: &JobHandle,
        target: &str,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, RemoteJobError>;
}
