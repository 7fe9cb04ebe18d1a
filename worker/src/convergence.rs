// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driving a highstate job on a new instance to completion.
//!
//! The job moves through
//!
//! ```text
//! NotDispatched -> Dispatched -> PollingUnknown -> PollingRunning -> Completed
//! ```
//!
//! and may leave for `DispatchFailed` or `PollFailed` at any point before
//! `Completed`. Polling asks which jobs are running on the target rather
//! than asking about our job directly: right after dispatch a point query
//! tends to report the job as unknown.
//!
//! An empty listing is not trusted on its own. Before the job has been seen
//! running, empty listings spend the retry budget, and the job is only
//! presumed finished once the budget runs out. After it has been seen
//! running, it takes `completion_confirmations` empty listings in a row to
//! declare it finished; a listing that shows it running again starts the
//! count over.

use crate::config::Tunables;
use crate::highstate;
use crate::highstate::HighstateError;
use crate::highstate::HighstateResult;
use crate::remote_job::JobHandle;
use crate::remote_job::JobSpec;
use crate::remote_job::RemoteJobApi;
use crate::remote_job::RemoteJobError;
use saltcloud_worker_common::backoff::retry_notify;
use saltcloud_worker_common::backoff::retry_policy_fixed;
use saltcloud_worker_common::backoff::AttemptBudget;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConvergenceError {
    #[error("failed to dispatch highstate to {target} after {attempts} attempts")]
    DispatchFailed {
        target: String,
        attempts: u32,
        #[source]
        last_error: Option<RemoteJobError>,
    },

    #[error("timed out polling job {jid} on {target}")]
    PollTimeout { target: String, jid: JobHandle },

    #[error("failed polling job {jid} on {target}")]
    PollFailed {
        target: String,
        jid: JobHandle,
        #[source]
        err: RemoteJobError,
    },

    #[error("could not fetch result of job {jid} on {target}: {reason}")]
    ResultFetch { target: String, jid: JobHandle, reason: String },

    #[error("malformed result of job {jid} on {target}: {reason}")]
    Malformed { target: String, jid: JobHandle, reason: String },

    #[error("job {jid} on {target} failed at step {step}")]
    StepFailed { target: String, jid: JobHandle, step: String },
}

impl ConvergenceError {
    fn from_highstate(jid: &JobHandle, err: HighstateError) -> Self {
        let jid = jid.clone();
        match err {
            HighstateError::Missing { target } => {
                ConvergenceError::ResultFetch {
                    target,
                    jid,
                    reason: String::from("no result returned"),
                }
            }
            HighstateError::ErrorSentinel { target, message } => {
                ConvergenceError::ResultFetch { target, jid, reason: message }
            }
            HighstateError::Malformed { target, reason } => {
                ConvergenceError::Malformed { target, jid, reason }
            }
            HighstateError::StepFailed { target, step } => {
                ConvergenceError::StepFailed { target, jid, step }
            }
        }
    }
}

/// What we currently believe about a dispatched job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum JobStatus {
    /// Not (yet) seen in the running-jobs listing.
    Pending,
    Running,
    Completed,
    /// The last listing could not be obtained.
    Unknown,
}

/// One poll of the target's running jobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    Running,
    Absent,
    TimedOut,
    Failed,
}

/// Pure state machine deciding when a job is finished.
#[derive(Debug)]
pub struct JobTracker {
    max_budget: u32,
    budget: u32,
    confirmations_required: u32,
    confirmations: u32,
    seen_running: bool,
    status: JobStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Continue(JobStatus),
    Completed,
    /// The retry budget ran out without the job being seen to finish.
    Exhausted,
}

impl JobTracker {
    pub fn new(retry_budget: u32, confirmations_required: u32) -> Self {
        let max_budget = retry_budget.max(1);
        Self {
            max_budget,
            budget: max_budget,
            confirmations_required: confirmations_required.max(1),
            confirmations: 0,
            seen_running: false,
            status: JobStatus::Pending,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn seen_running(&self) -> bool {
        self.seen_running
    }

    pub fn remaining_budget(&self) -> u32 {
        self.budget
    }

    pub fn observe(&mut self, observation: Observation) -> Verdict {
        match observation {
            Observation::Running => {
                self.seen_running = true;
                self.confirmations = 0;
                self.budget = self.max_budget;
                self.status = JobStatus::Running;
            }
            Observation::Absent if self.seen_running => {
                self.confirmations += 1;
                if self.confirmations >= self.confirmations_required {
                    self.status = JobStatus::Completed;
                    return Verdict::Completed;
                }
                self.status = JobStatus::Running;
            }
            Observation::Absent => {
                self.status = JobStatus::Pending;
                self.budget -= 1;
                if self.budget == 0 {
                    // The job may have come and gone before the first poll.
                    self.status = JobStatus::Completed;
                    return Verdict::Completed;
                }
            }
            Observation::TimedOut | Observation::Failed => {
                self.status = JobStatus::Unknown;
                self.budget -= 1;
                if self.budget == 0 {
                    return Verdict::Exhausted;
                }
            }
        }
        Verdict::Continue(self.status)
    }
}

/// Dispatches a highstate to a target, waits for it, and interprets the
/// result.
pub struct ConvergenceDriver {
    log: Logger,
    jobs: Arc<dyn RemoteJobApi>,
    tunables: Tunables,
}

impl ConvergenceDriver {
    pub fn new(
        log: &Logger,
        jobs: Arc<dyn RemoteJobApi>,
        tunables: Tunables,
    ) -> Self {
        let log = log.new(o!("component" => "ConvergenceDriver"));
        Self { log, jobs, tunables }
    }

    pub async fn converge(
        &self,
        target: &str,
    ) -> Result<HighstateResult, ConvergenceError> {
        let log = self.log.new(o!("target" => target.to_string()));
        let jid = self.dispatch(&log, target).await?;
        let log = log.new(o!("jid" => jid.to_string()));

        tokio::time::sleep(self.tunables.post_dispatch_delay).await;

        self.wait_for_completion(&log, target, &jid).await?;
        let result = self.fetch(&log, target, &jid).await?;
        info!(
            log, "highstate completed";
            "steps" => result.steps.len(),
        );
        Ok(result)
    }

    async fn dispatch(
        &self,
        log: &Logger,
        target: &str,
    ) -> Result<JobHandle, ConvergenceError> {
        let budget =
            Mutex::new(AttemptBudget::new(self.tunables.dispatch_attempts));
        let jobs = &self.jobs;

        let try_dispatch = || async {
            // The guard must not be held across the await below.
            let attempt = budget.lock().unwrap().start_attempt();
            debug!(log, "dispatching highstate"; "attempt" => attempt);
            let outcome = jobs.dispatch(target, JobSpec::Highstate).await;
            let budget = budget.lock().unwrap();
            match outcome {
                Ok(Some(jid)) => Ok(jid),
                Ok(None) => Err(budget.classify(None)),
                Err(err) => Err(budget.classify(Some(err))),
            }
        };
        let log_failure = |err: Option<RemoteJobError>, delay: Duration| {
            warn!(
                log,
                "failed to dispatch highstate, will retry in {:?}", delay;
                "error" => err.map(|e| e.to_string()).unwrap_or_else(
                    || String::from("no job id returned")
                ),
            );
        };

        let result = retry_notify(
            retry_policy_fixed(self.tunables.dispatch_retry_delay),
            try_dispatch,
            log_failure,
        )
        .await;

        let attempts = budget.lock().unwrap().attempts();
        match result {
            Ok(jid) => {
                info!(
                    log, "highstate dispatched";
                    "jid" => jid.to_string(),
                    "attempts" => attempts,
                );
                Ok(jid)
            }
            Err(last_error) => {
                warn!(
                    log, "giving up on dispatching highstate";
                    "attempts" => attempts,
                );
                Err(ConvergenceError::DispatchFailed {
                    target: target.to_string(),
                    attempts,
                    last_error,
                })
            }
        }
    }

    async fn wait_for_completion(
        &self,
        log: &Logger,
        target: &str,
        jid: &JobHandle,
    ) -> Result<(), ConvergenceError> {
        let mut tracker = JobTracker::new(
            self.tunables.poll_retry_budget,
            self.tunables.completion_confirmations,
        );
        let mut last_error = None;

        loop {
            let observation = match tokio::time::timeout(
                self.tunables.poll_timeout,
                self.jobs.list_running(target),
            )
            .await
            {
                Ok(Ok(running)) => {
                    if running.iter().any(|job| &job.jid == jid) {
                        Observation::Running
                    } else {
                        Observation::Absent
                    }
                }
                Ok(Err(err)) if err.is_timeout() => Observation::TimedOut,
                Ok(Err(err)) => {
                    warn!(
                        log, "failed to list running jobs";
                        "error" => %err,
                    );
                    last_error = Some(err);
                    Observation::Failed
                }
                Err(_) => Observation::TimedOut,
            };

            if observation == Observation::TimedOut {
                last_error = None;
            }

            match tracker.observe(observation) {
                Verdict::Completed => {
                    debug!(
                        log, "job no longer running";
                        "seen_running" => tracker.seen_running(),
                    );
                    return Ok(());
                }
                Verdict::Exhausted => {
                    warn!(log, "polling retry budget exhausted");
                    return Err(match last_error {
                        Some(err) => ConvergenceError::PollFailed {
                            target: target.to_string(),
                            jid: jid.clone(),
                            err,
                        },
                        None => ConvergenceError::PollTimeout {
                            target: target.to_string(),
                            jid: jid.clone(),
                        },
                    });
                }
                Verdict::Continue(status) => {
                    debug!(
                        log, "polled job";
                        "observation" => ?observation,
                        "status" => %status,
                        "budget" => tracker.remaining_budget(),
                    );
                }
            }

            tokio::time::sleep(self.tunables.poll_interval).await;
        }
    }

    async fn fetch(
        &self,
        log: &Logger,
        target: &str,
        jid: &JobHandle,
    ) -> Result<HighstateResult, ConvergenceError> {
        let timeout = self.tunables.fetch_timeout;
        let fetched = tokio::time::timeout(
            timeout,
            self.jobs.fetch_result(jid, target, timeout),
        )
        .await;

        let result_fetch = |reason: String| ConvergenceError::ResultFetch {
            target: target.to_string(),
            jid: jid.clone(),
            reason,
        };
        let value = match fetched {
            Ok(Ok(Some(value))) => value,
            Ok(Ok(None)) => {
                return Err(result_fetch(String::from("no result returned")));
            }
            Ok(Err(err)) => return Err(result_fetch(err.to_string())),
            Err(_) => {
                let reason = format!("timed out after {timeout:?}");
                return Err(result_fetch(reason));
            }
        };

        highstate::interpret(target, &value).map_err(|err| {
            warn!(log, "highstate did not succeed"; "error" => %err);
            ConvergenceError::from_highstate(jid, err)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::remote_job::FakeRemoteJobs;
    use crate::fakes::remote_job::Poll;
    use saltcloud_worker_test_utils::dev::test_setup_log;
    use serde_json::json;

    const TARGET: &str = "w-worker-rnd0042";

    fn observe_all(
        tracker: &mut JobTracker,
        observations: &[Observation],
    ) -> Vec<Verdict> {
        observations.iter().map(|o| tracker.observe(*o)).collect()
    }

    #[test]
    fn test_tracker_suppresses_single_empty_poll() {
        use Observation::*;
        let mut tracker = JobTracker::new(6, 2);
        let verdicts = observe_all(
            &mut tracker,
            &[Running, Absent, Running, Absent, Absent],
        );
        assert_eq!(
            verdicts,
            [
                Verdict::Continue(JobStatus::Running),
                Verdict::Continue(JobStatus::Running),
                Verdict::Continue(JobStatus::Running),
                Verdict::Continue(JobStatus::Running),
                Verdict::Completed,
            ]
        );
        assert!(tracker.seen_running());
        assert_eq!(tracker.status(), JobStatus::Completed);
    }

    #[test]
    fn test_tracker_never_seen_running() {
        let mut tracker = JobTracker::new(3, 2);
        assert_eq!(
            tracker.observe(Observation::Absent),
            Verdict::Continue(JobStatus::Pending)
        );
        assert_eq!(
            tracker.observe(Observation::Absent),
            Verdict::Continue(JobStatus::Pending)
        );
        assert_eq!(tracker.observe(Observation::Absent), Verdict::Completed);
        assert!(!tracker.seen_running());
    }

    #[test]
    fn test_tracker_budget_resets_on_running() {
        use Observation::*;
        let mut tracker = JobTracker::new(3, 2);
        observe_all(&mut tracker, &[TimedOut, TimedOut]);
        assert_eq!(tracker.remaining_budget(), 1);
        assert_eq!(tracker.status(), JobStatus::Unknown);
        tracker.observe(Running);
        assert_eq!(tracker.remaining_budget(), 3);
        // Repeated timeouts while running still exhaust the budget.
        let verdicts = observe_all(&mut tracker, &[TimedOut, Failed, TimedOut]);
        assert_eq!(verdicts.last(), Some(&Verdict::Exhausted));
    }

    #[test]
    fn test_tracker_pending_does_not_reset_budget() {
        use Observation::*;
        let mut tracker = JobTracker::new(4, 2);
        let verdicts =
            observe_all(&mut tracker, &[TimedOut, Absent, TimedOut, Absent]);
        // The last empty listing exhausts the budget; the job is presumed
        // done.
        assert_eq!(verdicts.last(), Some(&Verdict::Completed));
    }

    fn tunables() -> Tunables {
        Tunables { poll_retry_budget: 6, ..Tunables::default() }
    }

    fn successful_return() -> serde_json::Value {
        json!({ TARGET: { "ret": {
            "pkg_|-git_|-git_|-installed": { "name": "git", "result": true },
        } } })
    }

    #[tokio::test(start_paused = true)]
    async fn test_converge_success() {
        let logctx = test_setup_log("test_converge_success");
        let jobs = FakeRemoteJobs::new()
            .with_polls([
                Poll::Running,
                Poll::Empty,
                Poll::Running,
                Poll::Empty,
                Poll::Empty,
            ])
            .with_result(successful_return());
        let driver =
            ConvergenceDriver::new(&logctx.log, jobs.clone(), tunables());

        let result = driver.converge(TARGET).await.unwrap();
        assert_eq!(result.steps.len(), 1);
        assert_eq!(jobs.dispatch_count(), 1);
        assert_eq!(jobs.poll_count(), 5);
        assert_eq!(jobs.fetch_count(), 1);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_retries_then_succeeds() {
        let logctx = test_setup_log("test_dispatch_retries_then_succeeds");
        for failures in [1, 4, 10] {
            let jobs = FakeRemoteJobs::new()
                .with_dispatch_failures(failures)
                .with_polls([Poll::Running, Poll::Empty, Poll::Empty])
                .with_result(successful_return());
            let driver =
                ConvergenceDriver::new(&logctx.log, jobs.clone(), tunables());
            driver.converge(TARGET).await.unwrap();
            assert_eq!(jobs.dispatch_count(), failures + 1);
        }
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_exhaustion() {
        let logctx = test_setup_log("test_dispatch_exhaustion");
        let jobs = FakeRemoteJobs::new().with_dispatch_failures(u32::MAX);
        let driver =
            ConvergenceDriver::new(&logctx.log, jobs.clone(), tunables());

        let err = driver.converge(TARGET).await.unwrap_err();
        assert!(
            matches!(
                err,
                ConvergenceError::DispatchFailed { attempts: 11, .. }
            ),
            "{err}"
        );
        assert_eq!(jobs.dispatch_count(), 11);
        assert_eq!(jobs.poll_count(), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timeouts_exhaust_budget() {
        let logctx = test_setup_log("test_poll_timeouts_exhaust_budget");
        let jobs = FakeRemoteJobs::new()
            .with_polls([Poll::Running])
            .with_default_poll(Poll::Timeout);
        let driver =
            ConvergenceDriver::new(&logctx.log, jobs.clone(), tunables());

        let err = driver.converge(TARGET).await.unwrap_err();
        assert!(matches!(err, ConvergenceError::PollTimeout { .. }), "{err}");
        // One running observation, then a full budget of timeouts.
        assert_eq!(jobs.poll_count(), 7);
        assert_eq!(jobs.fetch_count(), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_are_reported() {
        let logctx = test_setup_log("test_poll_errors_are_reported");
        let jobs = FakeRemoteJobs::new().with_default_poll(Poll::Error);
        let driver =
            ConvergenceDriver::new(&logctx.log, jobs.clone(), tunables());

        let err = driver.converge(TARGET).await.unwrap_err();
        assert!(matches!(err, ConvergenceError::PollFailed { .. }), "{err}");
        assert_eq!(jobs.poll_count(), 6);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failures() {
        let logctx = test_setup_log("test_fetch_failures");

        let jobs = FakeRemoteJobs::new().with_polls([Poll::Running]);
        let driver =
            ConvergenceDriver::new(&logctx.log, jobs.clone(), tunables());
        let err = driver.converge(TARGET).await.unwrap_err();
        assert!(matches!(err, ConvergenceError::ResultFetch { .. }), "{err}");

        let jobs = FakeRemoteJobs::new()
            .with_polls([Poll::Running])
            .with_result(json!({ TARGET: { "ret": ["Rendering failed"] } }));
        let driver =
            ConvergenceDriver::new(&logctx.log, jobs.clone(), tunables());
        let err = driver.converge(TARGET).await.unwrap_err();
        assert!(matches!(err, ConvergenceError::Malformed { .. }), "{err}");

        logctx.cleanup_successful();
    }
}
