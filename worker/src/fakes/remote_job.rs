// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::remote_job::JobHandle;
use crate::remote_job::JobSpec;
use crate::remote_job::RemoteJobApi;
use crate::remote_job::RemoteJobError;
use crate::remote_job::RunningJob;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// What one call to [`RemoteJobApi::list_running`] reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Poll {
    /// The dispatched job is in the listing.
    Running,
    /// The listing is empty.
    Empty,
    /// The target did not answer in time.
    Timeout,
    /// The listing could not be obtained at all.
    Error,
}

struct State {
    jid: JobHandle,
    dispatch_failures: u32,
    dispatches: u32,
    polls: VecDeque<Poll>,
    default_poll: Poll,
    poll_count: u32,
    result: Option<Value>,
    fetches: u32,
}

/// A fake implementation of [`RemoteJobApi`] for a single job.
///
/// Dispatches fail the configured number of times, alternating between
/// returning no job id and timing out. Polls follow the scripted sequence,
/// then repeat the default poll, which is [`Poll::Empty`] unless changed.
pub struct FakeRemoteJobs {
    state: Mutex<State>,
}

impl FakeRemoteJobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                jid: JobHandle::new("20261019120000123456"),
                dispatch_failures: 0,
                dispatches: 0,
                polls: VecDeque::new(),
                default_poll: Poll::Empty,
                poll_count: 0,
                result: None,
                fetches: 0,
            }),
        })
    }

    pub fn with_dispatch_failures(self: Arc<Self>, failures: u32) -> Arc<Self> {
        self.state.lock().unwrap().dispatch_failures = failures;
        self
    }

    pub fn with_polls(
        self: Arc<Self>,
        polls: impl IntoIterator<Item = Poll>,
    ) -> Arc<Self> {
        self.state.lock().unwrap().polls.extend(polls);
        self
    }

    pub fn with_default_poll(self: Arc<Self>, poll: Poll) -> Arc<Self> {
        self.state.lock().unwrap().default_poll = poll;
        self
    }

    /// Sets the return reported by `fetch_result`. Without one, the fake
    /// reports that no return is known.
    pub fn with_result(self: Arc<Self>, result: Value) -> Arc<Self> {
        self.state.lock().unwrap().result = Some(result);
        self
    }

    pub fn dispatch_count(&self) -> u32 {
        self.state.lock().unwrap().dispatches
    }

    pub fn poll_count(&self) -> u32 {
        self.state.lock().unwrap().poll_count
    }

    pub fn fetch_count(&self) -> u32 {
        self.state.lock().unwrap().fetches
    }
}

#[async_trait::async_trait]
impl RemoteJobApi for FakeRemoteJobs {
    async fn dispatch(
        &self,
        target: &str,
        _job: JobSpec,
    ) -> Result<Option<JobHandle>, RemoteJobError> {
        let mut state = self.state.lock().unwrap();
        state.dispatches += 1;
        if state.dispatch_failures == 0 {
            return Ok(Some(state.jid.clone()));
        }
        state.dispatch_failures -= 1;
        if state.dispatches % 2 == 1 {
            Ok(None)
        } else {
            Err(RemoteJobError::Timeout {
                operation: "dispatch",
                target: target.to_string(),
            })
        }
    }

    async fn list_running(
        &self,
        target: &str,
    ) -> Result<Vec<RunningJob>, RemoteJobError> {
        let mut state = self.state.lock().unwrap();
        state.poll_count += 1;
        let default_poll = state.default_poll;
        let poll = state.polls.pop_front().unwrap_or(default_poll);
        match poll {
            Poll::Running => Ok(vec![
                RunningJob {
                    jid: JobHandle::new("20261019110000000001"),
                    function: Some(String::from("test.ping")),
                },
                RunningJob {
                    jid: state.jid.clone(),
                    function: Some(JobSpec::Highstate.to_string()),
                },
            ]),
            Poll::Empty => Ok(Vec::new()),
            Poll::Timeout => Err(RemoteJobError::Timeout {
                operation: "list_running",
                target: target.to_string(),
            }),
            Poll::Error => Err(RemoteJobError::Parse {
                operation: "list_running",
                target: target.to_string(),
                reason: String::from("not json"),
            }),
        }
    }

    async fn fetch_result(
        &self,
        _handle: &JobHandle,
        _target: &str,
        _timeout: Duration,
    ) -> Result<Option<Value>, RemoteJobError> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        Ok(state.result.clone())
    }
}
