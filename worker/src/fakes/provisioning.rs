// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::provisioning::DestroyResult;
use crate::provisioning::DestroyStatus;
use crate::provisioning::InstanceStatus;
use crate::provisioning::ProvisioningApi;
use crate::provisioning::ProvisioningError;
use crate::provisioning::ProvisioningRequest;
use crate::provisioning::ProvisioningResult;
use crate::resolver::ConfigSnapshot;
use saltcloud_worker_common::process::ExecutionError;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;

/// How the fake answers a create.
#[derive(Clone, Debug)]
pub enum CreateOutcome {
    Created,
    /// The call returns normally, but reports an error for the instance.
    EmbeddedError(String),
    /// The call returns normally with an empty result.
    Empty,
    /// The call itself fails.
    Fail(String),
}

/// How the fake answers a destroy.
#[derive(Clone, Debug)]
pub enum DestroyOutcome {
    Destroyed,
    Absent,
    EmbeddedError(String),
    /// The call returns normally, but reports an error without naming the
    /// instances.
    CallError(String),
    Fail(String),
}

/// A create as the fake saw it.
#[derive(Clone, Debug)]
pub struct RecordedCreate {
    pub request: ProvisioningRequest,
    /// The profile settings that would have been handed to the provider.
    pub settings: Map<String, Value>,
}

struct State {
    create: CreateOutcome,
    destroy: DestroyOutcome,
    creates: Vec<RecordedCreate>,
    destroys: Vec<BTreeSet<String>>,
}

/// A fake implementation of [`ProvisioningApi`].
pub struct FakeProvisioning {
    state: Mutex<State>,
}

impl FakeProvisioning {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                create: CreateOutcome::Created,
                destroy: DestroyOutcome::Destroyed,
                creates: Vec::new(),
                destroys: Vec::new(),
            }),
        })
    }

    pub fn with_create(self: Arc<Self>, outcome: CreateOutcome) -> Arc<Self> {
        self.state.lock().unwrap().create = outcome;
        self
    }

    pub fn with_destroy(self: Arc<Self>, outcome: DestroyOutcome) -> Arc<Self> {
        self.state.lock().unwrap().destroy = outcome;
        self
    }

    pub fn creates(&self) -> Vec<RecordedCreate> {
        self.state.lock().unwrap().creates.clone()
    }

    pub fn destroys(&self) -> Vec<BTreeSet<String>> {
        self.state.lock().unwrap().destroys.clone()
    }
}

fn tool_failure(message: &str) -> ProvisioningError {
    ProvisioningError::Execution(ExecutionError::ExecutionStart {
        command: String::from("salt-cloud"),
        err: std::io::Error::other(message.to_string()),
    })
}

#[async_trait::async_trait]
impl ProvisioningApi for FakeProvisioning {
    async fn create(
        &self,
        config: &ConfigSnapshot,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResult, ProvisioningError> {
        let mut state = self.state.lock().unwrap();
        state.creates.push(RecordedCreate {
            request: request.clone(),
            settings: request.profile_settings(config.profile()),
        });
        let name = request.instance_name.clone();
        match &state.create {
            CreateOutcome::Created => Ok(ProvisioningResult {
                instances: BTreeMap::from([(
                    name.clone(),
                    InstanceStatus {
                        details: json!({ "name": name, "state": "running" }),
                        errors: Vec::new(),
                    },
                )]),
                error: None,
            }),
            CreateOutcome::EmbeddedError(message) => Ok(ProvisioningResult {
                instances: BTreeMap::from([(
                    name,
                    InstanceStatus {
                        details: Value::Null,
                        errors: vec![message.clone()],
                    },
                )]),
                error: None,
            }),
            CreateOutcome::Empty => Ok(ProvisioningResult::default()),
            CreateOutcome::Fail(message) => Err(tool_failure(message)),
        }
    }

    async fn destroy(
        &self,
        _config: &ConfigSnapshot,
        names: &BTreeSet<String>,
    ) -> Result<DestroyResult, ProvisioningError> {
        let mut state = self.state.lock().unwrap();
        state.destroys.push(names.clone());
        let status = match &state.destroy {
            DestroyOutcome::Destroyed => DestroyStatus::Destroyed,
            DestroyOutcome::Absent => return Ok(DestroyResult::default()),
            DestroyOutcome::EmbeddedError(message) => {
                DestroyStatus::Failed(message.clone())
            }
            DestroyOutcome::CallError(message) => {
                return Ok(DestroyResult {
                    instances: BTreeMap::new(),
                    error: Some(message.clone()),
                });
            }
            DestroyOutcome::Fail(message) => return Err(tool_failure(message)),
        };
        Ok(DestroyResult {
            instances: names
                .iter()
                .map(|name| (name.clone(), status.clone()))
                .collect(),
            error: None,
        })
    }
}
