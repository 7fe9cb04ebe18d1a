// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the service that creates and destroys instances.

use crate::config::WorkerCredential;
use crate::resolver::ConfigSnapshot;
use crate::resolver::Profile;
use saltcloud_worker_common::process::ExecutionError;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Settings injected into the minion of every new instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MinionDirectives {
    /// Address the minion should use to reach the salt master.
    pub master: String,
    pub worker_name: String,
    pub worker_password: WorkerCredential,
}

/// Everything needed to create one instance. Built per attempt.
#[derive(Clone, Debug)]
pub struct ProvisioningRequest {
    pub profile_name: String,
    pub instance_name: String,
    pub directives: MinionDirectives,
}

impl ProvisioningRequest {
    /// The profile's settings with the minion directives merged into its
    /// `minion` section. Existing minion settings are kept unless a
    /// directive overrides them.
    pub fn profile_settings(&self, profile: &Profile) -> Map<String, Value> {
        let mut settings = profile.settings().clone();
        let mut minion = match settings.remove("minion") {
            Some(Value::Object(minion)) => minion,
            _ => Map::new(),
        };
        minion.insert(
            "master".to_string(),
            Value::String(self.directives.master.clone()),
        );
        let mut grains = match minion.remove("grains") {
            Some(Value::Object(grains)) => grains,
            _ => Map::new(),
        };
        grains.insert(
            "buildworker".to_string(),
            json!({
                "name": self.directives.worker_name,
                "password": self.directives.worker_password.expose(),
            }),
        );
        minion.insert("grains".to_string(), Value::Object(grains));
        settings.insert("minion".to_string(), Value::Object(minion));
        settings
    }
}

/// Per-instance outcome of a create call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceStatus {
    /// Whatever the service reported about the instance.
    pub details: Value,
    /// Errors the service reported for this instance without failing the
    /// call.
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisioningResult {
    pub instances: BTreeMap<String, InstanceStatus>,
    /// An error reported for the call as a whole.
    pub error: Option<String>,
}

impl ProvisioningResult {
    /// Returns a description of why the creation of `name` should be
    /// considered failed, even though the call itself returned normally.
    pub fn embedded_error(&self, name: &str) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        match self.instances.get(name) {
            None if self.instances.is_empty() => {
                Some(String::from("provisioning service returned no result"))
            }
            None => Some(format!("no result reported for instance {name}")),
            Some(status) if !status.errors.is_empty() => {
                Some(status.errors.join("; "))
            }
            Some(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DestroyStatus {
    Destroyed,
    /// The service does not know the instance.
    Absent,
    Failed(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DestroyResult {
    pub instances: BTreeMap<String, DestroyStatus>,
    /// An error reported for the call as a whole, or for a provider
    /// without naming the instances.
    pub error: Option<String>,
}

impl DestroyResult {
    /// The outcome for `name`. A name the service did not mention is
    /// absent, unless the call reported an error: then nothing is known
    /// about it and it counts as failed.
    pub fn status(&self, name: &str) -> DestroyStatus {
        match (self.instances.get(name), &self.error) {
            (Some(status), _) => status.clone(),
            (None, Some(error)) => DestroyStatus::Failed(error.clone()),
            (None, None) => DestroyStatus::Absent,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("failed to run the provisioning tool")]
    Execution(#[from] ExecutionError),

    #[error("failed to write private configuration for the provisioning tool")]
    PrivateFiles(#[source] std::io::Error),

    #[error("unexpected output from the provisioning tool: {reason}")]
    Parse { reason: String },
}

/// Create and destroy instances.
///
/// Neither call is idempotent at the provider: callers must not repeat a
/// create for the same name within one attempt.
#[async_trait::async_trait]
pub trait ProvisioningApi: Send + Sync {
    async fn create(
        &self,
        config: &ConfigSnapshot,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResult, ProvisioningError>;

    async fn destroy(
        &self,
        config: &ConfigSnapshot,
        names: &BTreeSet<String>,
    ) -> Result<DestroyResult, ProvisioningError>;
}
