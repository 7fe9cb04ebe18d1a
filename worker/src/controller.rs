// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The provisioning lifecycle of one latent build worker.
//!
//! A [`LifecycleController`] moves through
//!
//! ```text
//! Idle -> Provisioning -> AwaitingConvergence -> Ready -> TearingDown -> Idle
//! ```
//!
//! Any failure during substantiation returns the controller to `Idle`,
//! destroying the instance on the way if its creation was requested.

use crate::config::Config;
use crate::config::DiscoveryConfig;
use crate::config::WorkerConfig;
use crate::convergence::ConvergenceDriver;
use crate::convergence::ConvergenceError;
use crate::highstate::HighstateResult;
use crate::naming::InstanceIdentity;
use crate::naming::InstanceNamer;
use crate::provisioning::DestroyStatus;
use crate::provisioning::MinionDirectives;
use crate::provisioning::ProvisioningApi;
use crate::provisioning::ProvisioningError;
use crate::provisioning::ProvisioningRequest;
use crate::reachability::AddressDiscovery;
use crate::reachability::DiscoveryError;
use crate::reachability::HttpAddressDiscovery;
use crate::reachability::ReachabilityError;
use crate::reachability::ReachabilityResolver;
use crate::remote_job::RemoteJobApi;
use crate::resolver::ConfigError;
use crate::resolver::ConfigResolver;
use crate::salt_cli::SaltCli;
use crate::salt_cloud::SaltCloud;
use crate::scheduler::SlotNotifier;
use crate::LatentWorker;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Where the controller runs its work, owned by the host process.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    handle: tokio::runtime::Handle,
}

impl ExecutionContext {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

/// The services a controller depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub provisioning: Arc<dyn ProvisioningApi>,
    pub jobs: Arc<dyn RemoteJobApi>,
    pub discovery: Arc<dyn AddressDiscovery>,
    pub scheduler: Arc<dyn SlotNotifier>,
}

impl Collaborators {
    /// Collaborators that drive the salt command-line tools.
    pub fn salt(
        log: &Logger,
        config: &Config,
        scheduler: Arc<dyn SlotNotifier>,
    ) -> Result<Self, DiscoveryError> {
        Ok(Self {
            provisioning: Arc::new(SaltCloud::new(log)),
            jobs: Arc::new(SaltCli::new(log, &config.salt, &config.tunables)),
            discovery: Arc::new(HttpAddressDiscovery::new(
                config.discovery.url.clone(),
            )?),
            scheduler,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ControllerState {
    Idle,
    Provisioning,
    AwaitingConvergence,
    Ready,
    TearingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum SubstantiationFailure {
    #[error("failed to resolve salt configuration")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Reachability(#[from] ReachabilityError),

    #[error("failed to create instance")]
    Provisioning(#[from] ProvisioningError),

    #[error("provisioning reported an error: {0}")]
    Embedded(String),

    #[error(transparent)]
    Convergence(#[from] ConvergenceError),

    #[error("substantiation was cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to substantiate {instance_name}")]
pub struct SubstantiationError {
    pub instance_name: String,
    #[source]
    pub cause: SubstantiationFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error("failed to resolve salt configuration")]
    Config(#[from] ConfigError),

    #[error("failed to destroy {instance_name}")]
    Destroy {
        instance_name: String,
        #[source]
        err: ProvisioningError,
    },

    #[error("failed to destroy {instance_name}: {message}")]
    Embedded { instance_name: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot {operation} a worker that is {state}")]
    InvalidState { operation: &'static str, state: ControllerState },

    #[error("cannot {operation} while the worker is {state}")]
    Busy { operation: &'static str, state: ControllerState },

    #[error(transparent)]
    Substantiation(#[from] SubstantiationError),

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error("controller task failed")]
    TaskFailed(#[source] tokio::task::JoinError),
}

/// Creates, converges and destroys the instance behind one worker slot.
pub struct LifecycleController {
    inner: Arc<Inner>,
}

struct Inner {
    log: Logger,
    worker: WorkerConfig,
    identity: InstanceIdentity,
    resolver: Arc<ConfigResolver>,
    discovery: DiscoveryConfig,
    collaborators: Collaborators,
    exec: ExecutionContext,
    state: Mutex<ControllerState>,
    cancel: watch::Sender<bool>,
}

impl LifecycleController {
    /// Names the worker's instance. The name is kept for the lifetime of
    /// the controller.
    pub fn new(
        log: &Logger,
        config: &Config,
        collaborators: Collaborators,
        exec: ExecutionContext,
    ) -> Self {
        let identity = InstanceNamer::name(&config.worker.name);
        let log = log.new(o!(
            "component" => "LifecycleController",
            "worker" => identity.worker_name.clone(),
            "instance" => identity.instance_name.clone(),
        ));
        let resolver = Arc::new(ConfigResolver::new(
            config.salt.clone(),
            config.worker.profile.clone(),
            config.tunables.clone(),
        ));
        let (cancel, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                log,
                worker: config.worker.clone(),
                identity,
                resolver,
                discovery: config.discovery.clone(),
                collaborators,
                exec,
                state: Mutex::new(ControllerState::Idle),
                cancel,
            }),
        }
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> ControllerState {
        *self.inner.state.lock().unwrap()
    }

    /// Whether the host should retire the worker after one build.
    pub fn single_build(&self) -> bool {
        self.inner.resolver.tunables().single_build
    }

    /// Creates the worker's instance and waits for it to converge.
    ///
    /// On failure the instance has been torn down (or at least that was
    /// attempted) before this returns.
    pub async fn substantiate(&self) -> Result<InstanceIdentity, Error> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != ControllerState::Idle {
                return Err(Error::InvalidState {
                    operation: "substantiate",
                    state: *state,
                });
            }
            *state = ControllerState::Provisioning;
            self.inner.cancel.send_replace(false);
        }

        let inner = Arc::clone(&self.inner);
        let task = self.inner.exec.spawn(async move {
            inner.substantiate_attempt().await
        });
        match task.await {
            Ok(result) => result.map_err(Error::from),
            Err(err) => {
                self.inner.set_state(ControllerState::Idle);
                Err(Error::TaskFailed(err))
            }
        }
    }

    /// Destroys the worker's instance and frees its slot.
    ///
    /// `fast` is accepted for compatibility with the host and does not
    /// change anything: teardown is always a full destroy.
    pub async fn insubstantiate(&self, fast: bool) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                ControllerState::Idle | ControllerState::Ready => {
                    *state = ControllerState::TearingDown;
                }
                ControllerState::Provisioning
                | ControllerState::AwaitingConvergence
                | ControllerState::TearingDown => {
                    warn!(
                        self.inner.log, "rejecting racing insubstantiate";
                        "state" => %*state,
                    );
                    return Err(Error::Busy {
                        operation: "insubstantiate",
                        state: *state,
                    });
                }
            }
        }

        info!(self.inner.log, "insubstantiating"; "fast" => fast);
        let inner = Arc::clone(&self.inner);
        let task = self.inner.exec.spawn(async move {
            let result = inner.destroy_instance().await;
            inner.schedule_slot_free();
            inner.set_state(ControllerState::Idle);
            result
        });
        match task.await {
            Ok(result) => result.map_err(Error::from),
            Err(err) => {
                self.inner.set_state(ControllerState::Idle);
                Err(Error::TaskFailed(err))
            }
        }
    }

    /// Aborts an in-flight substantiation at its next wait.
    ///
    /// The aborted substantiation still tears down its instance.
    pub fn cancel(&self) {
        let state = self.inner.state.lock().unwrap();
        if matches!(
            *state,
            ControllerState::Provisioning | ControllerState::AwaitingConvergence
        ) {
            info!(
                self.inner.log, "cancelling substantiation";
                "state" => %*state,
            );
            self.inner.cancel.send_replace(true);
        }
    }
}

#[async_trait::async_trait]
impl LatentWorker for LifecycleController {
    async fn substantiate(&self) -> Result<InstanceIdentity, Error> {
        LifecycleController::substantiate(self).await
    }

    async fn insubstantiate(&self, fast: bool) -> Result<(), Error> {
        LifecycleController::insubstantiate(self, fast).await
    }
}

impl Inner {
    fn set_state(&self, next: ControllerState) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            info!(self.log, "state change"; "from" => %*state, "to" => %next);
            *state = next;
        }
    }

    async fn substantiate_attempt(
        &self,
    ) -> Result<InstanceIdentity, SubstantiationError> {
        info!(self.log, "substantiating");
        let create_attempted = AtomicBool::new(false);
        let mut cancelled = self.cancel.subscribe();

        let outcome = tokio::select! {
            result = self.provision_and_converge(&create_attempted) => result,
            _ = cancelled.wait_for(|cancelled| *cancelled) => {
                Err(SubstantiationFailure::Cancelled)
            }
        };

        match outcome {
            Ok(result) => {
                info!(
                    self.log, "worker ready";
                    "steps" => result.steps.len(),
                );
                self.set_state(ControllerState::Ready);
                Ok(self.identity.clone())
            }
            Err(cause) => {
                error!(
                    self.log, "substantiation failed";
                    "error" => %cause,
                );
                if create_attempted.load(Ordering::SeqCst) {
                    self.set_state(ControllerState::TearingDown);
                    if let Err(err) = self.destroy_instance().await {
                        warn!(
                            self.log, "teardown after failure did not succeed";
                            "error" => %err,
                        );
                    }
                }
                self.set_state(ControllerState::Idle);
                Err(SubstantiationError {
                    instance_name: self.identity.instance_name.clone(),
                    cause,
                })
            }
        }
    }

    async fn provision_and_converge(
        &self,
        create_attempted: &AtomicBool,
    ) -> Result<HighstateResult, SubstantiationFailure> {
        let config = self.resolver.resolve_blocking().await?;

        let reachability = ReachabilityResolver::new(
            &self.log,
            Arc::clone(&self.collaborators.discovery),
            &self.discovery,
        );
        let master =
            reachability.resolve_master_address(config.profile()).await?;

        let request = ProvisioningRequest {
            profile_name: config.profile_name().to_string(),
            instance_name: self.identity.instance_name.clone(),
            directives: MinionDirectives {
                master,
                worker_name: self.worker.name.clone(),
                worker_password: self.worker.password.clone(),
            },
        };
        info!(
            self.log, "creating instance";
            "profile" => &request.profile_name,
            "master" => &request.directives.master,
        );
        create_attempted.store(true, Ordering::SeqCst);
        let created =
            self.collaborators.provisioning.create(&config, &request).await?;
        if let Some(message) = created.embedded_error(&request.instance_name) {
            return Err(SubstantiationFailure::Embedded(message));
        }

        self.set_state(ControllerState::AwaitingConvergence);
        tokio::time::sleep(config.tunables().settle_delay).await;

        let driver = ConvergenceDriver::new(
            &self.log,
            Arc::clone(&self.collaborators.jobs),
            config.tunables().clone(),
        );
        Ok(driver.converge(&self.identity.instance_name).await?)
    }

    async fn destroy_instance(&self) -> Result<(), TeardownError> {
        let config = self.resolver.resolve_blocking().await?;
        let name = &self.identity.instance_name;
        let names = BTreeSet::from([name.clone()]);

        let result = self
            .collaborators
            .provisioning
            .destroy(&config, &names)
            .await
            .map_err(|err| {
                warn!(self.log, "failed to destroy instance"; "error" => %err);
                TeardownError::Destroy { instance_name: name.clone(), err }
            })?;

        match result.status(name) {
            DestroyStatus::Destroyed => {
                info!(self.log, "instance destroyed");
                Ok(())
            }
            DestroyStatus::Absent => {
                info!(self.log, "instance already absent");
                Ok(())
            }
            DestroyStatus::Failed(message) => {
                warn!(
                    self.log, "provisioning reported a destroy error";
                    "error" => &message,
                );
                Err(TeardownError::Embedded {
                    instance_name: name.clone(),
                    message,
                })
            }
        }
    }

    fn schedule_slot_free(&self) {
        let delay: Duration = self.resolver.tunables().slot_free_delay;
        let scheduler = Arc::clone(&self.collaborators.scheduler);
        let worker_name = self.worker.name.clone();
        let log = self.log.clone();
        self.exec.spawn(async move {
            tokio::time::sleep(delay).await;
            info!(log, "notifying scheduler that the slot is free");
            scheduler.notify_slot_free(&worker_name);
        });
    }
}
