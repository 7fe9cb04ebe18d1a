// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-demand build workers backed by instances that salt-cloud creates.
//!
//! A build-orchestration host owns one [`LifecycleController`] per worker
//! slot and drives it through the [`LatentWorker`] interface: substantiate
//! the worker when a build needs it, insubstantiate it when it is done.
//! Substantiating creates an instance from a salt-cloud profile, runs a
//! highstate on it, and only reports the worker ready once that highstate
//! succeeded.

pub mod config;
pub mod controller;
pub mod convergence;
pub mod fakes;
pub mod highstate;
pub mod naming;
pub mod provisioning;
pub mod reachability;
pub mod remote_job;
pub mod resolver;
pub mod salt_cli;
pub mod salt_cloud;
pub mod scheduler;

pub use config::Config;
pub use controller::Collaborators;
pub use controller::ControllerState;
pub use controller::Error;
pub use controller::ExecutionContext;
pub use controller::LifecycleController;
pub use naming::InstanceIdentity;

/// What the host needs from a latent worker.
#[async_trait::async_trait]
pub trait LatentWorker: Send + Sync {
    /// Brings the worker's instance into existence and readies it for
    /// builds.
    async fn substantiate(&self) -> Result<InstanceIdentity, Error>;

    /// Tears the worker's instance down.
    async fn insubstantiate(&self, fast: bool) -> Result<(), Error>;
}
