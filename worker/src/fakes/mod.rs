// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fake implementations of the services a [`crate::LifecycleController`]
//! talks to.
//!
//! Each fake follows a script supplied by the test and records the calls it
//! receives, without touching salt, a cloud provider, or the network.

pub mod discovery;
pub mod provisioning;
pub mod remote_job;
pub mod scheduler;
