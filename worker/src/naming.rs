// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Naming of the instances backing a build worker.

use rand::Rng;

/// Upper bound (inclusive) of the random suffix; only even values are drawn.
pub const MAX_SUFFIX: u32 = 10_000;

/// The build worker and the instance created for it.
///
/// Uniqueness of `instance_name` is probabilistic: two controllers for the
/// same worker may draw the same suffix.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceIdentity {
    pub worker_name: String,
    pub instance_name: String,
}

impl std::fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.instance_name, self.worker_name)
    }
}

pub struct InstanceNamer;

impl InstanceNamer {
    pub fn name(worker_name: &str) -> InstanceIdentity {
        Self::with_rng(worker_name, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng>(
        worker_name: &str,
        rng: &mut R,
    ) -> InstanceIdentity {
        let suffix = rng.gen_range(0..=MAX_SUFFIX / 2) * 2;
        InstanceIdentity {
            worker_name: worker_name.to_string(),
            instance_name: format!("{worker_name}-worker-rnd{suffix:04}"),
        }
    }
}
