// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Callback into the host's demand scheduler.
pub trait SlotNotifier: Send + Sync {
    /// Tells the scheduler that `worker_name` may be substantiated again.
    ///
    /// Must not block; the host is expected to queue whatever work this
    /// triggers.
    fn notify_slot_free(&self, worker_name: &str);
}
