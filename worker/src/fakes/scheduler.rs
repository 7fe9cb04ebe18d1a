// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::scheduler::SlotNotifier;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::time::Instant;

/// A [`SlotNotifier`] that remembers every notification and when it
/// arrived.
pub struct RecordingSlotNotifier {
    notifications: Mutex<Vec<(String, Instant)>>,
}

impl RecordingSlotNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { notifications: Mutex::new(Vec::new()) })
    }

    /// Worker names notified so far, in order.
    pub fn notified(&self) -> Vec<String> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn notified_at(&self) -> Vec<Instant> {
        self.notifications.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

impl SlotNotifier for RecordingSlotNotifier {
    fn notify_slot_free(&self, worker_name: &str) {
        self.notifications
            .lock()
            .unwrap()
            .push((worker_name.to_string(), Instant::now()));
    }
}
