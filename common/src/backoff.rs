// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations a bounded number of
//! times.
//!
//! The remote operations driven by the provisioner are retried against fixed
//! attempt budgets rather than against an elapsed-time limit, so the policies
//! here never give up on their own. Callers count attempts and return
//! [`BackoffError::permanent`] once their budget is spent; see
//! [`AttemptBudget`].

use std::time::Duration;

pub use ::backoff::future::retry_notify;
pub use ::backoff::Error as BackoffError;

/// Return a policy that waits `interval` between every attempt.
pub fn retry_policy_fixed(interval: Duration) -> ::backoff::ExponentialBackoff {
    ::backoff::ExponentialBackoff {
        current_interval: interval,
        initial_interval: interval,
        randomization_factor: 0.0,
        multiplier: 1.0,
        max_interval: interval,
        max_elapsed_time: None,
        ..::backoff::ExponentialBackoff::default()
    }
}

/// Return a short exponential policy for querying services outside of our
/// control (e.g., address discovery), starting at `initial_interval`.
pub fn retry_policy_short(
    initial_interval: Duration,
) -> ::backoff::ExponentialBackoff {
    const MAX_INTERVAL: Duration = Duration::from_secs(10);
    ::backoff::ExponentialBackoff {
        current_interval: initial_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval: MAX_INTERVAL.max(initial_interval),
        max_elapsed_time: None,
        ..::backoff::ExponentialBackoff::default()
    }
}

/// Counts attempts made against a fixed budget.
///
/// Used from inside a [`retry_notify`] operation to turn a transient error
/// into a permanent one once the budget is exhausted.
#[derive(Debug)]
pub struct AttemptBudget {
    max: u32,
    made: u32,
}

impl AttemptBudget {
    pub fn new(max: u32) -> Self {
        Self { max: max.max(1), made: 0 }
    }

    /// Records a new attempt and returns its 1-based number.
    pub fn start_attempt(&mut self) -> u32 {
        self.made += 1;
        self.made
    }

    /// Number of attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.made
    }

    pub fn is_exhausted(&self) -> bool {
        self.made >= self.max
    }

    /// Classifies a failed attempt: transient while attempts remain,
    /// permanent afterwards.
    pub fn classify<E>(&self, err: E) -> BackoffError<E> {
        if self.is_exhausted() {
            BackoffError::permanent(err)
        } else {
            BackoffError::transient(err)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_budget_stops_after_max_attempts() {
        let budget = Mutex::new(AttemptBudget::new(3));
        let notified = Mutex::new(0);
        let result: Result<(), &str> = retry_notify(
            retry_policy_fixed(Duration::from_secs(1)),
            || async {
                let mut budget = budget.lock().unwrap();
                budget.start_attempt();
                Err(budget.classify("nope"))
            },
            |_, _| *notified.lock().unwrap() += 1,
        )
        .await;

        assert_eq!(result, Err("nope"));
        assert_eq!(budget.lock().unwrap().attempts(), 3);
        // Every failure except the last one is followed by a retry.
        assert_eq!(*notified.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_success_after_failures() {
        let budget = Mutex::new(AttemptBudget::new(5));
        let result: Result<u32, &str> = retry_notify(
            retry_policy_fixed(Duration::from_millis(100)),
            || async {
                let mut budget = budget.lock().unwrap();
                let attempt = budget.start_attempt();
                if attempt < 3 {
                    Err(budget.classify("not yet"))
                } else {
                    Ok(attempt)
                }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_zero_budget_allows_one_attempt() {
        let mut budget = AttemptBudget::new(0);
        assert!(!budget.is_exhausted());
        budget.start_attempt();
        assert!(budget.is_exhausted());
    }
}
