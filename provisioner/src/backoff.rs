// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retry policies for collaborator calls that may fail transiently.

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Backoff policy for a collaborator request that should be attempted at
/// most `attempts` times in total.
pub fn retry_policy_attempts(attempts: u32) -> LimitedBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(250);
    const MAX_INTERVAL: Duration = Duration::from_secs(5);
    LimitedBackoff {
        inner: policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL),
        remaining: attempts.saturating_sub(1),
    }
}

fn policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
) -> ::backoff::ExponentialBackoff {
    let current_interval = initial_interval;
    ::backoff::ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time: None,
        ..::backoff::ExponentialBackoff::default()
    }
}

/// Exponential backoff that gives up after a fixed number of retries.
pub struct LimitedBackoff {
    inner: ExponentialBackoff,
    remaining: u32,
}

impl Backoff for LimitedBackoff {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.inner.next_backoff()
    }
}
