// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling a condition until it holds or a ceiling is reached.

use std::future::Future;
use std::time::Duration;
use std::time::Instant;

/// Result of one check of a condition.
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// The condition does not hold yet; check again after the interval.
    NotYet,
    /// The condition can never hold; stop polling.
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(error: E) -> Self {
        CondCheckError::Failed(error)
    }
}

/// How long [`wait_for_condition`] keeps checking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ceiling {
    Unbounded,
    Elapsed(Duration),
    Attempts(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("condition not met after {0} attempts")]
    AttemptsExhausted(usize),
    #[error("permanent error")]
    PermanentError(#[source] E),
}

/// Checks `cond` every `poll_interval` until it succeeds, fails permanently,
/// or `ceiling` is reached.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    ceiling: Ceiling,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let start = Instant::now();
    let mut attempts = 0;
    loop {
        attempts += 1;
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::NotYet) => (),
        }

        match ceiling {
            Ceiling::Attempts(max) if attempts >= max => {
                return Err(Error::AttemptsExhausted(attempts));
            }
            Ceiling::Elapsed(max) if start.elapsed() >= max => {
                return Err(Error::TimedOut(start.elapsed()));
            }
            _ => (),
        }

        tokio::time::sleep(*poll_interval).await;
    }
}
