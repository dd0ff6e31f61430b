// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded-parallel execution of per-item workflows.

use slog::debug;
use slog::Logger;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Runs one invocation per item, at most `parallelism` at a time, on
/// distinct tokio tasks.
///
/// Invocations share nothing through the executor. Each returns its own
/// outcome (failures included), so one item failing neither cancels nor
/// delays the others, and the outcomes come back in input order.
pub struct BatchExecutor {
    log: Logger,
    parallelism: usize,
}

impl BatchExecutor {
    pub fn new(log: &Logger, parallelism: usize) -> BatchExecutor {
        BatchExecutor { log: log.clone(), parallelism: parallelism.max(1) }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Applies `f` to every item and waits for all invocations to finish.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of any invocation that panicked.
    pub async fn run<I, O, F, Fut>(&self, items: Vec<I>, f: F) -> Vec<O>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut,
        Fut: Future<Output = O> + Send + 'static,
    {
        let count = items.len();
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut set = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let invocation = f(item);
            set.spawn(async move {
                // Hold onto the permit until the invocation finishes.
                let permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                let output = invocation.await;
                drop(permit);
                (index, output)
            });
        }
        debug!(self.log, "dispatched batch";
            "items" => count, "parallelism" => self.parallelism);

        let mut outputs = Vec::with_capacity(count);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(output) => outputs.push(output),
                Err(e) if e.is_panic() => {
                    std::panic::resume_unwind(e.into_panic())
                }
                Err(e) => unreachable!("batch tasks are never aborted: {e}"),
            }
        }
        outputs.sort_by_key(|(index, _)| *index);
        outputs.into_iter().map(|(_, output)| output).collect()
    }
}
