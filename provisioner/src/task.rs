// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracking of asynchronous compute-plane operations.
//!
//! Every mutation the compute plane performs (clone, reconfigure, customize,
//! power changes, destroy) hands back a task. [`TaskMonitor`] polls such a
//! task until it reaches a terminal state.

use crate::backends::ComputePlane;
use crate::backends::TaskId;
use crate::backends::TaskInfo;
use crate::backends::TaskResult;
use crate::backends::TaskState;
use crate::error::Error;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;

/// One in-flight compute-plane task and a label for reporting it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: TaskId,
    pub label: String,
}

impl TaskHandle {
    pub fn new(id: TaskId, label: impl Into<String>) -> TaskHandle {
        TaskHandle { id, label: label.into() }
    }
}

pub type TaskCallback = Box<dyn Fn(&TaskHandle, &TaskInfo) + Send + Sync>;

/// Progress hooks, each invoked once when the task is first observed in the
/// corresponding state.
#[derive(Default)]
pub struct TaskCallbacks {
    queued: Option<TaskCallback>,
    running: Option<TaskCallback>,
    success: Option<TaskCallback>,
    error: Option<TaskCallback>,
}

impl TaskCallbacks {
    pub fn on_queued<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskHandle, &TaskInfo) + Send + Sync + 'static,
    {
        self.queued = Some(Box::new(f));
        self
    }

    pub fn on_running<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskHandle, &TaskInfo) + Send + Sync + 'static,
    {
        self.running = Some(Box::new(f));
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskHandle, &TaskInfo) + Send + Sync + 'static,
    {
        self.success = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskHandle, &TaskInfo) + Send + Sync + 'static,
    {
        self.error = Some(Box::new(f));
        self
    }

    fn fire(&self, handle: &TaskHandle, info: &TaskInfo) {
        let callback = match info.state {
            TaskState::Queued => &self.queued,
            TaskState::Running => &self.running,
            TaskState::Success => &self.success,
            TaskState::Error => &self.error,
        };
        if let Some(callback) = callback {
            callback(handle, info);
        }
    }
}

/// Polls compute-plane tasks to completion.
#[derive(Clone)]
pub struct TaskMonitor {
    log: Logger,
    compute: Arc<dyn ComputePlane>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl TaskMonitor {
    /// With no `timeout` a task is polled for as long as it takes; callers
    /// wanting a deadline pass one here or wrap the wait themselves.
    pub fn new(
        log: &Logger,
        compute: Arc<dyn ComputePlane>,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> TaskMonitor {
        TaskMonitor { log: log.clone(), compute, poll_interval, timeout }
    }

    /// Returns a monitor that logs under `log`.
    pub fn with_log(&self, log: &Logger) -> TaskMonitor {
        TaskMonitor { log: log.clone(), ..self.clone() }
    }

    pub async fn wait(
        &self,
        handle: TaskHandle,
    ) -> Result<Option<TaskResult>, Error> {
        self.wait_with_callbacks(handle, &TaskCallbacks::default()).await
    }

    /// Waits for the task to finish, returning its result payload on success
    /// and `TaskFailure` when it ends in error or outlives the timeout.
    pub async fn wait_with_callbacks(
        &self,
        handle: TaskHandle,
        callbacks: &TaskCallbacks,
    ) -> Result<Option<TaskResult>, Error> {
        let log = self.log.new(o!(
            "task" => handle.label.clone(),
            "task_id" => handle.id.to_string(),
        ));
        let polling = self.poll_until_terminal(&log, &handle, callbacks);
        let info = match self.timeout {
            None => polling.await?,
            Some(timeout) => match tokio::time::timeout(timeout, polling).await
            {
                Ok(info) => info?,
                Err(_) => {
                    warn!(log, "task timed out"; "timeout" => ?timeout);
                    return Err(Error::TaskFailure {
                        label: handle.label,
                        cause: Some(format!("timed out after {timeout:?}")),
                    });
                }
            },
        };

        match info.state {
            TaskState::Success => Ok(info.result),
            _ => Err(Error::TaskFailure {
                label: handle.label,
                cause: info.error,
            }),
        }
    }

    async fn poll_until_terminal(
        &self,
        log: &Logger,
        handle: &TaskHandle,
        callbacks: &TaskCallbacks,
    ) -> Result<TaskInfo, Error> {
        let mut last_state = None;
        loop {
            let info = self.compute.poll_task(&handle.id).await?;
            if last_state != Some(info.state) {
                debug!(log, "task state changed"; "state" => ?info.state);
                callbacks.fire(handle, &info);
                last_state = Some(info.state);
            }
            if info.state.is_terminal() {
                return Ok(info);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
