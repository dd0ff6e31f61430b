// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-instance sagas.
//!
//! [`instance_create`] provisions one instance and compensates its side
//! effects on failure; [`instance_destroy`] tears one down, tolerating
//! partial failure when forced. [`instance_power`] changes the power state
//! of one existing instance.

use crate::backends::Backends;
use crate::backends::ObjectRef;
use crate::backends::PowerState;
use crate::backends::TaskId;
use crate::backends::TaskResult;
use crate::config::Config;
use crate::error::Error;
use crate::task::TaskHandle;
use crate::task::TaskMonitor;
use slog::info;
use slog::Logger;
use std::sync::Arc;

pub mod instance_create;
pub mod instance_destroy;
pub mod instance_power;

/// Everything a saga invocation needs, captured once and shared read-only by
/// every concurrent invocation.
pub struct SagaContext {
    pub log: Logger,
    pub config: Arc<Config>,
    pub backends: Backends,
    pub tasks: TaskMonitor,
}

impl SagaContext {
    pub fn new(
        log: &Logger,
        config: Arc<Config>,
        backends: Backends,
    ) -> SagaContext {
        let tasks = TaskMonitor::new(
            log,
            backends.compute.clone(),
            config.orchestrator.task_poll_interval(),
            config.orchestrator.task_timeout(),
        );
        SagaContext { log: log.clone(), config, backends, tasks }
    }

    /// Waits for a compute-plane task started on behalf of `log`'s instance.
    pub(crate) async fn run_task(
        &self,
        log: &Logger,
        id: TaskId,
        label: String,
    ) -> Result<Option<TaskResult>, Error> {
        self.tasks.with_log(log).wait(TaskHandle::new(id, label)).await
    }

    /// Powers the instance off if it is on, then destroys it.
    pub(crate) async fn deprovision(
        &self,
        log: &Logger,
        vm: &ObjectRef,
        name: &str,
    ) -> Result<(), Error> {
        let compute = &self.backends.compute;
        if compute.power_state(vm).await? == PowerState::PoweredOn {
            let task = compute.power_off(vm).await?;
            self.run_task(log, task, format!("power off {name}")).await?;
        }
        let task = compute.destroy(vm).await?;
        self.run_task(log, task, format!("destroy {name}")).await?;
        info!(log, "destroyed instance"; "vm" => %vm);
        Ok(())
    }
}
