// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power-state changes of existing instances.
//!
//! Each action is a single compute-plane task, so a failure leaves nothing
//! to compensate.

use super::SagaContext;
use crate::backends::InstanceInfo;
use crate::backends::PowerState;
use crate::error::Error;
use crate::instance::PowerAction;
use crate::instance::PowerOutcome;
use crate::instance::PowerStatus;
use crate::instance::RestartMethod;
use display_error_chain::DisplayErrorChain;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;

/// Applies `action` to `target`. Never fails: the outcome carries the status
/// and any error.
pub async fn power_instance(
    ctx: &SagaContext,
    target: InstanceInfo,
    action: PowerAction,
) -> PowerOutcome {
    let log = ctx.log.new(o!(
        "saga" => "instance-power",
        "instance" => target.name.clone(),
        "action" => format!("{action:?}"),
    ));

    let result = match action {
        PowerAction::PowerOn => {
            set_power_state(ctx, &log, &target, PowerState::PoweredOn)
                .await
                .map(|status| (status, None))
        }
        PowerAction::PowerOff => {
            set_power_state(ctx, &log, &target, PowerState::PoweredOff)
                .await
                .map(|status| (status, None))
        }
        PowerAction::Restart => restart(ctx, &log, &target)
            .await
            .map(|method| (PowerStatus::Done, Some(method))),
    };

    match result {
        Ok((status, restart)) => PowerOutcome {
            target,
            action,
            status,
            restart,
            error: None,
        },
        Err(error) => {
            error!(log, "power state change failed";
                "error" => %DisplayErrorChain::new(&error));
            PowerOutcome {
                target,
                action,
                status: PowerStatus::Error,
                restart: None,
                error: Some(error),
            }
        }
    }
}

async fn set_power_state(
    ctx: &SagaContext,
    log: &Logger,
    target: &InstanceInfo,
    wanted: PowerState,
) -> Result<PowerStatus, Error> {
    let compute = &ctx.backends.compute;
    let vm = &target.vm;
    if compute.power_state(vm).await? == wanted {
        info!(log, "instance already in requested state";
            "state" => ?wanted);
        return Ok(PowerStatus::Unchanged);
    }
    let (task, label) = match wanted {
        PowerState::PoweredOn => {
            (compute.power_on(vm).await?, format!("power on {}", target.name))
        }
        PowerState::PoweredOff | PowerState::Suspended => (
            compute.power_off(vm).await?,
            format!("power off {}", target.name),
        ),
    };
    ctx.run_task(log, task, label).await?;
    info!(log, "power state changed"; "state" => ?wanted);
    Ok(PowerStatus::Done)
}

/// Asks the guest to reboot; when it cannot (no guest tools, guest hung,
/// instance off) the instance is reset instead.
async fn restart(
    ctx: &SagaContext,
    log: &Logger,
    target: &InstanceInfo,
) -> Result<RestartMethod, Error> {
    let compute = &ctx.backends.compute;
    match compute.reboot_guest(&target.vm).await {
        Ok(()) => {
            info!(log, "guest reboot requested");
            return Ok(RestartMethod::GuestReboot);
        }
        Err(e) => {
            warn!(log, "guest reboot refused, resetting";
                "error" => %DisplayErrorChain::new(&e));
        }
    }
    let task = compute.reset(&target.vm).await?;
    ctx.run_task(log, task, format!("reset {}", target.name)).await?;
    info!(log, "instance reset");
    Ok(RestartMethod::Reset)
}
