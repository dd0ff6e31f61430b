// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Record of reversible side effects performed by a saga.

use crate::backends::DnsRecord;
use crate::backends::ObjectRef;
use crate::backends::SubnetId;
use crate::error::Error;
use crate::sagas::SagaContext;
use display_error_chain::DisplayErrorChain;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::net::IpAddr;

/// An action that reverses a completed forward step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compensation {
    /// Give a reserved (or registered) address back to the subnet.
    ReleaseAddress { address: IpAddr, subnet: SubnetId },
    RemoveDnsRecord { zone: String, record: DnsRecord },
    /// Power off and destroy a clone.
    DeprovisionNode { vm: ObjectRef, name: String },
}

/// Compensations of one saga invocation, in the order their forward steps
/// completed.
///
/// Entries are only recorded after the forward step is confirmed, and
/// [`CompensationLedger::unwind`] consumes the ledger so that no action is
/// ever replayed twice.
pub struct CompensationLedger {
    log: Logger,
    entries: Vec<Compensation>,
}

impl CompensationLedger {
    pub fn new(log: &Logger) -> CompensationLedger {
        CompensationLedger { log: log.clone(), entries: Vec::new() }
    }

    /// Appends a compensation. Recording one that is already present is a
    /// no-op, which keeps a second step touching the same resource from
    /// undoing it twice.
    pub fn record(&mut self, compensation: Compensation) {
        if self.entries.contains(&compensation) {
            debug!(self.log, "compensation already recorded";
                "compensation" => ?compensation);
            return;
        }
        debug!(self.log, "recorded compensation";
            "compensation" => ?compensation);
        self.entries.push(compensation);
    }

    pub fn entries(&self) -> &[Compensation] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replays every compensation in reverse order. A failing compensation is
    /// logged and does not stop the others; the failures are returned.
    pub async fn unwind(
        self,
        ctx: &SagaContext,
    ) -> Vec<(Compensation, Error)> {
        let log = self.log;
        let mut failures = Vec::new();
        for compensation in self.entries.into_iter().rev() {
            let result = match &compensation {
                Compensation::ReleaseAddress { address, subnet } => ctx
                    .backends
                    .addresses
                    .release_address(*address, *subnet)
                    .await
                    .map_err(Error::from),
                Compensation::RemoveDnsRecord { zone, record } => ctx
                    .backends
                    .dns
                    .remove_record(zone, record)
                    .await
                    .and_then(|status| status.into_result(zone))
                    .map_err(Error::from),
                Compensation::DeprovisionNode { vm, name } => {
                    ctx.deprovision(&log, vm, name).await
                }
            };
            match result {
                Ok(()) => {
                    info!(log, "compensated"; "compensation" => ?compensation);
                }
                Err(error) => {
                    warn!(log, "compensation failed";
                        "compensation" => ?compensation,
                        "error" => %DisplayErrorChain::new(&error));
                    failures.push((compensation, error));
                }
            }
        }
        failures
    }
}
