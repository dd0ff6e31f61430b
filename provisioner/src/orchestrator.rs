// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Batch provisioning and decommissioning.
//!
//! Creating a batch runs three separate passes over every instance: create,
//! wait for reachability, then bootstrap. Each pass finishes for the whole
//! batch before the next starts, which keeps the load on the compute plane
//! predictable. Decommissioning and power changes are a single pass.

use crate::backends::Backends;
use crate::backends::DnsRecord;
use crate::backends::InstanceFilter;
use crate::backends::InstanceInfo;
use crate::backends::InstanceLookup;
use crate::batch::BatchExecutor;
use crate::config::Config;
use crate::error::BootstrapError;
use crate::error::Error;
use crate::instance::BatchReport;
use crate::instance::CreateOutcome;
use crate::instance::CreateStatus;
use crate::instance::DestroyOutcome;
use crate::instance::InstanceSpec;
use crate::instance::PowerAction;
use crate::instance::PowerOutcome;
use crate::plan;
use crate::plan::CreateRequest;
use crate::readiness::Prober;
use crate::readiness::ReadinessPoller;
use crate::replicas::allocate_replicas;
use crate::sagas::instance_create::bootstrap_instance;
use crate::sagas::instance_create::create_instance;
use crate::sagas::instance_destroy::destroy_instance;
use crate::sagas::instance_destroy::StepPolicy;
use crate::sagas::instance_power::power_instance;
use crate::sagas::SagaContext;
use display_error_chain::DisplayErrorChain;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

pub struct Provisioner {
    log: Logger,
    ctx: Arc<SagaContext>,
    prober: Arc<dyn Prober>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner").finish_non_exhaustive()
    }
}

impl Provisioner {
    /// `config` is fixed for the lifetime of the provisioner and shared by
    /// every saga it runs.
    pub fn new(
        log: &Logger,
        config: Config,
        backends: Backends,
        prober: Arc<dyn Prober>,
    ) -> Provisioner {
        let ctx = SagaContext::new(log, Arc::new(config), backends);
        Provisioner { log: log.clone(), ctx: Arc::new(ctx), prober }
    }

    /// Like [`Provisioner::new`], logging wherever `config.log` says.
    pub fn from_config(
        name: &'static str,
        config: Config,
        backends: Backends,
        prober: Arc<dyn Prober>,
    ) -> Result<Provisioner, Error> {
        let log = config.log.to_logger(name).map_err(|error| {
            Error::Configuration(DisplayErrorChain::new(&error).to_string())
        })?;
        Ok(Provisioner::new(&log, config, backends, prober))
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    fn executor(&self) -> BatchExecutor {
        BatchExecutor::new(&self.log, self.ctx.config.orchestrator.parallelism)
    }

    /// Resolves `request` and names its replicas so they don't collide with
    /// instances that already exist.
    pub async fn plan_instances(
        &self,
        request: &CreateRequest,
    ) -> Result<Vec<InstanceSpec>, Error> {
        let plan = plan::resolve(&self.ctx.config, request)?;
        let filter =
            InstanceFilter { name_contains: Some(plan.base_name.clone()) };
        let existing: BTreeSet<String> = self
            .ctx
            .backends
            .compute
            .list_instances(&filter)
            .await?
            .into_iter()
            .map(|instance| instance.name)
            .collect();
        let names = allocate_replicas(
            &plan.base_name,
            &plan.base_hostname,
            &existing,
            plan.replicas,
            self.ctx.config.orchestrator.zero_pad_replicas,
        );
        Ok(plan.instances(&names))
    }

    /// Checks that hold for the whole batch; a violation fails the batch
    /// before anything is dispatched.
    fn check_batch(&self, specs: &[InstanceSpec]) -> Result<(), Error> {
        for spec in specs {
            if spec.storage.is_none() {
                return Err(Error::Configuration(format!(
                    "no datastore or datastore cluster set for {}",
                    spec.name
                )));
            }
            if spec.bootstrap.is_some() && self.ctx.backends.bootstrap.is_none()
            {
                return Err(Error::Configuration(format!(
                    "{} requests bootstrap but no bootstrapper is configured",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    /// Provisions every instance in `specs`, returning one outcome per spec
    /// in the same order.
    pub async fn create_instances(
        &self,
        specs: Vec<InstanceSpec>,
    ) -> Result<BatchReport<CreateOutcome>, Error> {
        self.check_batch(&specs)?;
        let executor = self.executor();
        let wants_bootstrap = specs.iter().any(|s| s.bootstrap.is_some());

        info!(self.log, "creating instances"; "count" => specs.len());
        let ctx = Arc::clone(&self.ctx);
        let outcomes = executor
            .run(specs, move |spec| {
                let ctx = Arc::clone(&ctx);
                async move {
                    match create_instance(&ctx, &spec).await {
                        Ok(provisioned) => CreateOutcome {
                            spec,
                            network: Some(provisioned.network),
                            vm: Some(provisioned.vm),
                            status: CreateStatus::Created,
                            error: None,
                            readiness_error: None,
                            bootstrap_error: None,
                        },
                        Err(error) => CreateOutcome::failed(spec, error),
                    }
                }
            })
            .await;

        info!(self.log, "waiting for instances to become reachable");
        let orchestrator = &self.ctx.config.orchestrator;
        let poller = Arc::new(ReadinessPoller::new(
            &self.log,
            Arc::clone(&self.prober),
            orchestrator.readiness_interval(),
            orchestrator.readiness_max_attempts,
        ));
        let log = self.log.clone();
        let outcomes = executor
            .run(outcomes, move |mut outcome| {
                let poller = Arc::clone(&poller);
                let log = log.clone();
                async move {
                    if outcome.status != CreateStatus::Created {
                        return outcome;
                    }
                    if let Err(error) = poller.wait(outcome.address()).await {
                        warn!(log, "instance is not reachable";
                            "instance" => &outcome.spec.name,
                            "error" => %error);
                        outcome.readiness_error = Some(error);
                    }
                    outcome
                }
            })
            .await;

        let outcomes = if wants_bootstrap {
            info!(self.log, "bootstrapping instances");
            let ctx = Arc::clone(&self.ctx);
            executor
                .run(outcomes, move |outcome| {
                    let ctx = Arc::clone(&ctx);
                    async move { bootstrap_outcome(&ctx, outcome).await }
                })
                .await
        } else {
            outcomes
        };

        let report = BatchReport { outcomes };
        for outcome in report.outcomes.iter().filter(|o| o.is_failure()) {
            let error = outcome
                .error
                .as_ref()
                .or(outcome.bootstrap_error.as_ref())
                .or(outcome.readiness_error.as_ref());
            if let Some(error) = error {
                error!(self.log, "instance failed";
                    "instance" => &outcome.spec.name,
                    "status" => ?outcome.status,
                    "error" => %DisplayErrorChain::new(error));
            }
        }
        Ok(report)
    }

    /// Decommissions every instance in `targets`, returning one outcome per
    /// target in the same order.
    pub async fn destroy_instances(
        &self,
        targets: Vec<InstanceInfo>,
        forced: bool,
    ) -> BatchReport<DestroyOutcome> {
        info!(self.log, "destroying instances";
            "count" => targets.len(), "forced" => forced);
        let policy = StepPolicy { forced };
        let ctx = Arc::clone(&self.ctx);
        let outcomes = self
            .executor()
            .run(targets, move |target| {
                let ctx = Arc::clone(&ctx);
                async move { destroy_instance(&ctx, target, policy).await }
            })
            .await;
        BatchReport { outcomes }
    }

    pub async fn power_on_instances(
        &self,
        targets: Vec<InstanceInfo>,
    ) -> BatchReport<PowerOutcome> {
        self.power_instances(targets, PowerAction::PowerOn).await
    }

    pub async fn power_off_instances(
        &self,
        targets: Vec<InstanceInfo>,
    ) -> BatchReport<PowerOutcome> {
        self.power_instances(targets, PowerAction::PowerOff).await
    }

    /// Restarts every instance in `targets` through its guest where
    /// possible, resetting the ones whose guest cannot reboot itself.
    pub async fn restart_instances(
        &self,
        targets: Vec<InstanceInfo>,
    ) -> BatchReport<PowerOutcome> {
        self.power_instances(targets, PowerAction::Restart).await
    }

    async fn power_instances(
        &self,
        targets: Vec<InstanceInfo>,
        action: PowerAction,
    ) -> BatchReport<PowerOutcome> {
        info!(self.log, "changing power state";
            "count" => targets.len(), "action" => ?action);
        let ctx = Arc::clone(&self.ctx);
        let outcomes = self
            .executor()
            .run(targets, move |target| {
                let ctx = Arc::clone(&ctx);
                async move { power_instance(&ctx, target, action).await }
            })
            .await;
        BatchReport { outcomes }
    }

    /// Publishes `record` in `zone`. An existing record with the same name
    /// and type is an error unless `replace` is set, in which case every
    /// such record is replaced.
    pub async fn publish_record(
        &self,
        zone: &str,
        record: &DnsRecord,
        replace: bool,
    ) -> Result<(), Error> {
        if self.ctx.config.dns.zone(zone).is_none() {
            return Err(Error::Configuration(format!(
                "no DNS zone configured for domain {zone:?}"
            )));
        }
        let dns = &self.ctx.backends.dns;
        let status = if replace {
            dns.update_record(zone, record).await?
        } else {
            let existing = dns.import_zone_records(zone).await?;
            if existing.iter().any(|r| {
                r.record.name == record.name
                    && r.record.record_type == record.record_type
            }) {
                return Err(Error::Resolution(format!(
                    "{} record {}.{zone} already exists",
                    record.record_type, record.name
                )));
            }
            dns.add_record(zone, record).await?
        };
        status.into_result(zone)?;
        info!(self.log, "published DNS record";
            "zone" => zone,
            "name" => &record.name,
            "content" => &record.content,
            "replaced" => replace);
        Ok(())
    }

    /// Looks up instances by uuid, address, FQDN, or (for names) every
    /// instance whose name contains the given text.
    pub async fn find_instances(
        &self,
        lookup: &InstanceLookup,
    ) -> Result<Vec<InstanceInfo>, Error> {
        let compute = &self.ctx.backends.compute;
        let found = match lookup {
            InstanceLookup::Name(name) => {
                let filter =
                    InstanceFilter { name_contains: Some(name.clone()) };
                compute.list_instances(&filter).await?
            }
            other => compute.find_instance(other).await?.into_iter().collect(),
        };
        Ok(found)
    }

    /// Returns the address the DNS record of `fqdn` points at.
    pub async fn resolve_fqdn(&self, fqdn: &str) -> Result<IpAddr, Error> {
        // Absolute names end in the root label.
        let (host, zone) =
            fqdn.trim_end_matches('.').split_once('.').ok_or_else(|| {
                Error::Resolution(format!(
                    "{fqdn:?} is not a fully qualified name"
                ))
            })?;
        let records =
            self.ctx.backends.dns.import_zone_records(zone).await?;
        let record = records
            .into_iter()
            .find(|r| r.record.name == host)
            .ok_or_else(|| {
                Error::Resolution(format!("no DNS record for {fqdn:?}"))
            })?;
        record.record.content.parse().map_err(|_| {
            Error::Resolution(format!(
                "DNS record for {fqdn:?} does not hold an address: {:?}",
                record.record.content
            ))
        })
    }
}

/// Bootstraps a created instance that asked for it. Failures only flip the
/// outcome to `BootstrapError`; the instance stays created.
async fn bootstrap_outcome(
    ctx: &SagaContext,
    mut outcome: CreateOutcome,
) -> CreateOutcome {
    if outcome.status != CreateStatus::Created
        || outcome.spec.bootstrap.is_none()
    {
        return outcome;
    }

    let result = match &outcome.network {
        Some(network) if outcome.readiness_error.is_none() => {
            bootstrap_instance(ctx, &outcome.spec, network).await
        }
        _ => Err(match outcome.address() {
            Some(address) => BootstrapError::Unreachable { address }.into(),
            None => Error::Resolution(format!(
                "{} has no known address",
                outcome.spec.name
            )),
        }),
    };
    match result {
        Ok(()) => outcome.status = CreateStatus::Bootstrapped,
        Err(error) => {
            warn!(ctx.log, "bootstrap failed";
                "instance" => &outcome.spec.name,
                "error" => %DisplayErrorChain::new(&error));
            outcome.status = CreateStatus::BootstrapError;
            outcome.bootstrap_error = Some(error);
        }
    }
    outcome
}
