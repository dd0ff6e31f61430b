// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Saga decommissioning a single instance.
//!
//! The instance's network identity is torn down first: its address record is
//! resolved and checked against the compute object, its DNS record removed
//! and its address released. The compute object is destroyed last. In forced
//! mode step failures are demoted to warnings on the outcome so the compute
//! object is always destroyed; otherwise the first failure ends the saga and
//! leaves the compute object in place.

use super::SagaContext;
use crate::backends::AddressQuery;
use crate::backends::AddressRecord;
use crate::backends::InstanceInfo;
use crate::backends::RecordInfo;
use crate::error::Error;
use crate::instance::DeregisterStatus;
use crate::instance::DestroyOutcome;
use crate::instance::DestroyStatus;
use display_error_chain::DisplayErrorChain;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::net::IpAddr;

/// Decides what a failed step means for the rest of the saga.
#[derive(Clone, Copy, Debug)]
pub struct StepPolicy {
    pub forced: bool,
}

impl StepPolicy {
    /// Passes successes through. A failure is returned as is unless forced,
    /// in which case it is logged, recorded as a warning, and becomes `None`.
    pub fn demote<T>(
        &self,
        log: &Logger,
        step: &str,
        result: Result<T, Error>,
        warnings: &mut Vec<String>,
    ) -> Result<Option<T>, Error> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) if self.forced => {
                let chain = DisplayErrorChain::new(&error).to_string();
                warn!(log, "ignoring failed step"; "step" => step,
                    "error" => &chain);
                warnings.push(format!("{step}: {chain}"));
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}

/// Decommissions `target`. Never fails: the outcome carries the status and
/// any error.
pub async fn destroy_instance(
    ctx: &SagaContext,
    target: InstanceInfo,
    policy: StepPolicy,
) -> DestroyOutcome {
    let log = ctx.log.new(o!(
        "saga" => "instance-destroy",
        "instance" => target.name.clone(),
        "forced" => policy.forced,
    ));
    let mut outcome = DestroyOutcome::new(target);

    if let Err(cause) =
        release_network_identity(ctx, &log, policy, &mut outcome).await
    {
        error!(log, "decommission failed, leaving instance in place";
            "error" => %DisplayErrorChain::new(&cause));
        outcome.status = DestroyStatus::DeletionError;
        outcome.error = Some(Error::DecommissionFailure {
            name: outcome.target.name.clone(),
            cause: Box::new(cause),
        });
        return outcome;
    }

    let vm = outcome.target.vm.clone();
    let name = outcome.target.name.clone();
    match ctx.deprovision(&log, &vm, &name).await {
        Ok(()) => outcome.status = DestroyStatus::Deleted,
        Err(cause) => {
            error!(log, "failed to destroy instance";
                "error" => %DisplayErrorChain::new(&cause));
            outcome.status = DestroyStatus::DeletionError;
            outcome.error = Some(Error::DecommissionFailure {
                name,
                cause: Box::new(cause),
            });
        }
    }
    outcome
}

async fn release_network_identity(
    ctx: &SagaContext,
    log: &Logger,
    policy: StepPolicy,
    outcome: &mut DestroyOutcome,
) -> Result<(), Error> {
    let warnings = &mut outcome.warnings;

    let resolved = resolve_address_record(ctx, &outcome.target).await;
    let Some(record) =
        policy.demote(log, "resolve address", resolved, warnings)?
    else {
        return Ok(());
    };
    outcome.address = Some(record.address);

    let verified = verify_identity(&outcome.target, &record);
    if policy.demote(log, "verify identity", verified, warnings)?.is_none() {
        return Ok(());
    }

    let found = find_dns_record(ctx, log, record.address).await;
    let dns_record =
        policy.demote(log, "search DNS", found, warnings)?.flatten();

    let released = ctx
        .backends
        .addresses
        .release_address(record.address, record.subnet_id)
        .await
        .map_err(Error::from);
    if policy.demote(log, "release address", released, warnings)?.is_some() {
        info!(log, "released address"; "address" => %record.address);
    }

    let Some(found) = dns_record else {
        return Ok(());
    };
    let fqdn = found.fqdn();
    outcome.fqdn = Some(fqdn.clone());
    let removed = ctx
        .backends
        .dns
        .remove_record(&found.zone, &found.record)
        .await
        .and_then(|status| status.into_result(&found.zone))
        .map_err(Error::from);
    if policy.demote(log, "remove DNS record", removed, warnings)?.is_some() {
        info!(log, "removed DNS record"; "fqdn" => &fqdn);
    }

    if let Some(bootstrapper) = &ctx.backends.bootstrap {
        let status = match bootstrapper.deregister_node(&fqdn).await {
            Ok(()) => DeregisterStatus::Deregistered,
            Err(e) => {
                let chain = DisplayErrorChain::new(&e).to_string();
                warn!(log, "failed to deregister node"; "error" => &chain);
                DeregisterStatus::Failed(chain)
            }
        };
        outcome.deregister = Some(status);
    }
    Ok(())
}

/// Finds the address record of the first of the instance's addresses that
/// the address-management service knows about.
async fn resolve_address_record(
    ctx: &SagaContext,
    target: &InstanceInfo,
) -> Result<AddressRecord, Error> {
    for address in &target.addresses {
        let records = ctx
            .backends
            .addresses
            .search(&AddressQuery::Address(*address))
            .await?;
        if let Some(record) = records.into_iter().next() {
            return Ok(record);
        }
    }
    Err(Error::Resolution(format!(
        "none of the addresses of {} ({:?}) are registered; is the instance \
         running?",
        target.name, target.addresses
    )))
}

/// Guards against tearing down another instance's records after address
/// reuse.
fn verify_identity(
    target: &InstanceInfo,
    record: &AddressRecord,
) -> Result<(), Error> {
    if target.hostname.is_some() && target.hostname == record.hostname {
        Ok(())
    } else {
        Err(Error::Resolution(format!(
            "hostname of {} ({:?}) does not match the address record of {} \
             ({:?})",
            target.name, target.hostname, record.address, record.hostname
        )))
    }
}

/// Searches every configured zone for a record pointing at `address`.
async fn find_dns_record(
    ctx: &SagaContext,
    log: &Logger,
    address: IpAddr,
) -> Result<Option<RecordInfo>, Error> {
    let content = address.to_string();
    let mut matches = Vec::new();
    for zone in ctx.config.dns.zones.keys() {
        let records = ctx.backends.dns.import_zone_records(zone).await?;
        matches.extend(
            records.into_iter().filter(|r| r.record.content == content),
        );
    }
    if matches.len() > 1 {
        let fqdns: Vec<String> = matches.iter().map(RecordInfo::fqdn).collect();
        warn!(log, "several DNS records point at address, using the first";
            "address" => %address, "records" => ?fqdns);
    }
    Ok(matches.into_iter().next())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backends::DnsRecord;
    use crate::backends::RecordType;
    use crate::sim::test_setup_log;
    use crate::sim::SimEnvironment;
    use crate::sim::SimEvent;
    use crate::sim::SimOperation;
    use crate::sim::SIM_ZONE;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const ADDRESS: &str = "10.0.0.20";

    /// A running instance with matching address and DNS records.
    fn registered_instance(
        sim: &SimEnvironment,
        guest_hostname: &str,
        ipam_hostname: &str,
    ) -> InstanceInfo {
        let address: IpAddr = ADDRESS.parse().unwrap();
        sim.compute.add_instance("WEB-1", Some(guest_hostname), vec![address]);
        sim.ipam.register(sim.subnet, address, Some(ipam_hostname));
        sim.dns.insert(
            SIM_ZONE,
            DnsRecord {
                name: String::from("web-1"),
                record_type: RecordType::A,
                content: ADDRESS.to_string(),
                ttl: 300,
            },
        );
        sim.compute.instance("WEB-1").unwrap()
    }

    #[tokio::test]
    async fn test_destroy_registered_instance() {
        let log = test_setup_log("test_destroy_registered_instance");
        let sim = SimEnvironment::new(&log);
        let ctx = sim.saga_context(&log);
        let target = registered_instance(&sim, "web-1", "web-1");

        let outcome =
            destroy_instance(&ctx, target, StepPolicy { forced: false }).await;
        assert_eq!(outcome.status, DestroyStatus::Deleted);
        assert!(outcome.error.is_none());
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.fqdn.as_deref(), Some("web-1.example.com"));
        assert_eq!(outcome.deregister, Some(DeregisterStatus::Deregistered));
        assert!(sim.compute.instance("WEB-1").is_none());
        assert!(sim.ipam.lookup(ADDRESS.parse().unwrap()).is_none());
        assert!(sim.dns.records(SIM_ZONE).is_empty());

        // The compute object goes last.
        let events = sim.events();
        assert_matches!(events.last(), Some(SimEvent::Destroy { .. }));
    }

    #[tokio::test]
    async fn test_hostname_mismatch_leaves_instance_in_place() {
        let log = test_setup_log("test_hostname_mismatch");
        let sim = SimEnvironment::new(&log);
        let ctx = sim.saga_context(&log);
        let target = registered_instance(&sim, "web-1", "db-7");

        let outcome =
            destroy_instance(&ctx, target, StepPolicy { forced: false }).await;
        assert_eq!(outcome.status, DestroyStatus::DeletionError);
        assert_matches!(
            outcome.error.as_ref().map(Error::root_cause),
            Some(Error::Resolution(_))
        );
        assert!(sim.compute.instance("WEB-1").is_some());
        assert!(sim.ipam.lookup(ADDRESS.parse().unwrap()).is_some());
        assert_eq!(sim.dns.records(SIM_ZONE).len(), 1);
        assert!(!sim
            .events()
            .iter()
            .any(|e| matches!(e, SimEvent::Destroy { .. })));
    }

    #[tokio::test]
    async fn test_forced_hostname_mismatch_destroys_only_compute() {
        let log = test_setup_log("test_forced_hostname_mismatch");
        let sim = SimEnvironment::new(&log);
        let ctx = sim.saga_context(&log);
        let target = registered_instance(&sim, "web-1", "db-7");

        let outcome =
            destroy_instance(&ctx, target, StepPolicy { forced: true }).await;
        assert_eq!(outcome.status, DestroyStatus::Deleted);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].starts_with("verify identity"));
        assert!(sim.compute.instance("WEB-1").is_none());
        // Another instance's records are left alone.
        assert!(sim.ipam.lookup(ADDRESS.parse().unwrap()).is_some());
        assert_eq!(sim.dns.records(SIM_ZONE).len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_address_is_resolution_error() {
        let log = test_setup_log("test_unregistered_address");
        let sim = SimEnvironment::new(&log);
        let ctx = sim.saga_context(&log);
        sim.compute.add_instance(
            "WEB-2",
            Some("web-2"),
            vec!["10.0.0.30".parse().unwrap()],
        );
        let target = sim.compute.instance("WEB-2").unwrap();

        let outcome =
            destroy_instance(&ctx, target.clone(), StepPolicy { forced: false })
                .await;
        assert_eq!(outcome.status, DestroyStatus::DeletionError);
        assert_matches!(
            outcome.error.as_ref().map(Error::root_cause),
            Some(Error::Resolution(_))
        );
        assert!(sim.compute.instance("WEB-2").is_some());

        let outcome =
            destroy_instance(&ctx, target, StepPolicy { forced: true }).await;
        assert_eq!(outcome.status, DestroyStatus::Deleted);
        assert!(outcome.warnings[0].starts_with("resolve address"));
        assert!(sim.compute.instance("WEB-2").is_none());
    }

    #[tokio::test]
    async fn test_forced_destroy_survives_dns_outage() {
        let log = test_setup_log("test_forced_destroy_survives_dns_outage");
        let sim = SimEnvironment::new(&log);
        let ctx = sim.saga_context(&log);
        let target = registered_instance(&sim, "web-1", "web-1");
        sim.dns.set_import_failure(true);

        let outcome =
            destroy_instance(&ctx, target, StepPolicy { forced: true }).await;
        assert_eq!(outcome.status, DestroyStatus::Deleted);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].starts_with("search DNS"));
        // The address is still released even though DNS was unreachable.
        assert!(sim.ipam.lookup(ADDRESS.parse().unwrap()).is_none());
        assert!(outcome.fqdn.is_none());
        assert!(outcome.deregister.is_none());
    }

    #[tokio::test]
    async fn test_deregister_failure_is_recorded_not_fatal() {
        let log = test_setup_log("test_deregister_failure");
        let sim = SimEnvironment::new(&log);
        let ctx = sim.saga_context(&log);
        let target = registered_instance(&sim, "web-1", "web-1");
        sim.bootstrap.set_deregister_failure(true);

        let outcome =
            destroy_instance(&ctx, target, StepPolicy { forced: false }).await;
        assert_eq!(outcome.status, DestroyStatus::Deleted);
        assert_matches!(outcome.deregister, Some(DeregisterStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_first_dns_record_by_zone_is_removed() {
        let log = test_setup_log("test_first_dns_record_by_zone");
        let sim = SimEnvironment::new(&log);
        let mut config = sim.config();
        let zone = config.dns.zones[SIM_ZONE].clone();
        config.dns.zones.insert(String::from("corp.example"), zone);
        let ctx = SagaContext::new(&log, Arc::new(config), sim.backends());
        let target = registered_instance(&sim, "web-1", "web-1");
        sim.dns.insert(
            "corp.example",
            DnsRecord {
                name: String::from("legacy"),
                record_type: RecordType::A,
                content: ADDRESS.to_string(),
                ttl: 300,
            },
        );

        let outcome =
            destroy_instance(&ctx, target, StepPolicy { forced: false }).await;
        assert_eq!(outcome.status, DestroyStatus::Deleted);
        // Zones are searched in name order; the other record stays.
        assert_eq!(outcome.fqdn.as_deref(), Some("legacy.corp.example"));
        assert!(sim.dns.records("corp.example").is_empty());
        let left = sim.dns.records(SIM_ZONE);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "web-1");
    }

    #[tokio::test]
    async fn test_destroy_failure_after_teardown_is_deletion_error() {
        let log = test_setup_log("test_destroy_failure_after_teardown");
        let sim = SimEnvironment::new(&log);
        let ctx = sim.saga_context(&log);
        let target = registered_instance(&sim, "web-1", "web-1");
        sim.compute.fail_operation(
            SimOperation::Destroy,
            Some("WEB-1"),
            "instance is locked",
        );

        let outcome =
            destroy_instance(&ctx, target, StepPolicy { forced: false }).await;
        assert_eq!(outcome.status, DestroyStatus::DeletionError);
        assert!(outcome.is_failure());
        assert_matches!(
            &outcome.error,
            Some(Error::DecommissionFailure { name, cause })
                if name == "WEB-1"
                    && matches!(**cause, Error::TaskFailure { .. })
        );
        // The network identity was already gone when the destroy failed.
        assert!(sim.ipam.lookup(ADDRESS.parse().unwrap()).is_none());
        assert!(sim.dns.records(SIM_ZONE).is_empty());
        assert!(sim.compute.instance("WEB-1").is_some());
    }
}
