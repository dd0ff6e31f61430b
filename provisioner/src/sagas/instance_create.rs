// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Saga provisioning a single instance.
//!
//! Compute-side resources are resolved first; nothing has been mutated when
//! that fails, so the error is returned as is. Every later step runs under a
//! [`CompensationLedger`] and a failure replays it before surfacing as
//! [`Error::ProvisioningFailure`].

use super::SagaContext;
use crate::backends::AddressPayload;
use crate::backends::AddressQuery;
use crate::backends::CloneSpec;
use crate::backends::ConfigSpec;
use crate::backends::CustomizationSpec;
use crate::backends::DnsRecord;
use crate::backends::GuestAddressing;
use crate::backends::NicSpec;
use crate::backends::ObjectRef;
use crate::backends::PlacementRequest;
use crate::backends::RelocateSpec;
use crate::backends::SubnetInfo;
use crate::backends::TaskResult;
use crate::error::AddressError;
use crate::error::ComputeError;
use crate::error::Error;
use crate::instance::InstanceSpec;
use crate::instance::NetworkAllocation;
use crate::instance::StorageTarget;
use crate::ledger::Compensation;
use crate::ledger::CompensationLedger;
use crate::poll;
use crate::poll::wait_for_condition;
use crate::poll::Ceiling;
use crate::poll::CondCheckError;
use display_error_chain::DisplayErrorChain;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::net::IpAddr;

/// Device key of the network adapter templates carry.
const TEMPLATE_NIC_KEY: i32 = 4000;

/// An instance that made it through every provisioning step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedInstance {
    pub vm: ObjectRef,
    pub network: NetworkAllocation,
}

#[derive(Debug)]
enum StorageRoute {
    Datastore(ObjectRef),
    /// Placed by a storage recommendation inside a datastore cluster.
    Pod(ObjectRef),
}

#[derive(Debug)]
struct Placement {
    template: ObjectRef,
    network: ObjectRef,
    folder: ObjectRef,
    compute: ObjectRef,
    storage: StorageRoute,
}

/// Provisions the instance described by `spec`.
pub async fn create_instance(
    ctx: &SagaContext,
    spec: &InstanceSpec,
) -> Result<ProvisionedInstance, Error> {
    let log = ctx.log.new(o!(
        "saga" => "instance-create",
        "instance" => spec.name.clone(),
    ));

    let placement = resolve_placement(ctx, spec).await?;
    info!(log, "resolved placement"; "placement" => ?placement);

    let mut ledger = CompensationLedger::new(&log);
    match provision(ctx, &log, spec, &placement, &mut ledger).await {
        Ok(provisioned) => {
            info!(log, "instance created";
                "address" => ?provisioned.network.address,
                "fqdn" => &provisioned.network.fqdn);
            Ok(provisioned)
        }
        Err(cause) => {
            error!(log, "provisioning failed, compensating";
                "error" => %DisplayErrorChain::new(&cause),
                "compensations" => ledger.entries().len());
            let failures = ledger.unwind(ctx).await;
            if !failures.is_empty() {
                warn!(log, "some compensations failed";
                    "count" => failures.len());
            }
            Err(Error::ProvisioningFailure {
                spec: Box::new(spec.clone()),
                cause: Box::new(cause),
            })
        }
    }
}

fn missing_is_configuration(error: ComputeError) -> Error {
    match error {
        ComputeError::NotFound { .. } => {
            Error::Configuration(error.to_string())
        }
        other => Error::Compute(other),
    }
}

async fn resolve_placement(
    ctx: &SagaContext,
    spec: &InstanceSpec,
) -> Result<Placement, Error> {
    let Some(storage) = &spec.storage else {
        return Err(Error::Configuration(format!(
            "no datastore or datastore cluster set for {}",
            spec.name
        )));
    };
    if ctx.config.dns.zone(&spec.network.domain).is_none() {
        return Err(Error::Configuration(format!(
            "no DNS zone configured for domain {:?}",
            spec.network.domain
        )));
    }

    let compute = &ctx.backends.compute;
    let template = compute
        .find_template(&spec.template.name)
        .await
        .map_err(missing_is_configuration)?;
    let network = compute
        .find_network(&spec.network.name)
        .await
        .map_err(missing_is_configuration)?;
    let folder = compute
        .find_folder(&spec.folder)
        .await
        .map_err(missing_is_configuration)?;
    let pool = compute
        .find_compute(&spec.compute)
        .await
        .map_err(missing_is_configuration)?;
    let found =
        compute.find_storage(storage).await.map_err(missing_is_configuration)?;
    let storage = match storage {
        StorageTarget::Datastore(_) => StorageRoute::Datastore(found),
        StorageTarget::DatastoreCluster(_) => StorageRoute::Pod(found),
    };

    Ok(Placement { template, network, folder, compute: pool, storage })
}

async fn provision(
    ctx: &SagaContext,
    log: &Logger,
    spec: &InstanceSpec,
    placement: &Placement,
    ledger: &mut CompensationLedger,
) -> Result<ProvisionedInstance, Error> {
    let addresses = &ctx.backends.addresses;
    let compute = &ctx.backends.compute;

    // Only the subnet's own record is sure to carry its gateway.
    let found = addresses.find_subnet_by_cidr(spec.network.cidr).await?;
    let subnet = addresses.get_subnet(found.id).await?;
    let mut network = allocation(spec, &subnet);

    if !spec.dhcp {
        let address = addresses.reserve_first_free(subnet.id).await?;
        ledger.record(Compensation::ReleaseAddress {
            address,
            subnet: subnet.id,
        });
        info!(log, "reserved address"; "address" => %address);
        network.address = Some(address);
    }
    let reserved = network.address;

    let config_spec = ConfigSpec {
        name: spec.name.clone(),
        num_cpus: spec.num_cpus,
        memory_mib: spec.memory_mib,
        cpu_hot_add: true,
        memory_hot_add: true,
        nic: NicSpec {
            device_key: TEMPLATE_NIC_KEY,
            network: placement.network.clone(),
        },
    };
    let customization = customization_spec(spec, &network);
    let clone_spec = CloneSpec {
        location: RelocateSpec {
            pool: placement.compute.clone(),
            datastore: match &placement.storage {
                StorageRoute::Datastore(ds) => Some(ds.clone()),
                StorageRoute::Pod(_) => None,
            },
        },
        power_on: false,
        template: false,
    };

    let task = match &placement.storage {
        StorageRoute::Datastore(_) => {
            compute
                .clone_vm(
                    &placement.template,
                    &placement.folder,
                    &spec.name,
                    &clone_spec,
                )
                .await?
        }
        StorageRoute::Pod(pod) => {
            compute
                .recommend_storage_placement(&PlacementRequest {
                    pod: pod.clone(),
                    template: placement.template.clone(),
                    folder: placement.folder.clone(),
                    name: spec.name.clone(),
                    clone_spec: clone_spec.clone(),
                })
                .await?
        }
    };
    let label = format!("clone {}", spec.name);
    let vm = match ctx.run_task(log, task, label.clone()).await? {
        Some(TaskResult::Instance(vm)) => vm,
        None => {
            return Err(Error::TaskFailure {
                label,
                cause: Some(String::from("clone reported no instance")),
            });
        }
    };
    ledger.record(Compensation::DeprovisionNode {
        vm: vm.clone(),
        name: spec.name.clone(),
    });

    let task = compute.reconfigure(&vm, &config_spec).await?;
    ctx.run_task(log, task, format!("reconfigure {}", spec.name)).await?;

    let task = compute.customize(&vm, &customization).await?;
    ctx.run_task(log, task, format!("customize {}", spec.name)).await?;

    let task = compute.power_on(&vm).await?;
    ctx.run_task(log, task, format!("power on {}", spec.name)).await?;

    let address = wait_for_guest_address(ctx, log, &vm, spec, reserved).await?;
    info!(log, "guest reported address"; "address" => %address);
    network.address = Some(address);

    register_address(ctx, spec, &network, reserved, address, ledger).await?;

    let zone = &network.domain;
    let record = DnsRecord {
        name: spec.hostname.clone(),
        record_type: ctx.config.dns.record_type_for(zone),
        content: address.to_string(),
        ttl: ctx.config.dns.ttl_for(zone),
    };
    ctx.backends.dns.add_record(zone, &record).await?.into_result(zone)?;
    ledger.record(Compensation::RemoveDnsRecord { zone: zone.clone(), record });

    Ok(ProvisionedInstance { vm, network })
}

fn allocation(spec: &InstanceSpec, subnet: &SubnetInfo) -> NetworkAllocation {
    NetworkAllocation {
        subnet_id: subnet.id,
        address: None,
        fqdn: spec.fqdn(),
        domain: spec.network.domain.clone(),
        nameservers: spec.network.nameservers.clone(),
        gateway: subnet.gateway,
        netmask: spec.network.cidr.mask(),
    }
}

fn customization_spec(
    spec: &InstanceSpec,
    network: &NetworkAllocation,
) -> CustomizationSpec {
    let addressing = match network.address {
        Some(address) => GuestAddressing::Static {
            address,
            gateway: network.gateway,
            netmask: network.netmask,
        },
        None => GuestAddressing::Dhcp,
    };
    CustomizationSpec {
        hostname: spec.hostname.clone(),
        domain: network.domain.clone(),
        nameservers: network.nameservers.clone(),
        addressing,
    }
}

/// Waits for the powered-on guest to report an address that may be recorded
/// for it. Bounded by the configured guest-address timeout; running out is a
/// `TaskFailure`.
///
/// With a reservation only the reserved address is accepted. A DHCP lease
/// must be inside the network's CIDR and not link-local. Anything else is
/// treated as not reported yet.
async fn wait_for_guest_address(
    ctx: &SagaContext,
    log: &Logger,
    vm: &ObjectRef,
    spec: &InstanceSpec,
    reserved: Option<IpAddr>,
) -> Result<IpAddr, Error> {
    let compute = &ctx.backends.compute;
    let timeout = ctx.config.orchestrator.guest_address_timeout();
    let result = wait_for_condition(
        || async move {
            match compute.guest_address(vm).await {
                Ok(Some(address))
                    if acceptable_guest_address(spec, reserved, address) =>
                {
                    Ok(address)
                }
                Ok(Some(address)) => {
                    debug!(log, "ignoring guest address";
                        "address" => %address,
                        "reserved" => ?reserved);
                    Err(CondCheckError::NotYet)
                }
                Ok(None) => Err(CondCheckError::NotYet),
                Err(e) => Err(CondCheckError::Failed(e)),
            }
        },
        &ctx.config.orchestrator.guest_address_poll_interval(),
        Ceiling::Elapsed(timeout),
    )
    .await;

    match result {
        Ok(address) => Ok(address),
        Err(poll::Error::PermanentError(e)) => Err(e.into()),
        Err(poll::Error::TimedOut(_) | poll::Error::AttemptsExhausted(_)) => {
            let expected = match reserved {
                Some(address) => format!("reserved address {address}"),
                None => format!("an address in {}", spec.network.cidr),
            };
            Err(Error::TaskFailure {
                label: format!("guest address {}", spec.name),
                cause: Some(format!(
                    "guest did not report {expected} within {timeout:?}"
                )),
            })
        }
    }
}

fn acceptable_guest_address(
    spec: &InstanceSpec,
    reserved: Option<IpAddr>,
    address: IpAddr,
) -> bool {
    match reserved {
        Some(reserved) => address == reserved,
        None => {
            !is_link_local(address) && spec.network.cidr.contains(address)
        }
    }
}

fn is_link_local(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => v4.is_link_local(),
        // fe80::/10
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
    }
}

/// Writes the instance's identity to the address-management service: the
/// reserved record is updated for static addressing, a new record is created
/// for a DHCP lease.
async fn register_address(
    ctx: &SagaContext,
    spec: &InstanceSpec,
    network: &NetworkAllocation,
    reserved: Option<IpAddr>,
    address: IpAddr,
    ledger: &mut CompensationLedger,
) -> Result<(), Error> {
    let addresses = &ctx.backends.addresses;
    match reserved {
        Some(reserved) => {
            let payload = AddressPayload::managed(&spec.hostname, None);
            let record = addresses
                .search(&AddressQuery::Address(reserved))
                .await?
                .into_iter()
                .find(|r| r.subnet_id == network.subnet_id)
                .ok_or_else(|| AddressError::NotFound(reserved.to_string()))?;
            addresses.update_address(record.id, &payload).await?;
        }
        None => {
            let payload =
                AddressPayload::managed(&spec.hostname, Some(address));
            addresses.create_address(network.subnet_id, &payload).await?;
            ledger.record(Compensation::ReleaseAddress {
                address,
                subnet: network.subnet_id,
            });
        }
    }
    Ok(())
}

/// Enrolls a provisioned instance with configuration management.
pub async fn bootstrap_instance(
    ctx: &SagaContext,
    spec: &InstanceSpec,
    network: &NetworkAllocation,
) -> Result<(), Error> {
    let log = ctx.log.new(o!(
        "saga" => "instance-bootstrap",
        "instance" => spec.name.clone(),
    ));
    let Some(request) = &spec.bootstrap else {
        return Ok(());
    };
    let Some(bootstrapper) = &ctx.backends.bootstrap else {
        return Err(Error::Configuration(String::from(
            "bootstrap requested but no bootstrapper is configured",
        )));
    };
    let address = network.address.ok_or_else(|| {
        Error::Resolution(format!("{} has no known address", spec.name))
    })?;

    bootstrapper.bootstrap_node(address, &network.fqdn, request).await?;
    info!(log, "bootstrapped"; "fqdn" => &network.fqdn);
    Ok(())
}
