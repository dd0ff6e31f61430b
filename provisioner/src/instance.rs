// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-instance provisioning intent and the outcomes reported for it.

use crate::backends::BootstrapRequest;
use crate::backends::InstanceInfo;
use crate::backends::ObjectRef;
use crate::backends::SubnetId;
use crate::error::Error;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Where a clone's disks go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageTarget {
    Datastore(String),
    /// A datastore cluster; the compute plane picks the member datastore.
    DatastoreCluster(String),
}

impl StorageTarget {
    /// Picks a storage target, preferring a plain datastore over a cluster.
    pub fn select(
        datastore: Option<&str>,
        datastore_cluster: Option<&str>,
    ) -> Option<StorageTarget> {
        match (datastore, datastore_cluster) {
            (Some(ds), _) => Some(StorageTarget::Datastore(ds.to_string())),
            (None, Some(pod)) => {
                Some(StorageTarget::DatastoreCluster(pod.to_string()))
            }
            (None, None) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateRef {
    pub name: String,
}

/// The network an instance is attached to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Port group name in the compute plane.
    pub name: String,
    pub cidr: IpNetwork,
    /// DNS domain, which is also the zone the instance is registered in.
    pub domain: String,
    pub nameservers: Vec<IpAddr>,
}

/// Provisioning intent for one instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub hostname: String,
    pub environment: String,
    pub category: String,
    pub num_cpus: u32,
    pub memory_mib: u64,
    pub storage: Option<StorageTarget>,
    pub compute: String,
    pub folder: String,
    pub network: NetworkSpec,
    pub template: TemplateRef,
    pub dhcp: bool,
    /// Present when the instance should be enrolled in configuration
    /// management once it is reachable.
    pub bootstrap: Option<BootstrapRequest>,
}

impl InstanceSpec {
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.hostname, self.network.domain)
    }
}

/// Network state accumulated while an instance is provisioned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkAllocation {
    pub subnet_id: SubnetId,
    /// Reserved address for static addressing, later replaced by the address
    /// the guest reports.
    pub address: Option<IpAddr>,
    pub fqdn: String,
    pub domain: String,
    pub nameservers: Vec<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub netmask: IpAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateStatus {
    Created,
    Error,
    Bootstrapped,
    BootstrapError,
}

/// Result of provisioning one instance.
#[derive(Debug)]
pub struct CreateOutcome {
    pub spec: InstanceSpec,
    pub network: Option<NetworkAllocation>,
    pub vm: Option<ObjectRef>,
    pub status: CreateStatus,
    pub error: Option<Error>,
    /// Set when the instance never became reachable after creation.
    pub readiness_error: Option<Error>,
    pub bootstrap_error: Option<Error>,
}

impl CreateOutcome {
    pub fn failed(spec: InstanceSpec, error: Error) -> CreateOutcome {
        CreateOutcome {
            spec,
            network: None,
            vm: None,
            status: CreateStatus::Error,
            error: Some(error),
            readiness_error: None,
            bootstrap_error: None,
        }
    }

    /// An instance that was created but never became reachable counts as
    /// failed even though its status stays `Created`.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            CreateStatus::Error | CreateStatus::BootstrapError
        ) || self.readiness_error.is_some()
    }

    pub fn address(&self) -> Option<IpAddr> {
        self.network.as_ref().and_then(|n| n.address)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyStatus {
    Deleted,
    DeletionError,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeregisterStatus {
    Deregistered,
    Failed(String),
}

/// Result of decommissioning one instance.
#[derive(Debug)]
pub struct DestroyOutcome {
    pub target: InstanceInfo,
    pub address: Option<IpAddr>,
    pub fqdn: Option<String>,
    pub status: DestroyStatus,
    /// Step failures demoted in forced mode.
    pub warnings: Vec<String>,
    pub error: Option<Error>,
    pub deregister: Option<DeregisterStatus>,
}

impl DestroyOutcome {
    pub fn new(target: InstanceInfo) -> DestroyOutcome {
        DestroyOutcome {
            target,
            address: None,
            fqdn: None,
            status: DestroyStatus::DeletionError,
            warnings: Vec::new(),
            error: None,
            deregister: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == DestroyStatus::DeletionError
    }
}

/// A change of power state requested for existing instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerAction {
    PowerOn,
    PowerOff,
    /// Guest reboot, falling back to a hard reset.
    Restart,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerStatus {
    Done,
    /// The instance was already in the requested state.
    Unchanged,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartMethod {
    GuestReboot,
    Reset,
}

/// Result of changing the power state of one instance.
#[derive(Debug)]
pub struct PowerOutcome {
    pub target: InstanceInfo,
    pub action: PowerAction,
    pub status: PowerStatus,
    /// How a restart was carried out, once it was.
    pub restart: Option<RestartMethod>,
    pub error: Option<Error>,
}

impl PowerOutcome {
    pub fn is_failure(&self) -> bool {
        self.status == PowerStatus::Error
    }
}

/// Outcomes of a batch, in the order the batch was requested.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub outcomes: Vec<T>,
}

impl BatchReport<CreateOutcome> {
    pub fn any_failed(&self) -> bool {
        self.outcomes.iter().any(CreateOutcome::is_failure)
    }
}

impl BatchReport<DestroyOutcome> {
    pub fn any_failed(&self) -> bool {
        self.outcomes.iter().any(DestroyOutcome::is_failure)
    }
}

impl BatchReport<PowerOutcome> {
    pub fn any_failed(&self) -> bool {
        self.outcomes.iter().any(PowerOutcome::is_failure)
    }
}
