// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the backends a provisioning workflow drives.
//!
//! The workflows only depend on the traits here. Concrete clients (and the
//! session each holds with its service) are built by the caller and handed
//! over as a [`Backends`] bundle.

use crate::error::AddressError;
use crate::error::BootstrapError;
use crate::error::ComputeError;
use crate::error::DnsError;
use crate::instance::StorageTarget;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

pub mod dns;
pub mod ipam;
pub mod knife;

/// The kind of compute-plane object an [`ObjectRef`] designates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Template,
    Network,
    Folder,
    Compute,
    Datastore,
    StoragePod,
    Instance,
}

/// Opaque handle to an object in the compute plane.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: impl Into<String>) -> ObjectRef {
        ObjectRef { kind, id: id.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.id)
    }
}

/// Identifier of an asynchronous operation running in the compute plane.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Error)
    }
}

/// Payload produced by a successful task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskResult {
    Instance(ObjectRef),
}

/// One observation of a task's progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    pub state: TaskState,
    pub result: Option<TaskResult>,
    /// The backend's own description of the failure, for `Error` tasks.
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NicSpec {
    /// Device key of the adapter the clone inherits from its template.
    pub device_key: i32,
    pub network: ObjectRef,
}

/// Hardware configuration applied to a fresh clone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigSpec {
    pub name: String,
    pub num_cpus: u32,
    pub memory_mib: u64,
    pub cpu_hot_add: bool,
    pub memory_hot_add: bool,
    pub nic: NicSpec,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuestAddressing {
    Static { address: IpAddr, gateway: Option<IpAddr>, netmask: IpAddr },
    Dhcp,
}

/// Guest identity written into the clone's operating system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomizationSpec {
    pub hostname: String,
    pub domain: String,
    pub nameservers: Vec<IpAddr>,
    pub addressing: GuestAddressing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelocateSpec {
    pub pool: ObjectRef,
    /// Absent when the datastore is picked by a placement recommendation.
    pub datastore: Option<ObjectRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloneSpec {
    pub location: RelocateSpec,
    pub power_on: bool,
    pub template: bool,
}

/// Clone routed through a datastore cluster: the compute plane recommends a
/// member datastore and applies the clone there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementRequest {
    pub pod: ObjectRef,
    pub template: ObjectRef,
    pub folder: ObjectRef,
    pub name: String,
    pub clone_spec: CloneSpec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// What the compute plane reports about an instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceInfo {
    pub vm: ObjectRef,
    pub uuid: Uuid,
    pub name: String,
    /// Hostname reported by the guest tools, if any.
    pub hostname: Option<String>,
    pub power_state: PowerState,
    /// Addresses of every guest interface.
    pub addresses: Vec<IpAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceLookup {
    Uuid(Uuid),
    Address(IpAddr),
    Fqdn(String),
    Name(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub name_contains: Option<String>,
}

impl InstanceFilter {
    pub fn matches(&self, name: &str) -> bool {
        self.name_contains.as_deref().map_or(true, |s| name.contains(s))
    }
}

#[async_trait]
pub trait ComputePlane: Send + Sync {
    async fn find_template(&self, name: &str)
        -> Result<ObjectRef, ComputeError>;
    async fn find_network(&self, name: &str) -> Result<ObjectRef, ComputeError>;
    /// `path` is a `/`-separated inventory path.
    async fn find_folder(&self, path: &str) -> Result<ObjectRef, ComputeError>;
    async fn find_compute(&self, path: &str)
        -> Result<ObjectRef, ComputeError>;
    async fn find_storage(
        &self,
        target: &StorageTarget,
    ) -> Result<ObjectRef, ComputeError>;

    async fn clone_vm(
        &self,
        template: &ObjectRef,
        folder: &ObjectRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<TaskId, ComputeError>;
    async fn recommend_storage_placement(
        &self,
        request: &PlacementRequest,
    ) -> Result<TaskId, ComputeError>;
    async fn reconfigure(
        &self,
        vm: &ObjectRef,
        spec: &ConfigSpec,
    ) -> Result<TaskId, ComputeError>;
    async fn customize(
        &self,
        vm: &ObjectRef,
        spec: &CustomizationSpec,
    ) -> Result<TaskId, ComputeError>;
    async fn power_on(&self, vm: &ObjectRef) -> Result<TaskId, ComputeError>;
    async fn power_off(&self, vm: &ObjectRef) -> Result<TaskId, ComputeError>;
    /// Hard reset, without involving the guest.
    async fn reset(&self, vm: &ObjectRef) -> Result<TaskId, ComputeError>;
    /// Asks the guest operating system to restart itself. Needs guest tools
    /// running in the instance, and returns once the request is accepted.
    async fn reboot_guest(&self, vm: &ObjectRef) -> Result<(), ComputeError>;
    async fn destroy(&self, vm: &ObjectRef) -> Result<TaskId, ComputeError>;
    async fn poll_task(&self, task: &TaskId) -> Result<TaskInfo, ComputeError>;

    async fn power_state(
        &self,
        vm: &ObjectRef,
    ) -> Result<PowerState, ComputeError>;
    /// The address the guest currently reports, once it reports one.
    async fn guest_address(
        &self,
        vm: &ObjectRef,
    ) -> Result<Option<IpAddr>, ComputeError>;
    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceInfo>, ComputeError>;
    async fn find_instance(
        &self,
        lookup: &InstanceLookup,
    ) -> Result<Option<InstanceInfo>, ComputeError>;
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize,
)]
#[serde(transparent)]
pub struct SubnetId(pub u64);

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize,
)]
#[serde(transparent)]
pub struct AddressId(pub u64);

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetInfo {
    pub id: SubnetId,
    pub network: IpNetwork,
    pub gateway: Option<IpAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressRecord {
    pub id: AddressId,
    pub subnet_id: SubnetId,
    pub address: IpAddr,
    pub hostname: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressQuery {
    Address(IpAddr),
    Hostname(String),
}

/// Metadata written to an address record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AddressPayload {
    #[serde(rename = "ip", skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    pub hostname: String,
    pub description: String,
    pub note: String,
}

impl AddressPayload {
    pub fn managed(hostname: &str, address: Option<IpAddr>) -> AddressPayload {
        AddressPayload {
            address,
            hostname: hostname.to_string(),
            description: String::from(
                "This address is managed by instance-provisioner.",
            ),
            note: String::from("Do not modify this address directly."),
        }
    }
}

#[async_trait]
pub trait AddressManager: Send + Sync {
    /// Reserves the first free address of a subnet. Implementations retry
    /// transient failures themselves.
    async fn reserve_first_free(
        &self,
        subnet: SubnetId,
    ) -> Result<IpAddr, AddressError>;
    async fn release_address(
        &self,
        address: IpAddr,
        subnet: SubnetId,
    ) -> Result<(), AddressError>;
    async fn search(
        &self,
        query: &AddressQuery,
    ) -> Result<Vec<AddressRecord>, AddressError>;
    async fn create_address(
        &self,
        subnet: SubnetId,
        payload: &AddressPayload,
    ) -> Result<AddressId, AddressError>;
    async fn update_address(
        &self,
        id: AddressId,
        payload: &AddressPayload,
    ) -> Result<(), AddressError>;
    async fn find_subnet_by_cidr(
        &self,
        cidr: IpNetwork,
    ) -> Result<SubnetInfo, AddressError>;
    async fn get_subnet(&self, id: SubnetId)
        -> Result<SubnetInfo, AddressError>;
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
pub enum RecordType {
    #[default]
    A,
    CNAME,
    PTR,
    MX,
    TXT,
    SRV,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordType::A => "A",
            RecordType::CNAME => "CNAME",
            RecordType::PTR => "PTR",
            RecordType::MX => "MX",
            RecordType::TXT => "TXT",
            RecordType::SRV => "SRV",
        };
        f.write_str(s)
    }
}

impl FromStr for RecordType {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "CNAME" => Ok(RecordType::CNAME),
            "PTR" => Ok(RecordType::PTR),
            "MX" => Ok(RecordType::MX),
            "TXT" => Ok(RecordType::TXT),
            "SRV" => Ok(RecordType::SRV),
            _ => Err(DnsError::UnsupportedRecordType(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DnsRecord {
    /// Name relative to the zone.
    pub name: String,
    pub record_type: RecordType,
    pub content: String,
    pub ttl: u32,
}

/// A record found while importing a zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordInfo {
    pub zone: String,
    pub record: DnsRecord,
}

impl RecordInfo {
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.record.name, self.zone)
    }
}

/// Textual response code of a dynamic update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateStatus(pub String);

impl UpdateStatus {
    pub const SUCCESS: &'static str = "NOERROR";

    pub fn noerror() -> UpdateStatus {
        UpdateStatus(String::from(Self::SUCCESS))
    }

    pub fn is_error(&self) -> bool {
        self.0 != Self::SUCCESS
    }

    pub fn into_result(self, zone: &str) -> Result<(), DnsError> {
        if self.is_error() {
            Err(DnsError::Rejected { zone: zone.to_string(), status: self.0 })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
pub trait NameService: Send + Sync {
    async fn add_record(
        &self,
        zone: &str,
        record: &DnsRecord,
    ) -> Result<UpdateStatus, DnsError>;
    /// Replaces every record of `record.name` and `record.record_type`.
    async fn update_record(
        &self,
        zone: &str,
        record: &DnsRecord,
    ) -> Result<UpdateStatus, DnsError>;
    async fn remove_record(
        &self,
        zone: &str,
        record: &DnsRecord,
    ) -> Result<UpdateStatus, DnsError>;
    async fn import_zone_records(
        &self,
        zone: &str,
    ) -> Result<Vec<RecordInfo>, DnsError>;
}

/// What a node is enrolled with when it is bootstrapped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapRequest {
    pub environment: String,
    pub chef_environment: Option<String>,
    pub runlist: Vec<String>,
}

#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Enrolls the node at `address`. Implementations wait for the address
    /// to become reachable first.
    async fn bootstrap_node(
        &self,
        address: IpAddr,
        fqdn: &str,
        request: &BootstrapRequest,
    ) -> Result<(), BootstrapError>;
    async fn deregister_node(&self, fqdn: &str) -> Result<(), BootstrapError>;
}

/// The collaborators one provisioner drives.
#[derive(Clone)]
pub struct Backends {
    pub compute: Arc<dyn ComputePlane>,
    pub addresses: Arc<dyn AddressManager>,
    pub dns: Arc<dyn NameService>,
    pub bootstrap: Option<Arc<dyn Bootstrapper>>,
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_record_type_parse() {
        assert_eq!("cname".parse::<RecordType>().unwrap(), RecordType::CNAME);
        assert_eq!("A".parse::<RecordType>().unwrap(), RecordType::A);
        assert_matches!(
            "AAAA".parse::<RecordType>(),
            Err(DnsError::UnsupportedRecordType(s)) if s == "AAAA"
        );
    }

    #[test]
    fn test_update_status() {
        assert!(UpdateStatus::noerror().into_result("example.com").is_ok());
        assert_matches!(
            UpdateStatus(String::from("REFUSED")).into_result("example.com"),
            Err(DnsError::Rejected { zone, status })
                if zone == "example.com" && status == "REFUSED"
        );
    }
}
