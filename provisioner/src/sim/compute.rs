// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated compute plane.

use super::SimEvent;
use super::SimEventLog;
use crate::backends::CloneSpec;
use crate::backends::ComputePlane;
use crate::backends::ConfigSpec;
use crate::backends::CustomizationSpec;
use crate::backends::GuestAddressing;
use crate::backends::InstanceFilter;
use crate::backends::InstanceInfo;
use crate::backends::InstanceLookup;
use crate::backends::ObjectKind;
use crate::backends::ObjectRef;
use crate::backends::PlacementRequest;
use crate::backends::PowerState;
use crate::backends::TaskId;
use crate::backends::TaskInfo;
use crate::backends::TaskResult;
use crate::backends::TaskState;
use crate::error::ComputeError;
use crate::instance::StorageTarget;
use async_trait::async_trait;
use slog::debug;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use uuid::Uuid;

/// Compute-plane operations whose tasks can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimOperation {
    Clone,
    Reconfigure,
    Customize,
    PowerOn,
    PowerOff,
    /// Guest reboot requests, refused rather than run as a task.
    RebootGuest,
    Reset,
    Destroy,
}

struct SimInstance {
    info: InstanceInfo,
    pending_addressing: Option<GuestAddressing>,
    guest_address: Option<IpAddr>,
}

#[derive(Default)]
struct ComputeState {
    next_id: u64,
    next_dhcp_host: u8,
    tasks: HashMap<TaskId, VecDeque<TaskInfo>>,
    instances: BTreeMap<String, SimInstance>,
    missing: HashSet<(ObjectKind, String)>,
    /// Injected failures, keyed by operation and instance name (`None`
    /// matches every instance).
    failures: HashMap<(SimOperation, Option<String>), String>,
    withheld_addresses: HashSet<String>,
    /// Addresses a guest reports instead of its own, with the number of
    /// polls left (`None` for every poll).
    reported_addresses: HashMap<String, (IpAddr, Option<usize>)>,
}

impl ComputeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn script(&mut self, steps: Vec<TaskInfo>) -> TaskId {
        let id = TaskId(self.next_id("task"));
        self.tasks.insert(id.clone(), steps.into());
        id
    }

    fn failure(&self, op: SimOperation, name: &str) -> Option<String> {
        self.failures
            .get(&(op, Some(name.to_string())))
            .or_else(|| self.failures.get(&(op, None)))
            .cloned()
    }

    /// Scripts a task that either fails with an injected failure or runs
    /// `apply` and succeeds.
    fn task<F>(
        &mut self,
        op: SimOperation,
        name: &str,
        apply: F,
    ) -> TaskId
    where
        F: FnOnce(&mut ComputeState) -> Option<TaskResult>,
    {
        let running = TaskInfo {
            state: TaskState::Running,
            result: None,
            error: None,
        };
        let last = match self.failure(op, name) {
            Some(message) => TaskInfo {
                state: TaskState::Error,
                result: None,
                error: Some(message),
            },
            None => TaskInfo {
                state: TaskState::Success,
                result: apply(self),
                error: None,
            },
        };
        self.script(vec![
            TaskInfo { state: TaskState::Queued, result: None, error: None },
            running,
            last,
        ])
    }

    fn instance(&self, vm: &ObjectRef) -> Result<&SimInstance, ComputeError> {
        self.instances.get(&vm.id).ok_or_else(|| ComputeError::NotFound {
            kind: "instance",
            name: vm.id.clone(),
        })
    }

    fn instance_mut(
        &mut self,
        vm: &ObjectRef,
    ) -> Result<&mut SimInstance, ComputeError> {
        self.instances.get_mut(&vm.id).ok_or_else(|| ComputeError::NotFound {
            kind: "instance",
            name: vm.id.clone(),
        })
    }
}

pub struct SimComputePlane {
    log: Logger,
    events: SimEventLog,
    state: Mutex<ComputeState>,
}

impl SimComputePlane {
    pub fn new(log: &Logger) -> SimComputePlane {
        SimComputePlane::with_events(log, &SimEventLog::default())
    }

    pub fn with_events(log: &Logger, events: &SimEventLog) -> SimComputePlane {
        SimComputePlane {
            log: log.clone(),
            events: events.clone(),
            state: Mutex::new(ComputeState::default()),
        }
    }

    /// Registers a task that reports `steps` in order, repeating the last one.
    pub fn script_task(&self, steps: Vec<TaskInfo>) -> TaskId {
        self.state.lock().unwrap().script(steps)
    }

    /// Adds a powered-on instance.
    pub fn add_instance(
        &self,
        name: &str,
        hostname: Option<&str>,
        addresses: Vec<IpAddr>,
    ) -> ObjectRef {
        let mut state = self.state.lock().unwrap();
        let vm = ObjectRef::new(ObjectKind::Instance, state.next_id("vm"));
        let info = InstanceInfo {
            vm: vm.clone(),
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            hostname: hostname.map(str::to_string),
            power_state: PowerState::PoweredOn,
            addresses,
        };
        state.instances.insert(
            vm.id.clone(),
            SimInstance {
                guest_address: info.addresses.first().copied(),
                info,
                pending_addressing: None,
            },
        );
        vm
    }

    pub fn mark_missing(&self, kind: ObjectKind, name: &str) {
        self.state.lock().unwrap().missing.insert((kind, name.to_string()));
    }

    /// Makes tasks of `op` fail, for the instance called `name` or for every
    /// instance.
    pub fn fail_operation(
        &self,
        op: SimOperation,
        name: Option<&str>,
        message: &str,
    ) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((op, name.map(str::to_string)), message.to_string());
    }

    /// Keeps the named instance from ever reporting a guest address.
    pub fn withhold_guest_address(&self, name: &str) {
        self.state.lock().unwrap().withheld_addresses.insert(name.to_string());
    }

    /// Makes the named instance report `address` as its guest address, for
    /// the next `polls` polls or for good when `polls` is `None`.
    pub fn report_guest_address(
        &self,
        name: &str,
        address: IpAddr,
        polls: Option<usize>,
    ) {
        self.state
            .lock()
            .unwrap()
            .reported_addresses
            .insert(name.to_string(), (address, polls));
    }

    pub fn instance(&self, name: &str) -> Option<InstanceInfo> {
        self.state
            .lock()
            .unwrap()
            .instances
            .values()
            .find(|i| i.info.name == name)
            .map(|i| i.info.clone())
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    fn find(
        &self,
        kind: ObjectKind,
        name: &str,
    ) -> Result<ObjectRef, ComputeError> {
        let state = self.state.lock().unwrap();
        if state.missing.contains(&(kind, name.to_string())) {
            return Err(ComputeError::NotFound {
                kind: kind_name(kind),
                name: name.to_string(),
            });
        }
        Ok(ObjectRef::new(kind, name))
    }

    fn clone_instance(
        &self,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<TaskId, ComputeError> {
        self.events.push(SimEvent::Clone { name: name.to_string() });
        let mut state = self.state.lock().unwrap();
        debug!(self.log, "clone"; "name" => name, "spec" => ?spec);
        let owned_name = name.to_string();
        Ok(state.task(SimOperation::Clone, name, move |state| {
            let vm = ObjectRef::new(ObjectKind::Instance, state.next_id("vm"));
            let info = InstanceInfo {
                vm: vm.clone(),
                uuid: Uuid::new_v4(),
                name: owned_name,
                hostname: None,
                power_state: PowerState::PoweredOff,
                addresses: Vec::new(),
            };
            state.instances.insert(
                vm.id.clone(),
                SimInstance {
                    info,
                    pending_addressing: None,
                    guest_address: None,
                },
            );
            Some(TaskResult::Instance(vm))
        }))
    }

    fn instance_task<F>(
        &self,
        op: SimOperation,
        vm: &ObjectRef,
        apply: F,
    ) -> Result<TaskId, ComputeError>
    where
        F: FnOnce(&mut ComputeState, &ObjectRef),
    {
        let mut state = self.state.lock().unwrap();
        let name = state.instance(vm)?.info.name.clone();
        let vm = vm.clone();
        Ok(state.task(op, &name, move |state| {
            apply(state, &vm);
            None
        }))
    }
}

fn kind_name(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Template => "template",
        ObjectKind::Network => "network",
        ObjectKind::Folder => "folder",
        ObjectKind::Compute => "compute resource",
        ObjectKind::Datastore => "datastore",
        ObjectKind::StoragePod => "datastore cluster",
        ObjectKind::Instance => "instance",
    }
}

#[async_trait]
impl ComputePlane for SimComputePlane {
    async fn find_template(
        &self,
        name: &str,
    ) -> Result<ObjectRef, ComputeError> {
        self.find(ObjectKind::Template, name)
    }

    async fn find_network(
        &self,
        name: &str,
    ) -> Result<ObjectRef, ComputeError> {
        self.find(ObjectKind::Network, name)
    }

    async fn find_folder(&self, path: &str) -> Result<ObjectRef, ComputeError> {
        self.find(ObjectKind::Folder, path)
    }

    async fn find_compute(
        &self,
        path: &str,
    ) -> Result<ObjectRef, ComputeError> {
        self.find(ObjectKind::Compute, path)
    }

    async fn find_storage(
        &self,
        target: &StorageTarget,
    ) -> Result<ObjectRef, ComputeError> {
        match target {
            StorageTarget::Datastore(name) => {
                self.find(ObjectKind::Datastore, name)
            }
            StorageTarget::DatastoreCluster(name) => {
                self.find(ObjectKind::StoragePod, name)
            }
        }
    }

    async fn clone_vm(
        &self,
        _template: &ObjectRef,
        _folder: &ObjectRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<TaskId, ComputeError> {
        self.clone_instance(name, spec)
    }

    async fn recommend_storage_placement(
        &self,
        request: &PlacementRequest,
    ) -> Result<TaskId, ComputeError> {
        self.clone_instance(&request.name, &request.clone_spec)
    }

    async fn reconfigure(
        &self,
        vm: &ObjectRef,
        spec: &ConfigSpec,
    ) -> Result<TaskId, ComputeError> {
        self.events.push(SimEvent::Reconfigure { vm: vm.clone() });
        debug!(self.log, "reconfigure"; "vm" => %vm, "spec" => ?spec);
        self.instance_task(SimOperation::Reconfigure, vm, |_, _| ())
    }

    async fn customize(
        &self,
        vm: &ObjectRef,
        spec: &CustomizationSpec,
    ) -> Result<TaskId, ComputeError> {
        self.events.push(SimEvent::Customize { vm: vm.clone() });
        let spec = spec.clone();
        self.instance_task(SimOperation::Customize, vm, move |state, vm| {
            if let Ok(instance) = state.instance_mut(vm) {
                instance.info.hostname = Some(spec.hostname);
                instance.pending_addressing = Some(spec.addressing);
            }
        })
    }

    async fn power_on(&self, vm: &ObjectRef) -> Result<TaskId, ComputeError> {
        self.events.push(SimEvent::PowerOn { vm: vm.clone() });
        self.instance_task(SimOperation::PowerOn, vm, |state, vm| {
            // Leases come from the top of the simulated subnet.
            let host = state.next_dhcp_host.wrapping_add(1).clamp(1, 54);
            state.next_dhcp_host = host;
            let Some(instance) = state.instances.get_mut(&vm.id) else {
                return;
            };
            instance.info.power_state = PowerState::PoweredOn;
            if state.withheld_addresses.contains(&instance.info.name) {
                return;
            }
            let address = match instance.pending_addressing {
                Some(GuestAddressing::Static { address, .. }) => address,
                Some(GuestAddressing::Dhcp) | None => {
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200 + host))
                }
            };
            instance.guest_address = Some(address);
            instance.info.addresses = vec![address];
        })
    }

    async fn power_off(&self, vm: &ObjectRef) -> Result<TaskId, ComputeError> {
        self.events.push(SimEvent::PowerOff { vm: vm.clone() });
        self.instance_task(SimOperation::PowerOff, vm, |state, vm| {
            if let Ok(instance) = state.instance_mut(vm) {
                instance.info.power_state = PowerState::PoweredOff;
            }
        })
    }

    async fn reset(&self, vm: &ObjectRef) -> Result<TaskId, ComputeError> {
        self.events.push(SimEvent::Reset { vm: vm.clone() });
        self.instance_task(SimOperation::Reset, vm, |state, vm| {
            if let Ok(instance) = state.instance_mut(vm) {
                instance.info.power_state = PowerState::PoweredOn;
            }
        })
    }

    async fn reboot_guest(&self, vm: &ObjectRef) -> Result<(), ComputeError> {
        self.events.push(SimEvent::RebootGuest { vm: vm.clone() });
        let state = self.state.lock().unwrap();
        let instance = state.instance(vm)?;
        if let Some(message) =
            state.failure(SimOperation::RebootGuest, &instance.info.name)
        {
            return Err(ComputeError::Rejected(message));
        }
        if instance.info.power_state != PowerState::PoweredOn {
            return Err(ComputeError::Rejected(format!(
                "{} is not running",
                instance.info.name
            )));
        }
        Ok(())
    }

    async fn destroy(&self, vm: &ObjectRef) -> Result<TaskId, ComputeError> {
        self.events.push(SimEvent::Destroy { vm: vm.clone() });
        self.instance_task(SimOperation::Destroy, vm, |state, vm| {
            state.instances.remove(&vm.id);
        })
    }

    async fn poll_task(&self, task: &TaskId) -> Result<TaskInfo, ComputeError> {
        let mut state = self.state.lock().unwrap();
        let steps = state.tasks.get_mut(task).ok_or_else(|| {
            ComputeError::NotFound { kind: "task", name: task.to_string() }
        })?;
        let info = if steps.len() > 1 { steps.pop_front() } else { None };
        match info.or_else(|| steps.front().cloned()) {
            Some(info) => Ok(info),
            None => Err(ComputeError::Rejected(format!(
                "task {task} has no scripted states"
            ))),
        }
    }

    async fn power_state(
        &self,
        vm: &ObjectRef,
    ) -> Result<PowerState, ComputeError> {
        Ok(self.state.lock().unwrap().instance(vm)?.info.power_state)
    }

    async fn guest_address(
        &self,
        vm: &ObjectRef,
    ) -> Result<Option<IpAddr>, ComputeError> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instance(vm)?;
        let actual = instance.guest_address;
        let name = instance.info.name.clone();
        if actual.is_none() {
            return Ok(None);
        }
        match state.reported_addresses.get_mut(&name) {
            Some((address, None)) => Ok(Some(*address)),
            Some((address, Some(polls))) if *polls > 0 => {
                *polls -= 1;
                Ok(Some(*address))
            }
            _ => Ok(actual),
        }
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceInfo>, ComputeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|i| filter.matches(&i.info.name))
            .map(|i| i.info.clone())
            .collect())
    }

    async fn find_instance(
        &self,
        lookup: &InstanceLookup,
    ) -> Result<Option<InstanceInfo>, ComputeError> {
        let state = self.state.lock().unwrap();
        let found = state.instances.values().find(|i| match lookup {
            InstanceLookup::Uuid(uuid) => i.info.uuid == *uuid,
            InstanceLookup::Address(address) => {
                i.info.addresses.contains(address)
            }
            InstanceLookup::Fqdn(fqdn) => {
                let host = fqdn.split('.').next().unwrap_or(fqdn.as_str());
                i.info.hostname.as_deref() == Some(host)
            }
            InstanceLookup::Name(name) => i.info.name == *name,
        });
        Ok(found.map(|i| i.info.clone()))
    }
}
