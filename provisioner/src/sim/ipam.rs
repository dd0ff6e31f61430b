// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated address-management service.

use super::SimEvent;
use super::SimEventLog;
use crate::backends::AddressId;
use crate::backends::AddressManager;
use crate::backends::AddressPayload;
use crate::backends::AddressQuery;
use crate::backends::AddressRecord;
use crate::backends::SubnetId;
use crate::backends::SubnetInfo;
use crate::error::AddressError;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use slog::debug;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

#[derive(Default)]
struct IpamState {
    next_subnet: u64,
    next_address: u64,
    subnets: BTreeMap<SubnetId, SubnetInfo>,
    records: BTreeMap<AddressId, AddressRecord>,
    releases: HashMap<IpAddr, usize>,
    fail_reserve: bool,
    fail_update: bool,
    fail_release: bool,
}

impl IpamState {
    fn subnet(&self, id: SubnetId) -> Result<&SubnetInfo, AddressError> {
        self.subnets
            .get(&id)
            .ok_or_else(|| AddressError::NotFound(format!("subnet {id}")))
    }

    fn insert(
        &mut self,
        subnet: SubnetId,
        address: IpAddr,
        hostname: Option<String>,
    ) -> AddressId {
        self.next_address += 1;
        let id = AddressId(self.next_address);
        self.records.insert(
            id,
            AddressRecord { id, subnet_id: subnet, address, hostname },
        );
        id
    }
}

pub struct SimAddressManager {
    log: Logger,
    events: SimEventLog,
    state: Mutex<IpamState>,
}

impl SimAddressManager {
    pub fn new(log: &Logger) -> SimAddressManager {
        SimAddressManager::with_events(log, &SimEventLog::default())
    }

    pub fn with_events(
        log: &Logger,
        events: &SimEventLog,
    ) -> SimAddressManager {
        SimAddressManager {
            log: log.clone(),
            events: events.clone(),
            state: Mutex::new(IpamState::default()),
        }
    }

    /// Adds a subnet whose gateway is its first host address.
    pub fn add_subnet(&self, network: IpNetwork) -> SubnetId {
        let mut state = self.state.lock().unwrap();
        state.next_subnet += 1;
        let id = SubnetId(state.next_subnet);
        let gateway = network.iter().nth(1);
        state.subnets.insert(id, SubnetInfo { id, network, gateway });
        id
    }

    /// Records an address as in use, as if someone had registered it.
    pub fn register(
        &self,
        subnet: SubnetId,
        address: IpAddr,
        hostname: Option<&str>,
    ) -> AddressId {
        self.state.lock().unwrap().insert(
            subnet,
            address,
            hostname.map(str::to_string),
        )
    }

    pub fn lookup(&self, address: IpAddr) -> Option<AddressRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .values()
            .find(|r| r.address == address)
            .cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    /// Number of release calls made for `address`, successful or not.
    pub fn release_count(&self, address: IpAddr) -> usize {
        self.state
            .lock()
            .unwrap()
            .releases
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_reserve_failure(&self, fail: bool) {
        self.state.lock().unwrap().fail_reserve = fail;
    }

    pub fn set_update_failure(&self, fail: bool) {
        self.state.lock().unwrap().fail_update = fail;
    }

    pub fn set_release_failure(&self, fail: bool) {
        self.state.lock().unwrap().fail_release = fail;
    }
}

#[async_trait]
impl AddressManager for SimAddressManager {
    async fn reserve_first_free(
        &self,
        subnet: SubnetId,
    ) -> Result<IpAddr, AddressError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reserve {
            return Err(AddressError::ServiceUnavailable(String::from(
                "simulated outage",
            )));
        }
        let info = state.subnet(subnet)?.clone();
        let address = info
            .network
            .iter()
            .skip(1)
            .filter(|a| Some(*a) != info.gateway)
            .find(|a| !state.records.values().any(|r| r.address == *a))
            .ok_or_else(|| {
                AddressError::NotFound(format!("free address in {subnet}"))
            })?;
        state.insert(subnet, address, None);
        debug!(self.log, "reserved"; "address" => %address);
        self.events.push(SimEvent::ReserveAddress { subnet, address });
        Ok(address)
    }

    async fn release_address(
        &self,
        address: IpAddr,
        subnet: SubnetId,
    ) -> Result<(), AddressError> {
        self.events.push(SimEvent::ReleaseAddress { address, subnet });
        let mut state = self.state.lock().unwrap();
        *state.releases.entry(address).or_default() += 1;
        if state.fail_release {
            return Err(AddressError::Http {
                status: 409,
                message: String::from("simulated conflict"),
            });
        }
        let id = state
            .records
            .values()
            .find(|r| r.address == address && r.subnet_id == subnet)
            .map(|r| r.id)
            .ok_or_else(|| AddressError::NotFound(address.to_string()))?;
        state.records.remove(&id);
        Ok(())
    }

    async fn search(
        &self,
        query: &AddressQuery,
    ) -> Result<Vec<AddressRecord>, AddressError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .values()
            .filter(|r| match query {
                AddressQuery::Address(address) => r.address == *address,
                AddressQuery::Hostname(hostname) => {
                    r.hostname.as_deref() == Some(hostname.as_str())
                }
            })
            .cloned()
            .collect())
    }

    async fn create_address(
        &self,
        subnet: SubnetId,
        payload: &AddressPayload,
    ) -> Result<AddressId, AddressError> {
        self.events.push(SimEvent::CreateAddress {
            subnet,
            hostname: payload.hostname.clone(),
        });
        let mut state = self.state.lock().unwrap();
        state.subnet(subnet)?;
        let address = payload.address.ok_or_else(|| AddressError::Http {
            status: 400,
            message: String::from("address is required"),
        })?;
        if state.records.values().any(|r| r.address == address) {
            return Err(AddressError::Http {
                status: 409,
                message: format!("address {address} already exists"),
            });
        }
        Ok(state.insert(subnet, address, Some(payload.hostname.clone())))
    }

    async fn update_address(
        &self,
        id: AddressId,
        payload: &AddressPayload,
    ) -> Result<(), AddressError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_update {
            return Err(AddressError::ServiceUnavailable(String::from(
                "simulated outage",
            )));
        }
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| AddressError::NotFound(format!("address {id}")))?;
        record.hostname = Some(payload.hostname.clone());
        self.events.push(SimEvent::UpdateAddress {
            address: record.address,
            hostname: payload.hostname.clone(),
        });
        Ok(())
    }

    async fn find_subnet_by_cidr(
        &self,
        cidr: IpNetwork,
    ) -> Result<SubnetInfo, AddressError> {
        let state = self.state.lock().unwrap();
        // Search results leave the gateway out, as phpIPAM's do.
        state
            .subnets
            .values()
            .find(|s| s.network == cidr)
            .map(|s| SubnetInfo { gateway: None, ..s.clone() })
            .ok_or_else(|| AddressError::NotFound(format!("subnet {cidr}")))
    }

    async fn get_subnet(
        &self,
        id: SubnetId,
    ) -> Result<SubnetInfo, AddressError> {
        self.state.lock().unwrap().subnet(id).cloned()
    }
}
