// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated backends.
//!
//! Each simulated collaborator keeps its state in memory, supports injecting
//! failures, and appends the mutating calls it receives to a shared
//! [`SimEventLog`] so callers can check the order in which a workflow touched
//! the backends.

mod bootstrap;
mod compute;
mod dns;
mod ipam;

pub use bootstrap::SimBootstrapper;
pub use compute::SimComputePlane;
pub use compute::SimOperation;
pub use dns::SimNameService;
pub use ipam::SimAddressManager;

use crate::backends::Backends;
use crate::backends::BootstrapRequest;
use crate::backends::ObjectRef;
use crate::backends::SubnetId;
use crate::config::Config;
use crate::config::DnsZoneConfig;
use crate::config::OrchestratorConfig;
use crate::instance::InstanceSpec;
use crate::instance::NetworkSpec;
use crate::instance::StorageTarget;
use crate::instance::TemplateRef;
use crate::readiness::Prober;
use crate::sagas::SagaContext;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use slog::o;
use slog::Drain;
use slog::Logger;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

/// Returns a logger for a test, writing through the test harness's captured
/// stdout.
pub fn test_setup_log(test_name: &str) -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(Mutex::new(drain).fuse(), o!("test" => test_name.to_string()))
}

/// A mutating call received by a simulated backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    ReserveAddress { subnet: SubnetId, address: IpAddr },
    ReleaseAddress { address: IpAddr, subnet: SubnetId },
    CreateAddress { subnet: SubnetId, hostname: String },
    UpdateAddress { address: IpAddr, hostname: String },
    AddRecord { zone: String, name: String, content: String },
    UpdateRecord { zone: String, name: String, content: String },
    RemoveRecord { zone: String, name: String },
    Clone { name: String },
    Reconfigure { vm: ObjectRef },
    Customize { vm: ObjectRef },
    PowerOn { vm: ObjectRef },
    PowerOff { vm: ObjectRef },
    RebootGuest { vm: ObjectRef },
    Reset { vm: ObjectRef },
    Destroy { vm: ObjectRef },
    Bootstrap { fqdn: String },
    Deregister { fqdn: String },
}

#[derive(Clone, Default)]
pub struct SimEventLog(Arc<Mutex<Vec<SimEvent>>>);

impl SimEventLog {
    pub fn push(&self, event: SimEvent) {
        self.0.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<SimEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Reachability probe whose answers are scripted.
pub struct SimProber {
    probes: AtomicUsize,
    /// Probe number (counting from one) from which probes succeed.
    succeed_from: Option<usize>,
    unreachable: Mutex<HashSet<IpAddr>>,
}

impl SimProber {
    pub fn reachable() -> SimProber {
        SimProber::reachable_after(1)
    }

    pub fn reachable_after(probes: usize) -> SimProber {
        SimProber {
            probes: AtomicUsize::new(0),
            succeed_from: Some(probes),
            unreachable: Mutex::new(HashSet::new()),
        }
    }

    pub fn unreachable() -> SimProber {
        SimProber {
            probes: AtomicUsize::new(0),
            succeed_from: None,
            unreachable: Mutex::new(HashSet::new()),
        }
    }

    pub fn mark_unreachable(&self, address: IpAddr) {
        self.unreachable.lock().unwrap().insert(address);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for SimProber {
    async fn probe(&self, address: IpAddr) -> bool {
        let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.unreachable.lock().unwrap().contains(&address) {
            return false;
        }
        self.succeed_from.is_some_and(|from| n >= from)
    }
}

/// DNS zone and network every simulated environment starts with.
pub const SIM_ZONE: &str = "example.com";
pub const SIM_CIDR: &str = "10.0.0.0/24";

/// A complete set of simulated backends sharing one event log.
pub struct SimEnvironment {
    pub events: SimEventLog,
    pub compute: Arc<SimComputePlane>,
    pub ipam: Arc<SimAddressManager>,
    pub dns: Arc<SimNameService>,
    pub bootstrap: Arc<SimBootstrapper>,
    pub prober: Arc<SimProber>,
    pub subnet: SubnetId,
}

impl SimEnvironment {
    pub fn new(log: &Logger) -> SimEnvironment {
        let events = SimEventLog::default();
        let ipam = Arc::new(SimAddressManager::with_events(log, &events));
        let subnet = ipam.add_subnet(SIM_CIDR.parse().unwrap());
        SimEnvironment {
            compute: Arc::new(SimComputePlane::with_events(log, &events)),
            dns: Arc::new(SimNameService::with_events(log, &events)),
            bootstrap: Arc::new(SimBootstrapper::with_events(log, &events)),
            prober: Arc::new(SimProber::reachable()),
            ipam,
            subnet,
            events,
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            compute: self.compute.clone(),
            addresses: self.ipam.clone(),
            dns: self.dns.clone(),
            bootstrap: Some(self.bootstrap.clone()),
        }
    }

    /// Configuration with the simulated zone and short polling intervals.
    pub fn config(&self) -> Config {
        let mut config = Config {
            orchestrator: OrchestratorConfig {
                parallelism: 4,
                task_poll_interval_ms: 1,
                task_timeout_secs: Some(5),
                guest_address_poll_interval_ms: 1,
                guest_address_timeout_secs: 1,
                readiness_interval_ms: 1,
                readiness_max_attempts: 3,
                zero_pad_replicas: false,
            },
            ..Default::default()
        };
        config.dns.zones.insert(
            SIM_ZONE.to_string(),
            DnsZoneConfig {
                server: String::from("127.0.0.1"),
                key_name: None,
                key_secret: None,
                key_algorithm: Default::default(),
                record_type: None,
                ttl: None,
            },
        );
        config
    }

    pub fn saga_context(&self, log: &Logger) -> SagaContext {
        SagaContext::new(log, Arc::new(self.config()), self.backends())
    }

    /// A statically addressed instance spec on the simulated network.
    pub fn spec(&self, name: &str, hostname: &str) -> InstanceSpec {
        let cidr: IpNetwork = SIM_CIDR.parse().unwrap();
        InstanceSpec {
            name: name.to_string(),
            hostname: hostname.to_string(),
            environment: String::from("test"),
            category: String::from("web"),
            num_cpus: 2,
            memory_mib: 4096,
            storage: Some(StorageTarget::Datastore(String::from("ds-1"))),
            compute: String::from("dc/host/cluster/Resources"),
            folder: String::from("dc/vm/test"),
            network: NetworkSpec {
                name: String::from("VLAN-10"),
                cidr,
                domain: SIM_ZONE.to_string(),
                nameservers: vec!["10.0.0.53".parse().unwrap()],
            },
            template: TemplateRef { name: String::from("tmpl-linux") },
            dhcp: false,
            bootstrap: None,
        }
    }

    pub fn bootstrap_request(&self) -> BootstrapRequest {
        BootstrapRequest {
            environment: String::from("test"),
            chef_environment: None,
            runlist: vec![String::from("role[base]")],
        }
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.events.snapshot()
    }

    pub fn clear_events(&self) {
        self.events.clear();
    }
}
