// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated configuration-management bootstrap.

use super::SimEvent;
use super::SimEventLog;
use crate::backends::BootstrapRequest;
use crate::backends::Bootstrapper;
use crate::error::BootstrapError;
use async_trait::async_trait;
use slog::info;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

#[derive(Default)]
struct BootstrapState {
    nodes: BTreeMap<String, (IpAddr, BootstrapRequest)>,
    failing: HashSet<String>,
    fail_deregister: bool,
}

pub struct SimBootstrapper {
    log: Logger,
    events: SimEventLog,
    state: Mutex<BootstrapState>,
}

impl SimBootstrapper {
    pub fn new(log: &Logger) -> SimBootstrapper {
        SimBootstrapper::with_events(log, &SimEventLog::default())
    }

    pub fn with_events(log: &Logger, events: &SimEventLog) -> SimBootstrapper {
        SimBootstrapper {
            log: log.clone(),
            events: events.clone(),
            state: Mutex::new(BootstrapState::default()),
        }
    }

    /// Makes bootstrapping the node `fqdn` fail.
    pub fn fail_for(&self, fqdn: &str) {
        self.state.lock().unwrap().failing.insert(fqdn.to_string());
    }

    pub fn set_deregister_failure(&self, fail: bool) {
        self.state.lock().unwrap().fail_deregister = fail;
    }

    pub fn node(&self, fqdn: &str) -> Option<(IpAddr, BootstrapRequest)> {
        self.state.lock().unwrap().nodes.get(fqdn).cloned()
    }
}

#[async_trait]
impl Bootstrapper for SimBootstrapper {
    async fn bootstrap_node(
        &self,
        address: IpAddr,
        fqdn: &str,
        request: &BootstrapRequest,
    ) -> Result<(), BootstrapError> {
        self.events.push(SimEvent::Bootstrap { fqdn: fqdn.to_string() });
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(fqdn) {
            return Err(BootstrapError::Failed {
                command: String::from("knife bootstrap"),
                status: Some(1),
                stderr: String::from("simulated failure"),
            });
        }
        info!(self.log, "bootstrapped"; "fqdn" => fqdn);
        state.nodes.insert(fqdn.to_string(), (address, request.clone()));
        Ok(())
    }

    async fn deregister_node(&self, fqdn: &str) -> Result<(), BootstrapError> {
        self.events.push(SimEvent::Deregister { fqdn: fqdn.to_string() });
        let mut state = self.state.lock().unwrap();
        if state.fail_deregister {
            return Err(BootstrapError::Failed {
                command: String::from("knife node delete"),
                status: Some(100),
                stderr: String::from("simulated failure"),
            });
        }
        state.nodes.remove(fqdn);
        Ok(())
    }
}
