// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated dynamic DNS service.

use super::SimEvent;
use super::SimEventLog;
use crate::backends::DnsRecord;
use crate::backends::NameService;
use crate::backends::RecordInfo;
use crate::backends::UpdateStatus;
use crate::error::DnsError;
use async_trait::async_trait;
use slog::debug;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
struct DnsState {
    zones: BTreeMap<String, Vec<DnsRecord>>,
    add_status: Option<String>,
    next_remove_status: Option<String>,
    import_failure: bool,
}

pub struct SimNameService {
    log: Logger,
    events: SimEventLog,
    state: Mutex<DnsState>,
}

impl SimNameService {
    pub fn new(log: &Logger) -> SimNameService {
        SimNameService::with_events(log, &SimEventLog::default())
    }

    pub fn with_events(log: &Logger, events: &SimEventLog) -> SimNameService {
        SimNameService {
            log: log.clone(),
            events: events.clone(),
            state: Mutex::new(DnsState::default()),
        }
    }

    pub fn insert(&self, zone: &str, record: DnsRecord) {
        self.state
            .lock()
            .unwrap()
            .zones
            .entry(zone.to_string())
            .or_default()
            .push(record);
    }

    pub fn records(&self, zone: &str) -> Vec<DnsRecord> {
        self.state
            .lock()
            .unwrap()
            .zones
            .get(zone)
            .cloned()
            .unwrap_or_default()
    }

    /// Answers every add with `status` (`None` restores `NOERROR`).
    pub fn set_add_status(&self, status: Option<&str>) {
        self.state.lock().unwrap().add_status = status.map(str::to_string);
    }

    /// Answers the next remove with `status` instead of removing.
    pub fn fail_next_remove(&self, status: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_remove_status = Some(status.to_string());
    }

    pub fn set_import_failure(&self, fail: bool) {
        self.state.lock().unwrap().import_failure = fail;
    }
}

#[async_trait]
impl NameService for SimNameService {
    async fn add_record(
        &self,
        zone: &str,
        record: &DnsRecord,
    ) -> Result<UpdateStatus, DnsError> {
        self.events.push(SimEvent::AddRecord {
            zone: zone.to_string(),
            name: record.name.clone(),
            content: record.content.clone(),
        });
        let mut state = self.state.lock().unwrap();
        if let Some(status) = &state.add_status {
            return Ok(UpdateStatus(status.clone()));
        }
        state.zones.entry(zone.to_string()).or_default().push(record.clone());
        debug!(self.log, "added record";
            "zone" => zone, "name" => &record.name);
        Ok(UpdateStatus::noerror())
    }

    async fn update_record(
        &self,
        zone: &str,
        record: &DnsRecord,
    ) -> Result<UpdateStatus, DnsError> {
        self.events.push(SimEvent::UpdateRecord {
            zone: zone.to_string(),
            name: record.name.clone(),
            content: record.content.clone(),
        });
        let mut state = self.state.lock().unwrap();
        let records = state.zones.entry(zone.to_string()).or_default();
        records.retain(|r| {
            !(r.name == record.name && r.record_type == record.record_type)
        });
        records.push(record.clone());
        Ok(UpdateStatus::noerror())
    }

    async fn remove_record(
        &self,
        zone: &str,
        record: &DnsRecord,
    ) -> Result<UpdateStatus, DnsError> {
        self.events.push(SimEvent::RemoveRecord {
            zone: zone.to_string(),
            name: record.name.clone(),
        });
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.next_remove_status.take() {
            return Ok(UpdateStatus(status));
        }
        if let Some(records) = state.zones.get_mut(zone) {
            records.retain(|r| {
                !(r.name == record.name
                    && r.record_type == record.record_type
                    && r.content == record.content)
            });
        }
        Ok(UpdateStatus::noerror())
    }

    async fn import_zone_records(
        &self,
        zone: &str,
    ) -> Result<Vec<RecordInfo>, DnsError> {
        let state = self.state.lock().unwrap();
        if state.import_failure {
            return Err(DnsError::Transport {
                zone: zone.to_string(),
                message: String::from("simulated transfer failure"),
            });
        }
        Ok(state
            .zones
            .get(zone)
            .map(|records| {
                records
                    .iter()
                    .map(|record| RecordInfo {
                        zone: zone.to_string(),
                        record: record.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
