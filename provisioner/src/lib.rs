// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning and decommissioning of virtual machine instances across a
//! compute plane, an address-management service, and a dynamic DNS service.
//!
//! None of these backends offers transactions spanning the others, so each
//! single-instance workflow is run as a saga: forward steps record
//! compensating actions in a [`ledger::CompensationLedger`] and a failure
//! replays them in reverse. The [`orchestrator::Provisioner`] fans those
//! sagas out over a batch of instances with bounded parallelism.

pub mod backends;
pub mod backoff;
pub mod batch;
pub mod config;
pub mod error;
pub mod instance;
pub mod ledger;
pub mod orchestrator;
pub mod plan;
pub mod poll;
pub mod readiness;
pub mod replicas;
pub mod sagas;
pub mod sim;
pub mod task;

pub use error::Error;
pub use orchestrator::Provisioner;
