// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors surfaced by the provisioning workflows and their collaborators.

use crate::instance::InstanceSpec;
use std::net::IpAddr;

/// Any failure of a provisioning or decommissioning workflow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required resource reference is missing or invalid. Raised before
    /// anything is mutated, so nothing needs compensating.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An identity or lookup did not match what the workflow expected.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// A backend asynchronous operation ended in its error state (or never
    /// reached a terminal state within the allotted time).
    #[error("task {label:?} failed{}", fmt_cause(.cause))]
    TaskFailure { label: String, cause: Option<String> },

    #[error("address {address} unreachable after {attempts} attempts")]
    Unreachable { address: IpAddr, attempts: usize },

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// The create saga failed after mutating backends; its compensations
    /// have been replayed.
    #[error("failed to provision instance {}", .spec.name)]
    ProvisioningFailure {
        spec: Box<InstanceSpec>,
        #[source]
        cause: Box<Error>,
    },

    #[error("failed to decommission instance {name}")]
    DecommissionFailure {
        name: String,
        #[source]
        cause: Box<Error>,
    },
}

fn fmt_cause(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!(": {cause}"),
        None => String::new(),
    }
}

impl Error {
    /// Returns the innermost error of a saga-level wrapper.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::ProvisioningFailure { cause, .. }
            | Error::DecommissionFailure { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// Errors from the address-management collaborator.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    /// The service could not be reached or answered with a server error.
    #[error("address management service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("not found in address management: {0}")]
    NotFound(String),

    #[error("address management request failed ({status}): {message}")]
    Http { status: u16, message: String },
}

/// Errors from the compute-plane collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("compute plane unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("compute plane rejected the request: {0}")]
    Rejected(String),
}

/// Errors from the dynamic DNS collaborator.
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    /// The server answered the update with a status other than `NOERROR`.
    #[error("DNS update in zone {zone} rejected: {status}")]
    Rejected { zone: String, status: String },

    #[error("unsupported DNS record type {0:?}")]
    UnsupportedRecordType(String),

    #[error("DNS zone {0:?} is not configured")]
    ZoneNotConfigured(String),

    #[error("bad TSIG key for zone {zone}: {message}")]
    InvalidKey { zone: String, message: String },

    #[error("bad DNS record {name:?}: {message}")]
    InvalidRecord { name: String, message: String },

    #[error("DNS transport error for zone {zone}: {message}")]
    Transport { zone: String, message: String },
}

/// Errors from the configuration-management bootstrap collaborator.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to run {command:?}")]
    Spawn {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("{command:?} exited with {}: {stderr}", fmt_status(.status))]
    Failed { command: String, status: Option<i32>, stderr: String },

    #[error("node at {address} never became reachable")]
    Unreachable { address: IpAddr },
}

fn fmt_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {code}"),
        None => String::from("a signal"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_task_failure_display() {
        let err = Error::TaskFailure {
            label: String::from("clone WEB-1"),
            cause: Some(String::from("disk full")),
        };
        assert_eq!(err.to_string(), "task \"clone WEB-1\" failed: disk full");

        let err =
            Error::TaskFailure { label: String::from("power on"), cause: None };
        assert_eq!(err.to_string(), "task \"power on\" failed");
    }

    #[test]
    fn test_root_cause_unwraps_saga_wrappers() {
        let err = Error::DecommissionFailure {
            name: String::from("WEB-1"),
            cause: Box::new(Error::Resolution(String::from("mismatch"))),
        };
        assert!(matches!(err.root_cause(), Error::Resolution(_)));
    }
}
