// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for a freshly provisioned instance to become reachable.

use crate::error::Error;
use crate::poll;
use crate::poll::wait_for_condition;
use crate::poll::Ceiling;
use crate::poll::CondCheckError;
use async_trait::async_trait;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::convert::Infallible;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// A network reachability check.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: IpAddr) -> bool;
}

/// Probes with a single ICMP echo through the system `ping`.
pub struct PingProber {
    log: Logger,
}

impl PingProber {
    pub fn new(log: &Logger) -> PingProber {
        PingProber { log: log.clone() }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, address: IpAddr) -> bool {
        let status = Command::new("ping")
            .args(["-c", "1", "-W", "1"])
            .arg(address.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(self.log, "failed to run ping"; "error" => %e);
                false
            }
        }
    }
}

/// Blocks until an address answers probes, up to a fixed number of
/// attempts.
pub struct ReadinessPoller {
    log: Logger,
    prober: Arc<dyn Prober>,
    interval: Duration,
    max_attempts: usize,
}

impl ReadinessPoller {
    pub fn new(
        log: &Logger,
        prober: Arc<dyn Prober>,
        interval: Duration,
        max_attempts: usize,
    ) -> ReadinessPoller {
        ReadinessPoller {
            log: log.clone(),
            prober,
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Returns once `address` is reachable. An absent address (still waiting
    /// on DHCP) is not probed and counts as ready.
    pub async fn wait(&self, address: Option<IpAddr>) -> Result<(), Error> {
        let Some(address) = address else {
            debug!(self.log, "no address to wait for");
            return Ok(());
        };

        let prober = &self.prober;
        let log = &self.log;
        let result = wait_for_condition(
            || async move {
                if prober.probe(address).await {
                    Ok(())
                } else {
                    debug!(log, "address not reachable yet";
                        "address" => %address);
                    Err(CondCheckError::<Infallible>::NotYet)
                }
            },
            &self.interval,
            Ceiling::Attempts(self.max_attempts),
        )
        .await;

        match result {
            Ok(()) => {
                info!(self.log, "address is reachable"; "address" => %address);
                Ok(())
            }
            Err(poll::Error::PermanentError(never)) => match never {},
            Err(poll::Error::AttemptsExhausted(attempts)) => {
                Err(Error::Unreachable { address, attempts })
            }
            Err(poll::Error::TimedOut(_)) => {
                Err(Error::Unreachable { address, attempts: self.max_attempts })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::test_setup_log;
    use crate::sim::SimProber;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_absent_address_is_not_probed() {
        let log = test_setup_log("test_absent_address_is_not_probed");
        let prober = Arc::new(SimProber::unreachable());
        let poller = ReadinessPoller::new(
            &log,
            prober.clone(),
            Duration::from_millis(1),
            3,
        );
        poller.wait(None).await.unwrap();
        assert_eq!(prober.probes(), 0);
    }

    #[tokio::test]
    async fn test_reachable_after_a_few_probes() {
        let log = test_setup_log("test_reachable_after_a_few_probes");
        let prober = Arc::new(SimProber::reachable_after(3));
        let poller = ReadinessPoller::new(
            &log,
            prober.clone(),
            Duration::from_millis(1),
            5,
        );
        poller.wait(Some("10.0.0.5".parse().unwrap())).await.unwrap();
        assert_eq!(prober.probes(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_after_threshold() {
        let log = test_setup_log("test_unreachable_after_threshold");
        let prober = Arc::new(SimProber::unreachable());
        let poller = ReadinessPoller::new(
            &log,
            prober.clone(),
            Duration::from_millis(1),
            4,
        );
        let address: IpAddr = "10.0.0.6".parse().unwrap();
        let error = poller.wait(Some(address)).await.unwrap_err();
        assert_matches!(
            error,
            Error::Unreachable { address: a, attempts: 4 } if a == address
        );
        assert_eq!(prober.probes(), 4);
    }
}
