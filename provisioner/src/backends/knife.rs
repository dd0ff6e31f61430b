// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chef enrollment through the `knife` command-line tool.

use super::BootstrapRequest;
use super::Bootstrapper;
use crate::config::BootstrapConfig;
use crate::error::BootstrapError;
use crate::readiness::Prober;
use crate::readiness::ReadinessPoller;
use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog::info;
use slog::o;
use slog::Logger;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

const SSH_PASSWORD_FLAG: &str = "--ssh-password";

pub struct KnifeBootstrapper {
    log: Logger,
    knife: Utf8PathBuf,
    ssh_user: String,
    ssh_password: String,
    ssh_port: u16,
    secret_file: Option<Utf8PathBuf>,
    readiness: ReadinessPoller,
}

impl KnifeBootstrapper {
    /// Nodes are probed every `interval` before bootstrapping, up to the
    /// configured number of attempts.
    pub fn new(
        log: &Logger,
        config: &BootstrapConfig,
        prober: Arc<dyn Prober>,
        interval: Duration,
    ) -> KnifeBootstrapper {
        let log = log.new(o!("component" => "KnifeBootstrapper"));
        let readiness = ReadinessPoller::new(
            &log,
            prober,
            interval,
            config.readiness_max_attempts,
        );
        KnifeBootstrapper {
            log,
            knife: config.knife.clone(),
            ssh_user: config.ssh_user.clone(),
            ssh_password: config.ssh_password.clone(),
            ssh_port: config.ssh_port,
            secret_file: config.secret_file.clone(),
            readiness,
        }
    }

    fn bootstrap_args(
        &self,
        address: IpAddr,
        fqdn: &str,
        request: &BootstrapRequest,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "bootstrap".into(),
            address.to_string(),
            "--yes".into(),
            "--sudo".into(),
            "--node-name".into(),
            fqdn.into(),
            "--ssh-user".into(),
            self.ssh_user.clone(),
            "--ssh-port".into(),
            self.ssh_port.to_string(),
            SSH_PASSWORD_FLAG.into(),
            self.ssh_password.clone(),
        ];
        if let Some(environment) = &request.chef_environment {
            args.extend(["--environment".into(), environment.clone()]);
        }
        if let Some(secret_file) = &self.secret_file {
            args.extend(["--secret-file".into(), secret_file.to_string()]);
        }
        if !request.runlist.is_empty() {
            args.extend(["--run-list".into(), request.runlist.join(",")]);
        }
        args
    }

    async fn knife(&self, args: Vec<String>) -> Result<(), BootstrapError> {
        let command = describe(&self.knife, &args);
        info!(self.log, "running knife"; "command" => &command);
        let output = Command::new(&self.knife)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| BootstrapError::Spawn {
                command: command.clone(),
                err,
            })?;
        if !output.status.success() {
            return Err(BootstrapError::Failed {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// Renders a command line for logs and errors, with the SSH password
/// masked.
fn describe(program: &Utf8Path, args: &[String]) -> String {
    let mut words = vec![program.to_string()];
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            words.push(String::from("********"));
        } else {
            words.push(arg.clone());
        }
        mask_next = arg == SSH_PASSWORD_FLAG;
    }
    words.join(" ")
}

#[async_trait]
impl Bootstrapper for KnifeBootstrapper {
    async fn bootstrap_node(
        &self,
        address: IpAddr,
        fqdn: &str,
        request: &BootstrapRequest,
    ) -> Result<(), BootstrapError> {
        self.readiness
            .wait(Some(address))
            .await
            .map_err(|_| BootstrapError::Unreachable { address })?;

        self.knife(self.bootstrap_args(address, fqdn, request)).await?;
        self.knife(vec![
            "tag".into(),
            "create".into(),
            "--yes".into(),
            fqdn.into(),
            request.environment.clone(),
        ])
        .await?;
        info!(self.log, "node bootstrapped"; "fqdn" => fqdn);
        Ok(())
    }

    async fn deregister_node(&self, fqdn: &str) -> Result<(), BootstrapError> {
        for kind in ["node", "client"] {
            self.knife(vec![
                kind.into(),
                "delete".into(),
                "--yes".into(),
                fqdn.into(),
            ])
            .await?;
        }
        info!(self.log, "node deregistered"; "fqdn" => fqdn);
        Ok(())
    }
}
