// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turning a request for N replicas of a service into instance specs.

use crate::backends::BootstrapRequest;
use crate::config::Config;
use crate::error::Error;
use crate::instance::InstanceSpec;
use crate::instance::NetworkSpec;
use crate::instance::StorageTarget;
use crate::instance::TemplateRef;
use crate::replicas::ReplicaName;
use std::ops::RangeInclusive;

/// Memory sizes, in MiB, an instance may be created with. Sizes must also be
/// a whole number of GiB.
pub const MEMORY_RANGE_MIB: RangeInclusive<u64> = 1024..=65536;

/// What the caller asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateRequest {
    pub service: String,
    pub environment: String,
    pub category: String,
    pub num_cpus: u32,
    pub memory_mib: u64,
    pub replicas: usize,
    /// Overrides the folder of the environment and category.
    pub folder: Option<String>,
    pub bootstrap: bool,
}

/// A request resolved against the configuration, shared by every replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatePlan {
    pub base_name: String,
    pub base_hostname: String,
    pub replicas: usize,
    template: InstanceSpec,
}

impl CreatePlan {
    /// Returns one spec per allocated replica identity.
    pub fn instances(&self, names: &[ReplicaName]) -> Vec<InstanceSpec> {
        names
            .iter()
            .map(|replica| InstanceSpec {
                name: replica.name.clone(),
                hostname: replica.hostname.to_lowercase(),
                ..self.template.clone()
            })
            .collect()
    }

    pub fn storage(&self) -> Option<&StorageTarget> {
        self.template.storage.as_ref()
    }
}

fn required(
    value: Option<String>,
    what: &str,
    env: &str,
) -> Result<String, Error> {
    value.ok_or_else(|| {
        Error::Configuration(format!("no {what} set for environment {env:?}"))
    })
}

fn expand(format: &str, prefix: &str, service: &str, category: &str) -> String {
    format
        .replace("{prefix}", prefix)
        .replace("{service}", service)
        .replace("{category}", category)
}

/// Resolves `request` against the environments, networks and bootstrap
/// settings of `config`. Values set on the category override those of its
/// environment.
pub fn resolve(
    config: &Config,
    request: &CreateRequest,
) -> Result<CreatePlan, Error> {
    let env_key = &request.environment;
    let environment = config.environments.get(env_key).ok_or_else(|| {
        Error::Configuration(format!(
            "environment {env_key:?} is not configured"
        ))
    })?;
    let category =
        environment.categories.get(&request.category).ok_or_else(|| {
            Error::Configuration(format!(
                "category {:?} is not configured in environment {env_key:?}",
                request.category
            ))
        })?;

    if request.memory_mib % 1024 != 0
        || !MEMORY_RANGE_MIB.contains(&request.memory_mib)
    {
        return Err(Error::Configuration(format!(
            "memory size must be a multiple of 1024 MiB between {} and {} \
             MiB, got {}",
            MEMORY_RANGE_MIB.start(),
            MEMORY_RANGE_MIB.end(),
            request.memory_mib
        )));
    }
    if request.num_cpus == 0 {
        return Err(Error::Configuration(String::from(
            "an instance needs at least one CPU",
        )));
    }

    let placement = environment.placement.overridden_by(&category.placement);
    let name_format =
        required(placement.name_format, "name format", env_key)?;
    let hostname_format =
        required(placement.hostname_format, "hostname format", env_key)?;
    let template = required(placement.template, "template", env_key)?;
    let compute = required(placement.compute, "compute resource", env_key)?;
    let folder = match request.folder.clone() {
        Some(folder) => folder,
        None => required(placement.folder, "folder", env_key)?,
    };
    let network_key = required(placement.network, "network", env_key)?;
    let network = config.networks.get(&network_key).ok_or_else(|| {
        Error::Configuration(format!(
            "network {network_key:?} is not configured"
        ))
    })?;

    let category_name =
        category.name.clone().unwrap_or_else(|| request.category.clone());
    let base_name = expand(
        &name_format,
        &environment.prefix,
        &request.service,
        &category_name,
    )
    .to_uppercase();
    let base_hostname = expand(
        &hostname_format,
        &environment.prefix,
        &request.service,
        &category_name,
    )
    .to_lowercase();

    let bootstrap = if request.bootstrap {
        Some(bootstrap_request(config, env_key, &request.category)?)
    } else {
        None
    };

    Ok(CreatePlan {
        replicas: request.replicas,
        template: InstanceSpec {
            name: base_name.clone(),
            hostname: base_hostname.clone(),
            environment: env_key.clone(),
            category: request.category.clone(),
            num_cpus: request.num_cpus,
            memory_mib: request.memory_mib,
            storage: StorageTarget::select(
                placement.datastore.as_deref(),
                placement.datastore_cluster.as_deref(),
            ),
            compute,
            folder,
            network: NetworkSpec {
                name: network.name.clone(),
                cidr: network.cidr,
                domain: network.domain.clone(),
                nameservers: network.nameservers.clone(),
            },
            template: TemplateRef { name: template },
            dhcp: network.dhcp,
            bootstrap,
        },
        base_name,
        base_hostname,
    })
}

fn bootstrap_request(
    config: &Config,
    environment: &str,
    category: &str,
) -> Result<BootstrapRequest, Error> {
    config
        .bootstrap
        .as_ref()
        .and_then(|b| b.request_for(environment, category))
        .ok_or_else(|| {
            Error::Configuration(format!(
                "no bootstrap settings for environment {environment:?}"
            ))
        })
}
