// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and building the loggers and
//! tunables the provisioner runs with.

use crate::backends::BootstrapRequest;
use crate::backends::RecordType;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read config from {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

/// Configuration for the whole provisioner.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Connection settings for the phpIPAM client, when one is used.
    pub ipam: Option<IpamConfig>,
    #[serde(default)]
    pub dns: DnsConfig,
    pub bootstrap: Option<BootstrapConfig>,
    /// Networks instances can be attached to, keyed by the name
    /// environments refer to them by.
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config)
    }
}

/// Timing and parallelism of the orchestrator.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Coordinator invocations allowed to run at once within a batch phase.
    pub parallelism: usize,
    pub task_poll_interval_ms: u64,
    /// Deadline for a single compute-plane task; unbounded when absent.
    pub task_timeout_secs: Option<u64>,
    pub guest_address_poll_interval_ms: u64,
    pub guest_address_timeout_secs: u64,
    pub readiness_interval_ms: u64,
    pub readiness_max_attempts: usize,
    /// Render replica suffixes with two digits (`-01`).
    pub zero_pad_replicas: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            parallelism: 4,
            task_poll_interval_ms: 1000,
            task_timeout_secs: None,
            guest_address_poll_interval_ms: 1000,
            guest_address_timeout_secs: 600,
            readiness_interval_ms: 5000,
            readiness_max_attempts: 50,
            zero_pad_replicas: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn guest_address_poll_interval(&self) -> Duration {
        Duration::from_millis(self.guest_address_poll_interval_ms)
    }

    pub fn guest_address_timeout(&self) -> Duration {
        Duration::from_secs(self.guest_address_timeout_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct IpamConfig {
    /// Base URL of the phpIPAM server, without the `/api` suffix.
    pub endpoint: String,
    pub app_id: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_reserve_retries")]
    pub reserve_retries: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_reserve_retries() -> u32 {
    3
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl IpamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub record_type: RecordType,
    pub ttl: u32,
    /// Bound on one update or zone transfer exchange.
    pub timeout_secs: u64,
    /// Zones that accept dynamic updates, keyed by zone name.
    pub zones: BTreeMap<String, DnsZoneConfig>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            record_type: RecordType::A,
            ttl: 300,
            timeout_secs: 10,
            zones: BTreeMap::new(),
        }
    }
}

impl DnsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn zone(&self, zone: &str) -> Option<&DnsZoneConfig> {
        self.zones.get(zone)
    }

    pub fn record_type_for(&self, zone: &str) -> RecordType {
        self.zone(zone)
            .and_then(|z| z.record_type)
            .unwrap_or(self.record_type)
    }

    pub fn ttl_for(&self, zone: &str) -> u32 {
        self.zone(zone).and_then(|z| z.ttl).unwrap_or(self.ttl)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DnsZoneConfig {
    /// Server accepting updates for the zone, as `host` or `host:port`.
    pub server: String,
    /// TSIG key updates are signed with.
    pub key_name: Option<String>,
    /// Base64-encoded TSIG secret.
    pub key_secret: Option<String>,
    #[serde(default)]
    pub key_algorithm: TsigKeyAlgorithm,
    pub record_type: Option<RecordType>,
    pub ttl: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TsigKeyAlgorithm {
    #[default]
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_knife")]
    pub knife: Utf8PathBuf,
    pub ssh_user: String,
    pub ssh_password: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub secret_file: Option<Utf8PathBuf>,
    /// Reachability probes made before a node is bootstrapped.
    #[serde(default = "default_bootstrap_readiness_attempts")]
    pub readiness_max_attempts: usize,
    #[serde(default)]
    pub environments: BTreeMap<String, BootstrapEnvironment>,
}

fn default_knife() -> Utf8PathBuf {
    Utf8PathBuf::from("knife")
}

fn default_ssh_port() -> u16 {
    22
}

fn default_bootstrap_readiness_attempts() -> usize {
    25
}

impl BootstrapConfig {
    /// Builds the enrollment for an environment/category pair. A category's
    /// run-list replaces the environment's when it is non-empty.
    pub fn request_for(
        &self,
        environment: &str,
        category: &str,
    ) -> Option<BootstrapRequest> {
        let env = self.environments.get(&environment.to_lowercase())?;
        let runlist = env
            .categories
            .get(&category.to_lowercase())
            .map(|c| c.runlist.clone())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| env.runlist.clone());
        Some(BootstrapRequest {
            environment: env.name.clone().unwrap_or_else(|| environment.into()),
            chef_environment: env.chef_environment.clone(),
            runlist,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BootstrapEnvironment {
    /// Tag applied to the node; defaults to the environment key.
    pub name: Option<String>,
    pub chef_environment: Option<String>,
    #[serde(default)]
    pub runlist: Vec<String>,
    #[serde(default)]
    pub categories: BTreeMap<String, BootstrapCategory>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BootstrapCategory {
    #[serde(default)]
    pub runlist: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Port group name in the compute plane.
    pub name: String,
    pub cidr: IpNetwork,
    pub domain: String,
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
    #[serde(default)]
    pub dhcp: bool,
}

/// Placement of new instances. Every field of a category overrides the
/// same field of its environment.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct PlacementConfig {
    pub template: Option<String>,
    pub datastore: Option<String>,
    pub datastore_cluster: Option<String>,
    pub compute: Option<String>,
    pub folder: Option<String>,
    pub network: Option<String>,
    pub name_format: Option<String>,
    pub hostname_format: Option<String>,
}

impl PlacementConfig {
    pub fn overridden_by(&self, other: &PlacementConfig) -> PlacementConfig {
        fn pick(a: &Option<String>, b: &Option<String>) -> Option<String> {
            b.clone().or_else(|| a.clone())
        }
        PlacementConfig {
            template: pick(&self.template, &other.template),
            datastore: pick(&self.datastore, &other.datastore),
            datastore_cluster: pick(
                &self.datastore_cluster,
                &other.datastore_cluster,
            ),
            compute: pick(&self.compute, &other.compute),
            folder: pick(&self.folder, &other.folder),
            network: pick(&self.network, &other.network),
            name_format: pick(&self.name_format, &other.name_format),
            hostname_format: pick(
                &self.hostname_format,
                &other.hostname_format,
            ),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub prefix: String,
    #[serde(flatten)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub categories: BTreeMap<String, CategoryConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct CategoryConfig {
    /// Name substituted for `{category}`; defaults to the category key.
    pub name: Option<String>,
    #[serde(flatten)]
    pub placement: PlacementConfig,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to open log file {path}")]
pub struct LogInitError {
    path: Utf8PathBuf,
    #[source]
    err: std::io::Error,
}

/// The `[log]` table: where log records go and the least severe level kept.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(flatten)]
    pub sink: LogSink,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum LogSink {
    /// Human-readable records on stderr.
    #[default]
    StderrTerminal,
    /// Bunyan records appended to `path`, or written over it with
    /// `truncate`.
    File {
        path: Utf8PathBuf,
        #[serde(default)]
        truncate: bool,
    },
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Level {
        match level {
            LogLevel::Debug => Level::Debug,
            LogLevel::Info => Level::Info,
            LogLevel::Warn => Level::Warning,
            LogLevel::Error => Level::Error,
        }
    }
}

impl LogConfig {
    /// Builds the root logger. Records are written from a background thread,
    /// so the returned logger must outlive anything worth reading.
    pub fn to_logger(
        &self,
        name: &'static str,
    ) -> Result<Logger, LogInitError> {
        let level = Level::from(self.level);
        let log = match &self.sink {
            LogSink::StderrTerminal => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain = slog_term::FullFormat::new(decorator).build();
                async_root_logger(slog::LevelFilter(drain, level).fuse())
            }
            LogSink::File { path, truncate } => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(!truncate)
                    .truncate(*truncate)
                    .open(path)
                    .map_err(|err| LogInitError { path: path.clone(), err })?;
                let drain = slog_bunyan::with_name(name, file).build();
                async_root_logger(slog::LevelFilter(drain, level).fuse())
            }
        };
        Ok(log)
    }
}

fn async_root_logger<D>(drain: D) -> Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("pid" => std::process::id()))
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;
    use slog::info;
    use slog::warn;

    #[test]
    fn test_example_config_parses() {
        let path = Utf8Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("config")
            .join("example.toml");
        let config = Config::from_file(&path).expect("example config");

        assert_eq!(config.orchestrator.parallelism, 4);
        assert_eq!(config.orchestrator.readiness_max_attempts, 50);
        assert_eq!(config.ipam.as_ref().unwrap().reserve_retries, 3);
        assert_eq!(config.dns.ttl_for("prod.example.com"), 300);
        assert_eq!(
            config.dns.record_type_for("prod.example.com"),
            RecordType::A
        );
        assert_eq!(config.dns.ttl_for("lab.example.com"), 60);
        assert_eq!(config.dns.timeout(), Duration::from_secs(5));
        assert_eq!(
            config.dns.zone("lab.example.com").unwrap().key_algorithm,
            TsigKeyAlgorithm::HmacSha512
        );
        assert_eq!(
            config.dns.zone("prod.example.com").unwrap().key_algorithm,
            TsigKeyAlgorithm::HmacSha256
        );

        let env = &config.environments["production"];
        let web = &env.categories["web"];
        let placement = env.placement.overridden_by(&web.placement);
        assert_eq!(placement.datastore_cluster.as_deref(), Some("pod-web"));
        assert_eq!(placement.compute, env.placement.compute);

        let bootstrap = config.bootstrap.as_ref().unwrap();
        assert_eq!(bootstrap.readiness_max_attempts, 25);
        let request = bootstrap.request_for("production", "web").unwrap();
        assert_eq!(request.runlist, vec!["role[base]", "role[web]"]);
        let request = bootstrap.request_for("production", "db").unwrap();
        assert_eq!(request.runlist, vec!["role[base]"]);
        assert_eq!(request.chef_environment.as_deref(), Some("prod"));
    }

    #[test]
    fn test_config_nonexistent() {
        let error = Config::from_file("/nonexistent_provisioner.toml")
            .expect_err("expected config to fail from nonexistent file");
        assert_matches!(error, LoadError::Io { .. });
    }

    #[test]
    fn test_config_bad_log_mode() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[log]\nmode = \"bonkers\"\nlevel = \"info\"\n")
            .unwrap();
        let error = Config::from_file(&path).unwrap_err();
        assert_matches!(error, LoadError::Parse { path: p, .. } if p == path);
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.orchestrator, OrchestratorConfig::default());
        assert_eq!(
            config.orchestrator.readiness_interval(),
            Duration::from_secs(5)
        );
        assert_eq!(config.orchestrator.task_timeout(), None);
        assert!(config.ipam.is_none());
        assert_eq!(config.dns.record_type, RecordType::A);
    }

    #[test]
    fn test_log_table() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.log.level, LogLevel::Info);
        assert_eq!(config.log.sink, LogSink::StderrTerminal);

        let config: Config = toml::from_str(
            "[log]\nmode = \"file\"\npath = \"/var/log/p.log\"\n",
        )
        .unwrap();
        assert_eq!(
            config.log.sink,
            LogSink::File { path: "/var/log/p.log".into(), truncate: false }
        );
    }

    #[test]
    fn test_file_logger() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("logs").join("provisioner.log");
        let config = LogConfig {
            level: LogLevel::Warn,
            sink: LogSink::File { path: path.clone(), truncate: false },
        };
        let error = config.to_logger("test").unwrap_err();
        assert_eq!(error.path, path);

        std::fs::create_dir(dir.path().join("logs")).unwrap();
        {
            let log = config.to_logger("test").unwrap();
            info!(log, "filtered out");
            warn!(log, "kept"; "instance" => "web-1");
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["msg"], "kept");
        assert_eq!(record["instance"], "web-1");
        assert_eq!(record["name"], "test");
    }
}
