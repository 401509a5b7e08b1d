// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ctlplane/ctlplane.yaml";
pub const DEFAULT_MANIFEST_PATH: &str = "/etc/ctlplane/manifest.yaml";
pub const DEFAULT_DISCOVERY_SOCKET: &str = "/run/ctlplane/discovery.sock";
pub const DEFAULT_RUNNER_BINARY: &str = "ctlplane-runner";

const ENV_CONFIG: &str = "CTLPLANE_CONFIG";
/// Log level of the daemon and, through the daemon, of every runner host.
pub const ENV_LOG_LEVEL: &str = "CTLPLANE_LOG_LEVEL";
const ENV_MANIFEST: &str = "CTLPLANE_MANIFEST";
const ENV_DISCOVERY_SOCKET: &str = "CTLPLANE_DISCOVERY_SOCKET";
const ENV_RUNNER_COMMAND: &str = "CTLPLANE_RUNNER_COMMAND";

/// Daemon configuration: YAML file first, then environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    /// Daemon log lines are also appended here when set.
    pub log_file: Option<PathBuf>,
    pub manifest: PathBuf,
    pub discovery: DiscoverySettings,
    pub supervisor: SupervisorSettings,
    /// Topology parameters visible to instance conditions.
    pub topology: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            manifest: PathBuf::from(DEFAULT_MANIFEST_PATH),
            discovery: DiscoverySettings::default(),
            supervisor: SupervisorSettings::default(),
            topology: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub socket: PathBuf,
    pub cache_ttl_ms: u64,
    pub cache_capacity: usize,
    pub retry_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_DISCOVERY_SOCKET),
            cache_ttl_ms: 2_000,
            cache_capacity: 256,
            retry_attempts: 5,
            retry_initial_backoff_ms: 50,
            retry_max_backoff_ms: 1_000,
            request_timeout_ms: 1_000,
        }
    }
}

impl DiscoverySettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// When a freshly spawned runner counts as running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessMode {
    /// Discovery answers a ping; other runners have announced themselves.
    #[default]
    Announced,
    /// As soon as the process exists.
    Spawned,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunnerCommand {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment for the runner host.
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerCommand {
    fn default() -> Self {
        Self {
            command: DEFAULT_RUNNER_BINARY.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl RunnerCommand {
    /// Prefer a runner binary installed next to the running executable when
    /// the command is the bare default name.
    pub fn resolve_sibling(mut self) -> Self {
        if self.command == DEFAULT_RUNNER_BINARY
            && let Ok(exe) = std::env::current_exe()
            && let Some(dir) = exe.parent()
        {
            let sibling = dir.join(DEFAULT_RUNNER_BINARY);
            if sibling.exists() {
                self.command = sibling.display().to_string();
            }
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub stop_timeout_secs: u64,
    pub readiness_timeout_secs: u64,
    pub readiness: ReadinessMode,
    /// Default runner host command.
    pub runner: RunnerCommand,
    /// Per runner type overrides of `runner`.
    pub runners: BTreeMap<String, RunnerCommand>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 10,
            readiness_timeout_secs: 10,
            readiness: ReadinessMode::Announced,
            runner: RunnerCommand::default(),
            runners: BTreeMap::new(),
        }
    }
}

impl SupervisorSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn command_for(&self, runner_type: &str) -> &RunnerCommand {
        self.runners.get(runner_type).unwrap_or(&self.runner)
    }

    /// Set `key` on every runner command that does not set it already.
    pub fn default_runner_env(&mut self, key: &str, value: &str) {
        for command in std::iter::once(&mut self.runner).chain(self.runners.values_mut()) {
            command
                .env
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }
    }
}

/// `--config` flag, then `CTLPLANE_CONFIG`, then the default location.
pub fn config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var(ENV_CONFIG).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl Settings {
    /// Load `path` if it exists, then apply environment overrides.
    /// A missing file is not an error; environment variables may be enough.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_yaml_str(&contents).with_context(|| format!("parsing {}", path.display()))?
        } else {
            warn!(
                "config file not found at {}, using defaults and environment",
                path.display()
            );
            Self::default()
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        if let Ok(manifest) = std::env::var(ENV_MANIFEST) {
            self.manifest = PathBuf::from(manifest);
        }
        if let Ok(socket) = std::env::var(ENV_DISCOVERY_SOCKET) {
            self.discovery.socket = PathBuf::from(socket);
        }
        if let Ok(command) = std::env::var(ENV_RUNNER_COMMAND) {
            self.supervisor.runner.command = command;
        }
    }
}
