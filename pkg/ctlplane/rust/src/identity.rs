// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use crate::manifest::InstanceDefinition;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Environment variable carrying the serialized [`RunnerIdentity`].
pub const IDENTITY_ENV: &str = "CTLPLANE_RUNNER_IDENTITY";

/// Everything a runner host needs to know about itself, handed over by the
/// supervisor at spawn time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerIdentity {
    pub name: String,
    pub runner_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub discovery_socket: PathBuf,
    #[serde(default)]
    pub supervisor_pid: Option<u32>,
}

impl RunnerIdentity {
    pub fn for_instance(
        instance: &InstanceDefinition,
        discovery_socket: PathBuf,
        supervisor_pid: Option<u32>,
    ) -> Self {
        Self {
            name: instance.name.clone(),
            runner_type: instance.runner_type.clone(),
            properties: instance.properties.clone(),
            discovery_socket,
            supervisor_pid,
        }
    }

    pub fn is_discovery(&self) -> bool {
        self.runner_type == crate::DISCOVERY_RUNNER_TYPE
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("serializing runner identity")
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("parsing runner identity")
    }

    /// Read the identity injected by the supervisor.
    pub fn from_env() -> Result<Self> {
        let raw =
            std::env::var(IDENTITY_ENV).with_context(|| format!("{IDENTITY_ENV} is not set"))?;
        Self::decode(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunnerIdentity {
        let instance = InstanceDefinition::new("measure", "idle")
            .with_property("endpoint", "tcp://127.0.0.1:0")
            .with_property("service.signals", "tcp://127.0.0.1:7101");
        RunnerIdentity::for_instance(&instance, PathBuf::from("/tmp/d.sock"), Some(42))
    }

    #[test]
    fn test_for_instance_copies_fields() {
        let id = sample();
        assert_eq!(id.name, "measure");
        assert_eq!(id.runner_type, "idle");
        assert_eq!(id.property("endpoint"), Some("tcp://127.0.0.1:0"));
        assert_eq!(id.supervisor_pid, Some(42));
        assert!(!id.is_discovery());
    }

    #[test]
    fn test_encode_decode() {
        let id = sample();
        let raw = id.encode().unwrap();
        assert!(raw.contains("\"runner_type\":\"idle\""));
        assert_eq!(RunnerIdentity::decode(&raw).unwrap(), id);
    }

    #[test]
    fn test_decode_minimal() {
        let id = RunnerIdentity::decode(
            r#"{"name":"d","runner_type":"discovery","discovery_socket":"/run/x.sock"}"#,
        )
        .unwrap();
        assert!(id.is_discovery());
        assert!(id.properties.is_empty());
        assert_eq!(id.supervisor_pid, None);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(RunnerIdentity::decode("not json").is_err());
    }

    #[test]
    fn test_from_env() {
        let raw = sample().encode().unwrap();
        temp_env::with_var(IDENTITY_ENV, Some(raw), || {
            assert_eq!(RunnerIdentity::from_env().unwrap(), sample());
        });
        temp_env::with_var_unset(IDENTITY_ENV, || {
            assert!(RunnerIdentity::from_env().is_err());
        });
    }
}
