// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use log::debug;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("reading manifest {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate instance name {0:?}")]
    DuplicateName(String),
    #[error("instance #{0} has an empty name")]
    EmptyName(usize),
    #[error("instance {0:?} has an empty runner_type")]
    EmptyRunnerType(String),
}

/// One named unit of the topology, launched as one runner host process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceDefinition {
    pub name: String,
    pub runner_type: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl InstanceDefinition {
    pub fn new(name: &str, runner_type: &str) -> Self {
        Self {
            name: name.to_string(),
            runner_type: runner_type.to_string(),
            condition: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_discovery(&self) -> bool {
        self.runner_type == crate::DISCOVERY_RUNNER_TYPE
    }
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    instances: Vec<InstanceDefinition>,
}

/// Ordered, validated list of instance definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    instances: Vec<InstanceDefinition>,
}

impl Manifest {
    /// Validate and wrap `instances`. Blank conditions are treated as absent.
    pub fn new(mut instances: Vec<InstanceDefinition>) -> Result<Self, ManifestError> {
        let mut seen = HashSet::new();
        for (idx, instance) in instances.iter_mut().enumerate() {
            if instance.name.trim().is_empty() {
                return Err(ManifestError::EmptyName(idx));
            }
            if instance.runner_type.trim().is_empty() {
                return Err(ManifestError::EmptyRunnerType(instance.name.clone()));
            }
            if !seen.insert(instance.name.clone()) {
                return Err(ManifestError::DuplicateName(instance.name.clone()));
            }
            if instance
                .condition
                .as_deref()
                .is_some_and(|c| c.trim().is_empty())
            {
                instance.condition = None;
            }
        }
        Ok(Self { instances })
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ManifestError> {
        // An empty document deserializes as unit, not as a mapping.
        if contents.trim().is_empty() {
            return Self::new(Vec::new());
        }
        let doc: ManifestDocument = serde_yaml::from_str(contents)?;
        Self::new(doc.instances)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let manifest = Self::from_yaml_str(&contents)?;
        debug!(
            "loaded {} instance(s) from {}",
            manifest.len(),
            path.display()
        );
        Ok(manifest)
    }

    pub fn instances(&self) -> &[InstanceDefinition] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
