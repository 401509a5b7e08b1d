// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use crate::endpoint::Endpoint;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub instance_name: String,
    pub endpoint: Endpoint,
    pub registered_at: SystemTime,
}

/// Name to endpoint table. Each key is updated atomically; there is no
/// ordering guarantee across keys.
#[derive(Debug, Default)]
pub struct AddressBook {
    records: DashMap<String, AddressRecord>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for `name`.
    pub fn register(&self, name: &str, endpoint: Endpoint) -> AddressRecord {
        let record = AddressRecord {
            instance_name: name.to_string(),
            endpoint,
            registered_at: SystemTime::now(),
        };
        self.records.insert(name.to_string(), record.clone());
        record
    }

    pub fn resolve(&self, name: &str) -> Option<AddressRecord> {
        self.records.get(name).map(|r| r.value().clone())
    }

    /// Returns whether a record was removed.
    pub fn deregister(&self, name: &str) -> bool {
        self.records.remove(name).is_some()
    }

    /// Snapshot of every record, sorted by instance name.
    pub fn records(&self) -> Vec<AddressRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
