// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

//! JSON bodies exchanged with the discovery service.

use crate::discovery::AddressRecord;
use crate::endpoint::Endpoint;
use serde::{Deserialize, Serialize};

pub const REGISTER_PATH: &str = "/v1/register";
pub const RESOLVE_PATH: &str = "/v1/resolve";
pub const DEREGISTER_PATH: &str = "/v1/deregister";
pub const INSTANCES_PATH: &str = "/v1/instances";
pub const HEALTH_PATH: &str = "/healthz";

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterResponse {
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancesResponse {
    pub instances: Vec<AddressRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
