// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

//! gRPC service hosting for runner hosts.

pub mod codec;
pub mod health;
pub mod host;
pub mod registrar;
pub mod status;

pub use host::{BoundEndpoint, HostError, RpcServiceHost};
pub use registrar::{Registrar, RouteBinder, ServiceCollection, ServiceDefinition};
