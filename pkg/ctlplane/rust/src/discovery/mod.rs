// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

//! Host-local service discovery: instance name to endpoint, served over a
//! unix-domain socket by the `discovery` runner.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{DiscoveryClient, DiscoveryError, RetryPolicy};
pub use registry::{AddressBook, AddressRecord};
pub use server::{BindError, DiscoveryServer};
