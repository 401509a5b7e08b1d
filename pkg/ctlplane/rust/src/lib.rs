// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

//! Local control plane: boots runner hosts from a manifest, supervises them,
//! and lets them find and call each other.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )
)]

pub mod catalog;
pub mod condition;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod expression;
pub mod identity;
pub mod liveness;
pub mod manifest;
pub mod process;
pub mod rpc;
pub mod runner;
pub mod state;
pub mod supervisor;

/// Runner type of the instance serving the discovery service.
pub const DISCOVERY_RUNNER_TYPE: &str = "discovery";
