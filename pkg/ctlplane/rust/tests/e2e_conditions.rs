// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

mod helpers;

use helpers::{DaemonHandle, STARTUP_TIMEOUT};
use nix::sys::signal::Signal;
use std::time::Duration;

const MANIFEST: &str = r#"
instances:
  - name: discovery
    runner_type: discovery
  - name: prod-only
    runner_type: idle
    condition: "Env == 'prod'"
  - name: dev-only
    runner_type: idle
    condition: "Env == 'dev'"
  - name: lab
    runner_type: idle
    condition: "Site == 'lab' && Env != 'dev'"
"#;

#[test]
fn test_e2e_conditions_select_instances() {
    let mut daemon = DaemonHandle::start_with_env(
        MANIFEST,
        "topology:\n  Env: prod\n  Site: factory",
        &[("CTLPLANE_TOPOLOGY_Site", "lab")],
    );
    daemon.wait_for_log(r"\[prod-only\] running", STARTUP_TIMEOUT);
    // The environment wins over the config file.
    daemon.wait_for_log(r"\[lab\] running", STARTUP_TIMEOUT);
    daemon.wait_for_log("3 of 4 instance", STARTUP_TIMEOUT);
    assert!(daemon.has_log(r"\[dev-only\] condition .* not met"));
    assert!(!daemon.has_log(r"\[dev-only\] spawned"));

    daemon.signal(Signal::SIGTERM);
    assert!(daemon.wait_exit(Duration::from_secs(20)).success());
}

#[test]
fn test_e2e_malformed_condition_aborts_before_spawn() {
    let manifest = r#"
instances:
  - name: discovery
    runner_type: discovery
  - name: broken
    runner_type: idle
    condition: "Env =="
"#;
    let mut daemon = DaemonHandle::start(manifest, "topology:\n  Env: prod");
    let status = daemon.wait_exit(Duration::from_secs(20));
    assert!(!status.success());
    daemon.wait_for_log("broken", Duration::from_secs(1));
    assert!(!daemon.has_log("spawned"));
}

#[test]
fn test_e2e_duplicate_names_abort() {
    let manifest = r#"
instances:
  - name: twin
    runner_type: idle
  - name: twin
    runner_type: idle
"#;
    let mut daemon = DaemonHandle::start(manifest, "");
    assert!(!daemon.wait_exit(Duration::from_secs(20)).success());
    assert!(!daemon.has_log("spawned"));
}
