// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use anyhow::{Context, Result};
use ctlplane::catalog::RegistrarCatalog;
use ctlplane::config::ENV_LOG_LEVEL;
use ctlplane::identity::RunnerIdentity;
use ctlplane::runner::{self, RunnerExit};
use log::error;

fn main() {
    let level = std::env::var(ENV_LOG_LEVEL).unwrap_or_default();
    // Nothing to log to without a logger.
    if ctlplane_log::init("ctlplane-runner", ctlplane_log::parse_level(&level)).is_err() {
        std::process::exit(RunnerExit::UnhandledFailure.code());
    }

    let exit = match run() {
        Ok(exit) => exit,
        Err(e) => {
            error!("{e:#}");
            RunnerExit::UnhandledFailure
        }
    };
    log::logger().flush();
    std::process::exit(exit.code());
}

fn run() -> Result<RunnerExit> {
    let identity = RunnerIdentity::from_env()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let catalog = RegistrarCatalog::with_builtins();
    let exit = runtime.block_on(runner::run(identity, &catalog));
    // Leftover connection tasks must not hold the process open.
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    Ok(exit)
}
