// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use anyhow::{Context, Result};
use clap::Parser;
use ctlplane::condition::{self, ConditionContext};
use ctlplane::config::{self, ENV_LOG_LEVEL, Settings};
use ctlplane::discovery::DiscoveryClient;
use ctlplane::expression::BasicEvaluator;
use ctlplane::manifest::Manifest;
use ctlplane::supervisor::Supervisor;
use ctlplane_log::Logger;
use log::{error, info, warn};
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};

/// Local control plane daemon
#[derive(Parser, Debug)]
#[command(name = "ctlplaned")]
#[command(about = "Boot and supervise the runner hosts listed in a manifest")]
struct Args {
    /// Daemon configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Manifest file, overriding the configured one
    #[arg(short, long)]
    manifest: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = config::config_path(args.config);
    let mut settings = Settings::load(&config_path)?;
    if let Some(manifest) = args.manifest {
        settings.manifest = manifest;
    }

    let mut logger = Logger::new("ctlplaned", ctlplane_log::parse_level(&settings.log_level));
    if let Some(path) = &settings.log_file {
        logger = logger
            .with_file(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
    }
    logger.install()?;
    info!(
        "ctlplaned starting (version {}, config {})",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    let manifest = Manifest::load(&settings.manifest)
        .with_context(|| format!("loading manifest {}", settings.manifest.display()))?;
    let context = ConditionContext::from_config_and_env(&settings.topology);
    let active = condition::filter(manifest.instances(), &context, &BasicEvaluator)
        .inspect_err(|e| error!("{e}"))?;
    info!(
        "{} of {} instance(s) active",
        active.len(),
        manifest.len()
    );

    // Install handlers before spawning so no signal is missed.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    settings
        .supervisor
        .default_runner_env(ENV_LOG_LEVEL, &settings.log_level);
    let stop_timeout = settings.supervisor.stop_timeout();
    let discovery = DiscoveryClient::from_settings(&settings.discovery);
    let mut supervisor = Supervisor::new(settings.supervisor, discovery);
    for handle in supervisor.start(&active).await {
        info!("[{}] {} (type={})", handle.name, handle.status, handle.runner_type);
    }

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break;
            }
            event = supervisor.next_event() => match event {
                Some(event) => warn!("[{}] is now {}", event.name, event.status),
                None => {
                    warn!("no runner host left");
                    break;
                }
            },
        }
    }

    info!("ctlplaned shutting down");
    supervisor.stop_all(stop_timeout).await;
    Ok(())
}
