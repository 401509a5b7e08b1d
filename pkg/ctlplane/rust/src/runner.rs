// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

//! The routine every runner host process executes.

use crate::catalog::RegistrarCatalog;
use crate::discovery::{
    AddressBook, BindError, DiscoveryClient, DiscoveryError, DiscoveryServer, RetryPolicy,
};
use crate::endpoint::Endpoint;
use crate::identity::RunnerIdentity;
use crate::liveness::{DEFAULT_POLL_INTERVAL, ParentMonitor, probe_for};
use crate::rpc::{HostError, RpcServiceHost};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Property naming the endpoint of registrations without a service definition.
pub const ENDPOINT_PROPERTY: &str = "endpoint";
pub const DEFAULT_HOST_ENDPOINT: &str = "tcp://127.0.0.1:0";

const ANNOUNCE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Process exit codes of a runner host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerExit {
    Graceful = 0,
    UnhandledFailure = 1,
    EndpointConflict = 3,
    ParentLost = 4,
}

impl RunnerExit {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RunnerExit::Graceful),
            1 => Some(RunnerExit::UnhandledFailure),
            3 => Some(RunnerExit::EndpointConflict),
            4 => Some(RunnerExit::ParentLost),
            _ => None,
        }
    }
}

impl fmt::Display for RunnerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunnerExit::Graceful => "graceful",
            RunnerExit::UnhandledFailure => "unhandled failure",
            RunnerExit::EndpointConflict => "endpoint conflict",
            RunnerExit::ParentLost => "parent lost",
        };
        f.write_str(text)
    }
}

/// Run the instance described by `identity` until SIGTERM, SIGINT or the
/// loss of the supervisor, and report how it ended.
pub async fn run(identity: RunnerIdentity, catalog: &RegistrarCatalog) -> RunnerExit {
    let cancel = CancellationToken::new();
    run_until(identity, catalog, cancel).await
}

/// [`run`] with an externally owned cancellation token.
pub async fn run_until(
    identity: RunnerIdentity,
    catalog: &RegistrarCatalog,
    cancel: CancellationToken,
) -> RunnerExit {
    let name = identity.name.clone();
    info!(
        "[{name}] runner host starting (type={}, pid={})",
        identity.runner_type,
        std::process::id()
    );

    let parent_lost = Arc::new(AtomicBool::new(false));
    let monitor = identity.supervisor_pid.map(|pid| {
        let lost = parent_lost.clone();
        let token = cancel.clone();
        ParentMonitor::spawn(probe_for(pid), DEFAULT_POLL_INTERVAL, move || {
            lost.store(true, Ordering::SeqCst);
            token.cancel();
        })
    });

    let signals = match listen_for_signals(&name, cancel.clone()) {
        Ok(task) => task,
        Err(e) => {
            error!("[{name}] cannot install signal handlers: {e}");
            return RunnerExit::UnhandledFailure;
        }
    };

    let outcome = if identity.is_discovery() {
        serve_discovery(&identity, cancel.clone()).await
    } else {
        host_services(&identity, catalog, cancel.clone()).await
    };

    if let Some(monitor) = monitor {
        monitor.dispose();
    }
    signals.abort();

    let exit = match outcome {
        Err(exit) => exit,
        Ok(()) if parent_lost.load(Ordering::SeqCst) => RunnerExit::ParentLost,
        Ok(()) => RunnerExit::Graceful,
    };
    info!("[{name}] runner host exiting ({exit}, code {})", exit.code());
    exit
}

fn listen_for_signals(
    name: &str,
    cancel: CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let name = name.to_string();
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("[{name}] received SIGTERM"),
            _ = sigint.recv() => info!("[{name}] received SIGINT"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    }))
}

async fn serve_discovery(
    identity: &RunnerIdentity,
    cancel: CancellationToken,
) -> Result<(), RunnerExit> {
    let name = &identity.name;
    let server = DiscoveryServer::bind(&identity.discovery_socket, Arc::new(AddressBook::new()))
        .map_err(|e| {
            error!("[{name}] {e}");
            match e {
                BindError::EndpointConflict(_) => RunnerExit::EndpointConflict,
                BindError::Io { .. } => RunnerExit::UnhandledFailure,
            }
        })?;
    info!(
        "[{name}] discovery service listening on {}",
        server.path().display()
    );
    server.serve(cancel).await.map_err(|e| {
        error!("[{name}] discovery service failed: {e:#}");
        RunnerExit::UnhandledFailure
    })
}

async fn host_services(
    identity: &RunnerIdentity,
    catalog: &RegistrarCatalog,
    cancel: CancellationToken,
) -> Result<(), RunnerExit> {
    let name = &identity.name;
    let unhandled = |what: &dyn fmt::Display| {
        error!("[{name}] {what}");
        RunnerExit::UnhandledFailure
    };

    let registrations = catalog
        .registrations_for(identity)
        .map_err(|e| unhandled(&e))?;
    let default_endpoint: Endpoint = identity
        .property(ENDPOINT_PROPERTY)
        .unwrap_or(DEFAULT_HOST_ENDPOINT)
        .parse()
        .map_err(|e| unhandled(&e))?;

    let mut host = RpcServiceHost::new(default_endpoint);
    for registration in registrations {
        host.register_service(registration.registrar, registration.definition)
            .map_err(|e| unhandled(&e))?;
    }
    let announcements = match host.start().await {
        Ok(bound) => {
            let mut targets = Vec::new();
            if let Some(primary) = bound.iter().find(|b| b.is_default).or(bound.first()) {
                targets.push((name.clone(), primary.local.clone()));
            }
            for b in bound {
                targets.extend(b.definitions.iter().map(|d| (d.clone(), b.local.clone())));
            }
            targets
        }
        Err(e @ HostError::EndpointConflict(_)) => {
            error!("[{name}] {e}");
            return Err(RunnerExit::EndpointConflict);
        }
        Err(e) => return Err(unhandled(&e)),
    };

    let client = DiscoveryClient::new(&identity.discovery_socket).with_cancellation(cancel.clone());
    for (service, endpoint) in &announcements {
        announce_until_done(name, &client, service, endpoint).await;
    }

    cancel.cancelled().await;
    info!("[{name}] shutting down");
    host.drain().await;

    // The token has fired, so use a client that still talks.
    let client = DiscoveryClient::new(&identity.discovery_socket).with_retry(RetryPolicy::none());
    for (service, _) in &announcements {
        if let Err(e) = client.deregister(service).await {
            debug!("[{name}] could not deregister {service}: {e}");
        }
    }
    host.stop().await;
    Ok(())
}

/// Announce until the discovery service accepts it or the client is
/// cancelled.
async fn announce_until_done(
    name: &str,
    client: &DiscoveryClient,
    service: &str,
    endpoint: &Endpoint,
) {
    loop {
        match client.announce(service, endpoint).await {
            Ok(_) => {
                info!("[{name}] announced {service} at {endpoint}");
                return;
            }
            Err(DiscoveryError::Cancelled) => return,
            Err(e) => warn!("[{name}] announcing {service} failed, will retry: {e}"),
        }
        tokio::time::sleep(ANNOUNCE_RETRY_INTERVAL).await;
    }
}
