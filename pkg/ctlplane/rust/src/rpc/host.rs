// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use crate::endpoint::{Endpoint, SocketBindError, bind_unix_socket};
use crate::rpc::health::OVERALL;
use crate::rpc::registrar::{Registrar, RouteBinder, ServiceCollection, ServiceDefinition};
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HostError {
    #[error("services cannot be registered once the host has started")]
    HostAlreadyStarted,
    #[error("endpoint {0} is already in use")]
    EndpointConflict(Endpoint),
    #[error("binding {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        source: std::io::Error,
    },
    #[error("registrar {registrar:?} failed: {source:#}")]
    Registrar {
        registrar: String,
        source: anyhow::Error,
    },
}

/// A listener the host is serving on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundEndpoint {
    /// Endpoint as registered.
    pub requested: Endpoint,
    /// Endpoint peers can connect to; differs from `requested` for TCP port 0.
    pub local: Endpoint,
    /// Service definitions bound here; empty for the default endpoint alone.
    pub definitions: Vec<String>,
    /// Whether registrations without a definition live here.
    pub is_default: bool,
    /// Names reported SERVING by the health service.
    pub serving: Vec<String>,
}

struct Registration {
    registrar: Box<dyn Registrar>,
    definition: Option<ServiceDefinition>,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

struct Group {
    endpoint: Endpoint,
    members: Vec<usize>,
}

struct Running {
    cancel: CancellationToken,
    servers: Vec<JoinHandle<Result<(), tonic::transport::Error>>>,
    reporters: Vec<(HealthReporter, Vec<String>)>,
    sockets: Vec<PathBuf>,
}

/// Hosts the gRPC services contributed by registrars.
///
/// Registrations without a [`ServiceDefinition`] share the default endpoint;
/// the others are grouped by endpoint, except TCP port 0 which always gets a
/// listener of its own. Every listener also serves `grpc.health.v1.Health`.
pub struct RpcServiceHost {
    default_endpoint: Endpoint,
    registrations: Vec<Registration>,
    services: ServiceCollection,
    bound: Vec<BoundEndpoint>,
    running: Option<Running>,
    started: bool,
}

impl RpcServiceHost {
    pub fn new(default_endpoint: Endpoint) -> Self {
        Self {
            default_endpoint,
            registrations: Vec::new(),
            services: ServiceCollection::new(),
            bound: Vec::new(),
            running: None,
            started: false,
        }
    }

    pub fn register_service(
        &mut self,
        registrar: Box<dyn Registrar>,
        definition: Option<ServiceDefinition>,
    ) -> Result<(), HostError> {
        if self.started {
            return Err(HostError::HostAlreadyStarted);
        }
        debug!(
            "registering {} on {}",
            registrar.name(),
            definition
                .as_ref()
                .map_or(&self.default_endpoint, |d| &d.endpoint)
        );
        self.registrations.push(Registration {
            registrar,
            definition,
        });
        Ok(())
    }

    /// Dependencies visible to registrars, for pre-population before start.
    pub fn services_mut(&mut self) -> &mut ServiceCollection {
        &mut self.services
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn bound_endpoints(&self) -> &[BoundEndpoint] {
        &self.bound
    }

    /// Where registrations without a definition are served.
    pub fn default_local_endpoint(&self) -> Option<&Endpoint> {
        self.bound.iter().find(|b| b.is_default).map(|b| &b.local)
    }

    /// Where the service definition `name` is served.
    pub fn local_endpoint_of(&self, name: &str) -> Option<&Endpoint> {
        self.bound
            .iter()
            .find(|b| b.definitions.iter().any(|d| d == name))
            .map(|b| &b.local)
    }

    /// Bind every endpoint, wire the routes and start serving.
    ///
    /// Nothing is served unless every listener binds and every registrar
    /// succeeds; on failure the listeners bound so far are released.
    pub async fn start(&mut self) -> Result<&[BoundEndpoint], HostError> {
        if self.started {
            return Err(HostError::HostAlreadyStarted);
        }
        self.started = true;

        for reg in &self.registrations {
            reg.registrar
                .configure_services(&mut self.services)
                .map_err(|source| HostError::Registrar {
                    registrar: reg.registrar.name().to_string(),
                    source,
                })?;
        }

        let groups = self.group_registrations();
        let mut listeners = Vec::with_capacity(groups.len());
        for group in &groups {
            match bind(&group.endpoint).await {
                Ok(bound) => listeners.push(bound),
                Err(e) => {
                    release(listeners);
                    return Err(e);
                }
            }
        }

        let mut binders = Vec::with_capacity(groups.len());
        for group in &groups {
            let mut binder = RouteBinder::new(group.endpoint.clone());
            let (reporter, health) = tonic_health::server::health_reporter();
            // The health service cannot collide on a fresh binder.
            let _ = binder.add_service(health);
            for reg in self.members(group) {
                if let Err(source) = reg.registrar.configure_routes(&self.services, &mut binder) {
                    release(listeners);
                    return Err(HostError::Registrar {
                        registrar: reg.registrar.name().to_string(),
                        source,
                    });
                }
            }
            binders.push((binder, reporter));
        }

        let cancel = CancellationToken::new();
        let mut running = Running {
            cancel: cancel.clone(),
            servers: Vec::new(),
            reporters: Vec::new(),
            sockets: Vec::new(),
        };
        for ((group, (listener, local)), (binder, mut reporter)) in
            groups.iter().zip(listeners).zip(binders)
        {
            let (routes, serving) = binder.into_parts();
            reporter.set_service_status(OVERALL, ServingStatus::Serving).await;
            for name in &serving {
                reporter.set_service_status(name, ServingStatus::Serving).await;
            }

            let router = Server::builder().add_routes(routes.routes());
            let shutdown = cancel.clone().cancelled_owned();
            let server = match listener {
                Listener::Tcp(l) => tokio::spawn(
                    router.serve_with_incoming_shutdown(TcpListenerStream::new(l), shutdown),
                ),
                Listener::Unix(l, path) => {
                    running.sockets.push(path);
                    tokio::spawn(
                        router.serve_with_incoming_shutdown(UnixListenerStream::new(l), shutdown),
                    )
                }
            };
            running.servers.push(server);

            let definitions: Vec<String> = self
                .members(group)
                .filter_map(|r| r.definition.as_ref())
                .map(|d| d.name.clone())
                .collect();
            let is_default = self.members(group).any(|r| r.definition.is_none());
            info!(
                "serving {} on {local}",
                if serving.is_empty() {
                    "health only".to_string()
                } else {
                    serving.join(", ")
                }
            );
            self.bound.push(BoundEndpoint {
                requested: group.endpoint.clone(),
                local,
                definitions,
                is_default,
                serving: serving.clone(),
            });
            running.reporters.push((reporter, serving));
        }

        self.running = Some(running);
        Ok(&self.bound)
    }

    /// Report NOT_SERVING everywhere while still accepting calls.
    pub async fn drain(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        for (reporter, serving) in running.reporters.iter_mut() {
            reporter
                .set_service_status(OVERALL, ServingStatus::NotServing)
                .await;
            for name in serving.iter() {
                reporter
                    .set_service_status(name, ServingStatus::NotServing)
                    .await;
            }
        }
    }

    /// Drain, then shut every listener down. The host cannot be restarted.
    pub async fn stop(&mut self) {
        self.drain().await;
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        for server in running.servers {
            match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("rpc server stopped with error: {e}"),
                Ok(Err(e)) => warn!("rpc server task failed: {e}"),
                Err(_) => warn!("rpc server did not stop within {SHUTDOWN_GRACE:?}"),
            }
        }
        for path in running.sockets {
            remove_socket(&path);
        }
        info!("rpc host stopped");
    }

    fn members<'a>(&'a self, group: &'a Group) -> impl Iterator<Item = &'a Registration> {
        group
            .members
            .iter()
            .filter_map(|&i| self.registrations.get(i))
    }

    fn group_registrations(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        for (idx, reg) in self.registrations.iter().enumerate() {
            let endpoint = reg
                .definition
                .as_ref()
                .map_or(&self.default_endpoint, |d| &d.endpoint);
            // Port 0 is shared only by registrations without a definition.
            let shareable = !endpoint.is_ephemeral() || reg.definition.is_none();
            let shared = groups.iter_mut().find(|g| {
                shareable
                    && g.endpoint == *endpoint
                    && (!endpoint.is_ephemeral()
                        || self.members(g).all(|r| r.definition.is_none()))
            });
            match shared {
                Some(group) => group.members.push(idx),
                None => groups.push(Group {
                    endpoint: endpoint.clone(),
                    members: vec![idx],
                }),
            }
        }
        groups
    }
}

async fn bind(endpoint: &Endpoint) -> Result<(Listener, Endpoint), HostError> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                if e.kind() == ErrorKind::AddrInUse {
                    HostError::EndpointConflict(endpoint.clone())
                } else {
                    HostError::Bind {
                        endpoint: endpoint.clone(),
                        source: e,
                    }
                }
            })?;
            let local = listener.local_addr().map_err(|source| HostError::Bind {
                endpoint: endpoint.clone(),
                source,
            })?;
            Ok((Listener::Tcp(listener), Endpoint::Tcp(local)))
        }
        Endpoint::Unix(path) => {
            let listener = bind_unix_socket(path).map_err(|e| match e {
                SocketBindError::InUse(_) => HostError::EndpointConflict(endpoint.clone()),
                SocketBindError::Io { source, .. } => HostError::Bind {
                    endpoint: endpoint.clone(),
                    source,
                },
            })?;
            Ok((
                Listener::Unix(listener, path.clone()),
                Endpoint::Unix(path.clone()),
            ))
        }
    }
}

fn release(listeners: Vec<(Listener, Endpoint)>) {
    for (listener, _) in listeners {
        if let Listener::Unix(_, path) = listener {
            remove_socket(&path);
        }
    }
}

fn remove_socket(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != ErrorKind::NotFound
    {
        warn!("failed to remove {}: {e}", path.display());
    }
}

impl Drop for RpcServiceHost {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            for path in running.sockets {
                remove_socket(&path);
            }
        }
    }
}
