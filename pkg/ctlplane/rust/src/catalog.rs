// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

//! Which registrars a runner host wires up, per runner type.

use crate::identity::RunnerIdentity;
use crate::rpc::status::{InstanceInfo, STATUS_SERVICE, StatusServer};
use crate::rpc::{Registrar, RouteBinder, ServiceCollection, ServiceDefinition};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Runner type that serves status plus every declared service name.
pub const IDLE_RUNNER_TYPE: &str = "idle";

pub struct Registration {
    pub registrar: Box<dyn Registrar>,
    pub definition: Option<ServiceDefinition>,
}

pub type RegistrarFactory = fn(&RunnerIdentity) -> Result<Vec<Registration>>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no registrars known for runner type {0:?}")]
    UnknownRunnerType(String),
    #[error("building registrars for runner type {runner_type:?}: {source:#}")]
    Factory {
        runner_type: String,
        source: anyhow::Error,
    },
}

#[derive(Default)]
pub struct RegistrarCatalog {
    factories: BTreeMap<String, RegistrarFactory>,
}

impl RegistrarCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the runner types shipped with the control plane.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register(IDLE_RUNNER_TYPE, idle_registrations);
        catalog
    }

    /// Returns the factory previously registered for `runner_type`, if any.
    pub fn register(
        &mut self,
        runner_type: &str,
        factory: RegistrarFactory,
    ) -> Option<RegistrarFactory> {
        self.factories.insert(runner_type.to_string(), factory)
    }

    pub fn registrations_for(
        &self,
        identity: &RunnerIdentity,
    ) -> Result<Vec<Registration>, CatalogError> {
        let factory = self
            .factories
            .get(&identity.runner_type)
            .ok_or_else(|| CatalogError::UnknownRunnerType(identity.runner_type.clone()))?;
        factory(identity).map_err(|source| CatalogError::Factory {
            runner_type: identity.runner_type.clone(),
            source,
        })
    }

    pub fn runner_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

fn idle_registrations(identity: &RunnerIdentity) -> Result<Vec<Registration>> {
    let definitions = ServiceDefinition::from_properties(&identity.properties)
        .with_context(|| format!("[{}] invalid service property", identity.name))?;
    let names = definitions.iter().map(|d| d.name.clone()).collect();

    let mut registrations = vec![Registration {
        registrar: Box::new(StatusRegistrar {
            instance: identity.name.clone(),
            runner_type: identity.runner_type.clone(),
            services: names,
        }),
        definition: None,
    }];
    registrations.extend(definitions.into_iter().map(|definition| Registration {
        registrar: Box::new(NamedServiceRegistrar {
            name: definition.name.clone(),
        }),
        definition: Some(definition),
    }));
    Ok(registrations)
}

struct StatusRegistrar {
    instance: String,
    runner_type: String,
    services: Vec<String>,
}

impl Registrar for StatusRegistrar {
    fn name(&self) -> &str {
        STATUS_SERVICE
    }

    fn configure_services(&self, services: &mut ServiceCollection) -> Result<()> {
        services.insert_if_absent(|| {
            Arc::new(InstanceInfo::new(
                &self.instance,
                &self.runner_type,
                self.services.clone(),
            ))
        });
        Ok(())
    }

    fn configure_routes(
        &self,
        services: &ServiceCollection,
        routes: &mut RouteBinder,
    ) -> Result<()> {
        routes.add_service(StatusServer::new(instance_info(services)?))?;
        Ok(())
    }
}

/// Reports a declared service name on its own endpoint. The endpoint also
/// answers status calls so peers can tell who is behind it.
struct NamedServiceRegistrar {
    name: String,
}

impl Registrar for NamedServiceRegistrar {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure_routes(
        &self,
        services: &ServiceCollection,
        routes: &mut RouteBinder,
    ) -> Result<()> {
        if !routes.has_service(STATUS_SERVICE) {
            routes.add_service(StatusServer::new(instance_info(services)?))?;
        }
        routes.mark_serving(&self.name);
        Ok(())
    }
}

fn instance_info(services: &ServiceCollection) -> Result<Arc<InstanceInfo>> {
    services
        .get::<Arc<InstanceInfo>>()
        .cloned()
        .context("instance info was not registered")
}
