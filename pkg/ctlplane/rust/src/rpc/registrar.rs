// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use crate::endpoint::{Endpoint, EndpointParseError};
use anyhow::{Result, bail};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::convert::Infallible;
use tonic::body::Body;
use tonic::codegen::{Service, http};
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;

/// Instance properties with this prefix declare a service endpoint.
pub const SERVICE_PROPERTY_PREFIX: &str = "service.";

/// A named RPC service bound to its own endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub endpoint: Endpoint,
}

impl ServiceDefinition {
    pub fn new(name: &str, endpoint: Endpoint) -> Self {
        Self {
            name: name.to_string(),
            endpoint,
        }
    }

    /// Every `service.<name> = <endpoint>` property, ordered by name.
    pub fn from_properties(
        properties: &BTreeMap<String, String>,
    ) -> Result<Vec<Self>, EndpointParseError> {
        properties
            .iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(SERVICE_PROPERTY_PREFIX)?;
                (!name.is_empty()).then_some((name, value))
            })
            .map(|(name, value)| Ok(Self::new(name, value.parse()?)))
            .collect()
    }
}

/// Shared dependencies, keyed by type.
#[derive(Default)]
pub struct ServiceCollection {
    entries: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous value of the same type, if any.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.entries
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast::<T>().ok())
            .map(|prev| *prev)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.entries
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut::<T>())
    }

    /// Insert `make()` unless a value of that type is present. Returns
    /// whether it was inserted.
    pub fn insert_if_absent<T, F>(&mut self, make: F) -> bool
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if self.contains::<T>() {
            return false;
        }
        self.entries.insert(TypeId::of::<T>(), Box::new(make()));
        true
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects the gRPC routes served on one endpoint.
pub struct RouteBinder {
    endpoint: Endpoint,
    routes: RoutesBuilder,
    bound: HashSet<&'static str>,
    serving: Vec<String>,
}

impl RouteBinder {
    pub(crate) fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            routes: RoutesBuilder::default(),
            bound: HashSet::new(),
            serving: Vec::new(),
        }
    }

    /// The endpoint as requested; TCP port 0 is not resolved yet.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Route a gRPC service and report its name as serving once started.
    /// A service name can be bound once per endpoint.
    pub fn add_service<S>(&mut self, svc: S) -> Result<&mut Self>
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        if !self.bound.insert(S::NAME) {
            bail!("{} is already bound on {}", S::NAME, self.endpoint);
        }
        self.routes.add_service(svc);
        self.serving.push(S::NAME.to_string());
        Ok(self)
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.bound.contains(name)
    }

    /// Report `name` through the health service without routing anything.
    pub fn mark_serving(&mut self, name: &str) -> &mut Self {
        if !self.serving.iter().any(|s| s == name) {
            self.serving.push(name.to_string());
        }
        self
    }

    pub fn serving(&self) -> &[String] {
        &self.serving
    }

    pub(crate) fn into_parts(self) -> (RoutesBuilder, Vec<String>) {
        (self.routes, self.serving)
    }
}

/// Wires one pluggable service into an [`crate::rpc::RpcServiceHost`].
///
/// The host calls `configure_services` on every registrar before calling
/// `configure_routes` on any of them, so routes can rely on dependencies
/// contributed by other registrars.
pub trait Registrar: Send {
    fn name(&self) -> &str;

    fn configure_services(&self, _services: &mut ServiceCollection) -> Result<()> {
        Ok(())
    }

    fn configure_routes(
        &self,
        services: &ServiceCollection,
        routes: &mut RouteBinder,
    ) -> Result<()>;
}
