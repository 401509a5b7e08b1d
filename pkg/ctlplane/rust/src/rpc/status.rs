// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

//! `ctlplane.v1.Status`: lets a peer ask a runner host who it is.

use crate::endpoint::Endpoint;
use crate::rpc::codec::JsonCodec;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::{Body, BoxFuture, Context, Poll, Service, StdError, http};
use tonic::server::{NamedService, UnaryService};

pub const STATUS_SERVICE: &str = "ctlplane.v1.Status";
const DESCRIBE_PATH: &str = "/ctlplane.v1.Status/Describe";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance: String,
    pub runner_type: String,
    pub services: Vec<String>,
    pub uptime_ms: u64,
}

/// What a runner host reports about itself.
#[derive(Debug)]
pub struct InstanceInfo {
    pub instance: String,
    pub runner_type: String,
    pub services: Vec<String>,
    started: Instant,
}

impl InstanceInfo {
    pub fn new(instance: &str, runner_type: &str, services: Vec<String>) -> Self {
        Self {
            instance: instance.to_string(),
            runner_type: runner_type.to_string(),
            services,
            started: Instant::now(),
        }
    }

    fn snapshot(&self) -> InstanceStatus {
        InstanceStatus {
            instance: self.instance.clone(),
            runner_type: self.runner_type.clone(),
            services: self.services.clone(),
            uptime_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusServer {
    info: Arc<InstanceInfo>,
}

impl StatusServer {
    pub fn new(info: Arc<InstanceInfo>) -> Self {
        Self { info }
    }
}

impl NamedService for StatusServer {
    const NAME: &'static str = STATUS_SERVICE;
}

struct DescribeSvc(Arc<InstanceInfo>);

impl UnaryService<DescribeRequest> for DescribeSvc {
    type Response = InstanceStatus;
    type Future = BoxFuture<tonic::Response<InstanceStatus>, tonic::Status>;

    fn call(&mut self, _request: tonic::Request<DescribeRequest>) -> Self::Future {
        let info = self.0.clone();
        Box::pin(async move { Ok(tonic::Response::new(info.snapshot())) })
    }
}

impl<B> Service<http::Request<B>> for StatusServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            DESCRIBE_PATH => {
                let svc = DescribeSvc(self.info.clone());
                Box::pin(async move {
                    let mut grpc = tonic::server::Grpc::new(
                        JsonCodec::<InstanceStatus, DescribeRequest>::default(),
                    );
                    Ok(grpc.unary(svc, req).await)
                })
            }
            _ => Box::pin(async move {
                let mut response = http::Response::new(tonic::body::Body::default());
                let headers = response.headers_mut();
                headers.insert(
                    tonic::Status::GRPC_STATUS,
                    (tonic::Code::Unimplemented as i32).into(),
                );
                headers.insert(
                    http::header::CONTENT_TYPE,
                    tonic::metadata::GRPC_CONTENT_TYPE,
                );
                Ok(response)
            }),
        }
    }
}

/// Ask the runner host at `endpoint` to describe itself.
pub async fn describe(endpoint: &Endpoint) -> Result<InstanceStatus, tonic::Status> {
    let channel = endpoint
        .connect()
        .await
        .map_err(|e| tonic::Status::unavailable(format!("connecting to {endpoint}: {e}")))?;
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| tonic::Status::unknown(format!("service was not ready: {e}")))?;
    let response = grpc
        .unary(
            tonic::Request::new(DescribeRequest::default()),
            PathAndQuery::from_static(DESCRIBE_PATH),
            JsonCodec::<DescribeRequest, InstanceStatus>::default(),
        )
        .await?;
    Ok(response.into_inner())
}
