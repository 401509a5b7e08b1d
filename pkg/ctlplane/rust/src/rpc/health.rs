// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use crate::endpoint::Endpoint;
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;

/// Overall status of the host behind `endpoint`.
pub const OVERALL: &str = "";

/// Query the standard gRPC health service. `Ok(false)` means the service
/// answered NOT_SERVING (or another non-serving status).
pub async fn check_serving(endpoint: &Endpoint, service: &str) -> Result<bool, tonic::Status> {
    let channel = endpoint
        .connect()
        .await
        .map_err(|e| tonic::Status::unavailable(format!("connecting to {endpoint}: {e}")))?;
    let response = HealthClient::new(channel)
        .check(HealthCheckRequest {
            service: service.to_string(),
        })
        .await?;
    Ok(response.into_inner().status == ServingStatus::Serving as i32)
}
