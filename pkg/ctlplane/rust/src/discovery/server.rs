// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use crate::discovery::AddressBook;
use crate::discovery::protocol::{
    DEREGISTER_PATH, DeregisterResponse, ErrorResponse, HEALTH_PATH, INSTANCES_PATH,
    InstancesResponse, JSON_CONTENT_TYPE, NameRequest, REGISTER_PATH, RESOLVE_PATH,
    RegisterRequest,
};
use crate::endpoint::{SocketBindError, bind_unix_socket};
use anyhow::{Result, anyhow};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

type HttpResponse = Response<BoxBody<Bytes, std::io::Error>>;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("discovery socket {0} is already served by a live process")]
    EndpointConflict(PathBuf),
    #[error("binding discovery socket {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Discovery service bound to its unix socket, not yet serving.
pub struct DiscoveryServer {
    book: Arc<AddressBook>,
    listener: UnixListener,
    path: PathBuf,
}

impl DiscoveryServer {
    /// Bind `path`, replacing a stale socket file.
    pub fn bind(path: &Path, book: Arc<AddressBook>) -> Result<Self, BindError> {
        let listener = bind_unix_socket(path).map_err(|e| match e {
            SocketBindError::InUse(path) => BindError::EndpointConflict(path),
            SocketBindError::Io { path, source } => BindError::Io { path, source },
        })?;

        info!("discovery service listening on {}", path.display());
        Ok(Self {
            book,
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn book(&self) -> Arc<AddressBook> {
        self.book.clone()
    }

    /// Serve until `cancel` fires, then remove the socket file.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("discovery accept failed: {e}");
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let book = self.book.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let conn = http1::Builder::new().serve_connection(
                            io,
                            service_fn(move |req| {
                                let book = book.clone();
                                async move {
                                    Ok::<_, anyhow::Error>(
                                        handle_request(&book, req)
                                            .await
                                            .unwrap_or_else(|e| internal_error(&e)),
                                    )
                                }
                            }),
                        );
                        let mut conn = std::pin::pin!(conn);
                        tokio::select! {
                            res = conn.as_mut() => {
                                if let Err(err) = res {
                                    debug!("error serving discovery connection: {err}");
                                }
                            }
                            _ = cancel.cancelled() => {
                                conn.as_mut().graceful_shutdown();
                                let _ = conn.as_mut().await;
                            }
                        }
                    });
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!("failed to remove {}: {e}", self.path.display());
        }
        info!("discovery service stopped");
        Ok(())
    }
}

async fn handle_request(
    book: &AddressBook,
    req: Request<hyper::body::Incoming>,
) -> Result<HttpResponse> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, REGISTER_PATH) => {
            let Some(body) = read_json::<RegisterRequest>(req).await else {
                return bad_request();
            };
            let record = book.register(&body.name, body.endpoint);
            info!("[{}] registered at {}", record.instance_name, record.endpoint);
            json_response(StatusCode::OK, &record)
        }
        (&Method::POST, RESOLVE_PATH) => {
            let Some(body) = read_json::<NameRequest>(req).await else {
                return bad_request();
            };
            match book.resolve(&body.name) {
                Some(record) => json_response(StatusCode::OK, &record),
                None => {
                    debug!("[{}] resolve miss", body.name);
                    json_response(
                        StatusCode::NOT_FOUND,
                        &ErrorResponse {
                            error: format!("no instance registered as {:?}", body.name),
                        },
                    )
                }
            }
        }
        (&Method::POST, DEREGISTER_PATH) => {
            let Some(body) = read_json::<NameRequest>(req).await else {
                return bad_request();
            };
            let removed = book.deregister(&body.name);
            if removed {
                info!("[{}] deregistered", body.name);
            }
            json_response(StatusCode::OK, &DeregisterResponse { removed })
        }
        (&Method::GET, INSTANCES_PATH) => json_response(
            StatusCode::OK,
            &InstancesResponse {
                instances: book.records(),
            },
        ),
        (&Method::GET, HEALTH_PATH) => {
            json_response(StatusCode::OK, &serde_json::json!({"status": "ok"}))
        }
        _ => {
            info!(
                "{} request to unknown endpoint: {}",
                req.method(),
                req.uri().path()
            );
            json_response(
                StatusCode::NOT_FOUND,
                &ErrorResponse {
                    error: "not found".to_string(),
                },
            )
        }
    }
}

async fn read_json<T: DeserializeOwned>(req: Request<hyper::body::Incoming>) -> Option<T> {
    if req
        .headers()
        .get(CONTENT_TYPE)
        .is_none_or(|value| value != JSON_CONTENT_TYPE)
    {
        return None;
    }
    let body = match req.collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) => {
            error!("failed to read request body: {e}");
            return None;
        }
    };
    match serde_json::from_slice(&body) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("failed to parse discovery request: {e}");
            None
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<HttpResponse> {
    let bytes = serde_json::to_vec(body)?;
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
        .body(Full::new(bytes.into()).map_err(|e| match e {}).boxed())
        .map_err(|e| anyhow!("failed to build response: {e}"))
}

fn bad_request() -> Result<HttpResponse> {
    json_response(
        StatusCode::BAD_REQUEST,
        &ErrorResponse {
            error: "bad request".to_string(),
        },
    )
}

fn internal_error(e: &anyhow::Error) -> HttpResponse {
    error!("discovery request failed: {e:#}");
    let mut response = Response::new(
        Full::new(Bytes::from_static(b"Internal Server Error"))
            .map_err(|e| match e {})
            .boxed(),
    );
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
