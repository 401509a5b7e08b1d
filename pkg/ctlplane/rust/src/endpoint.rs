// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use hyper_util::rt::TokioIo;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{DirBuilder, Permissions};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tonic::transport::{Channel, Uri};
use tower::service_fn;

const TCP_SCHEME: &str = "tcp://";
const UNIX_SCHEME: &str = "unix://";

/// Transport address of an RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid endpoint {input:?}: {reason}")]
pub struct EndpointParseError {
    input: String,
    reason: String,
}

#[derive(Debug, Error)]
pub enum SocketBindError {
    #[error("{0} is already served by a live process")]
    InUse(PathBuf),
    #[error("binding {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Bind a unix socket at `path`, creating its directory. A socket file
/// nobody answers on is stale and gets replaced; a live one is `InUse`.
pub(crate) fn bind_unix_socket(path: &Path) -> Result<UnixListener, SocketBindError> {
    let io_err = |source: std::io::Error| SocketBindError::Io {
        path: path.to_path_buf(),
        source,
    };

    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(SocketBindError::InUse(path.to_path_buf()));
        }
        info!("removing stale socket {}", path.display());
        std::fs::remove_file(path)
            .or_else(|e| {
                if e.kind() == ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(io_err)?;
    }

    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(parent)
            .map_err(io_err)?;
    }

    let listener = UnixListener::bind(path).map_err(|e| {
        if e.kind() == ErrorKind::AddrInUse {
            SocketBindError::InUse(path.to_path_buf())
        } else {
            io_err(e)
        }
    })?;
    std::fs::set_permissions(path, Permissions::from_mode(0o660)).map_err(io_err)?;
    Ok(listener)
}

impl Endpoint {
    /// A TCP endpoint asking the OS for a free port.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Endpoint::Tcp(addr) if addr.port() == 0)
    }

    /// Open a gRPC channel to this endpoint.
    pub async fn connect(&self) -> Result<Channel, tonic::transport::Error> {
        match self {
            Endpoint::Tcp(addr) => {
                tonic::transport::Endpoint::from_shared(format!("http://{addr}"))?
                    .connect()
                    .await
            }
            Endpoint::Unix(path) => {
                let path = path.clone();
                // The URI is ignored by the connector but must be well formed.
                tonic::transport::Endpoint::from_static("http://[::]:50051")
                    .connect_with_connector(service_fn(move |_: Uri| {
                        let path = path.clone();
                        async move {
                            Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
                        }
                    }))
                    .await
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{TCP_SCHEME}{addr}"),
            Endpoint::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let err = |reason: &str| EndpointParseError {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        if let Some(addr) = input.strip_prefix(TCP_SCHEME) {
            return addr
                .parse()
                .map(Endpoint::Tcp)
                .map_err(|_| err("expected ip:port after tcp://"));
        }
        if let Some(path) = input.strip_prefix(UNIX_SCHEME) {
            if !path.starts_with('/') {
                return Err(err("unix socket path must be absolute"));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if input.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(input)));
        }
        input
            .parse()
            .map(Endpoint::Tcp)
            .map_err(|_| err("expected tcp://ip:port, unix:///path, ip:port or an absolute path"))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}
