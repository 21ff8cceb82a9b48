use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("certificate authority unavailable: {0}")]
    Certificate(#[from] keyhole_tls::TlsError),
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("credential is already expired; refusing to start session")]
    CredentialExpired,
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("client configuration bridge failed: {0}")]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential helper failed to run: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential helper exited with status {status}: {detail}")]
    HelperFailed { status: i32, detail: String },
    #[error("credential helper produced invalid output: {0}")]
    InvalidOutput(String),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("client config command failed to run: {0}")]
    Io(#[from] std::io::Error),
    #[error("client config command exited with status {status}: {detail}")]
    CommandFailed { status: i32, detail: String },
}
