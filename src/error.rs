use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, PxError>;

/// Errors surfaced by the dispatch/relay engine, upstream resolver and
/// credential provider. [`PxError::status`] maps each variant to the HTTP
/// status C6 writes back to the client.
#[derive(Error, Debug)]
pub enum PxError {
    #[error("client socket error: {0}")]
    ClientIo(#[from] io::Error),

    #[error("upstream transport error connecting to {addr}: {source}")]
    UpstreamConnect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("upstream proxy {addr} rejected authentication")]
    UpstreamAuthFailed { addr: SocketAddr },

    #[error("no credential configured and platform SSPI is not available")]
    NoCredential,

    #[error("PAC evaluation failed: {0}")]
    PacEvaluation(String),

    #[error("invalid no-proxy rule {rule:?}: {reason}")]
    NoProxyRule { rule: String, reason: String },

    #[error("invalid upstream entry {entry:?}")]
    InvalidUpstreamEntry { entry: String },

    #[error("config key {section}.{key} is invalid ({value:?}): {reason}")]
    ConfigValue {
        section: &'static str,
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("listen address {addr} is already in use")]
    PortInUse { addr: SocketAddr },

    #[error("admission denied for {addr}")]
    AdmissionDenied { addr: SocketAddr },

    #[error("credential store error: {0}")]
    CredentialStore(#[from] keyring::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("http protocol error: {0}")]
    HttpProtocol(#[from] hyper::http::Error),

    #[error("upstream authentication handshake failed: {0}")]
    AuthHandshake(String),
}

impl PxError {
    /// Maps an internal failure to the status line C6 writes to the client,
    /// per the error table: transport errors surface as a synthetic 5xx,
    /// auth rejection as 401, missing credential as 501.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            PxError::UpstreamConnect { .. } => (502, "Bad Gateway"),
            PxError::UpstreamAuthFailed { .. } => (401, "Proxy server authentication failed"),
            PxError::NoCredential => (501, "SSPI not available and no username configured"),
            PxError::PortInUse { .. } => (500, "Internal Server Error"),
            PxError::AuthHandshake(_) => (502, "Bad Gateway"),
            _ => (502, "Bad Gateway"),
        }
    }
}
