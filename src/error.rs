use std::{io, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid CA")]
    Tls(#[from] rcgen::Error),
    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),
    #[error("failed to issue certificate for {host}: {reason}")]
    Issuance { host: String, reason: String },
    #[error("network error: {0}")]
    Network(#[from] hyper::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("invalid method: {0}")]
    InvalidMethod(String),
    #[error("New URL must have same protocol as overridden URL")]
    ProtocolChanged,
    #[error("unsupported protocol: {0}")]
    UnsupportedScheme(String),
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake with {host} failed: {source}")]
    UpstreamTls {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Aborted(String),
    #[error("{0}")]
    Handler(String),
    #[error("Route is already handled!")]
    AlreadyHandled,
    #[error("{0}")]
    RequestFailed(String),
    #[error("Timeout {}ms exceeded while waiting for event \"{event}\"", timeout.as_millis())]
    Timeout {
        event: &'static str,
        timeout: Duration,
    },
    #[error("proxy closed while waiting for event \"{0}\"")]
    Closed(&'static str),
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}
