//! Crate-wide error type
//!
//! One variant per row of the error taxonomy: each carries its HTTP status
//! and an `ED#####` message code so the same type serves the gateway
//! response path and the admin envelope.

use std::io;
use thiserror::Error;

/// Gateway error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed request: {0}")]
    ClientMalformed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("access denied: {0}")]
    AuthzDenied(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("upstream error: {0}")]
    UpstreamBadGateway(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn client_malformed<S: Into<String>>(msg: S) -> Self {
        Error::ClientMalformed(msg.into())
    }

    pub fn auth_failed<S: Into<String>>(msg: S) -> Self {
        Error::AuthFailed(msg.into())
    }

    pub fn authz_denied<S: Into<String>>(msg: S) -> Self {
        Error::AuthzDenied(msg.into())
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Error::RateLimited { retry_after_secs }
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn upstream_unavailable<S: Into<String>>(msg: S) -> Self {
        Error::UpstreamUnavailable(msg.into())
    }

    pub fn upstream_timeout<S: Into<String>>(msg: S) -> Self {
        Error::UpstreamTimeout(msg.into())
    }

    pub fn upstream_bad_gateway<S: Into<String>>(msg: S) -> Self {
        Error::UpstreamBadGateway(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    pub fn config_invalid<S: Into<String>>(msg: S) -> Self {
        Error::ConfigInvalid(msg.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    /// HTTP status this error surfaces as on the gateway's own request path (§7).
    pub fn status_code(&self) -> u16 {
        match self {
            Error::ClientMalformed(_) => 400,
            Error::AuthFailed(_) => 401,
            Error::AuthzDenied(_) => 403,
            Error::RateLimited { .. } => 429,
            Error::NotFound(_) => 404,
            Error::UpstreamUnavailable(_) => 503,
            Error::UpstreamTimeout(_) => 504,
            Error::UpstreamBadGateway(_) => 502,
            Error::Internal(_) => 500,
            Error::ConfigInvalid(_) => 400,
            Error::Io(_) | Error::Tls(_) | Error::Protocol(_) => 500,
        }
    }

    /// Message code attached to admin-API envelopes (`ED#####`).
    pub fn message_code(&self) -> &'static str {
        match self {
            Error::ClientMalformed(_) => "ED00001",
            Error::AuthFailed(_) => "ED00002",
            Error::AuthzDenied(_) => "ED00003",
            Error::RateLimited { .. } => "ED00004",
            Error::NotFound(_) => "ED00005",
            Error::UpstreamUnavailable(_) => "ED00006",
            Error::UpstreamTimeout(_) => "ED00007",
            Error::UpstreamBadGateway(_) => "ED00008",
            Error::Internal(_) => "ED00009",
            Error::ConfigInvalid(_) => "ED00010",
            Error::Io(_) => "ED00011",
            Error::Tls(_) => "ED00012",
            Error::Protocol(_) => "ED00013",
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::ConfigInvalid(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ClientMalformed(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::UpstreamTimeout(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        Error::AuthFailed(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
