use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("kubernetes error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tunnel to {target} was not ready within {timeout:?}")]
    ReadyTimeout { target: String, timeout: Duration },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no pod backing service {service} could be forwarded: {}", .errors.join("; "))]
    AllCandidatesFailed {
        service: String,
        errors: Vec<String>,
    },

    #[error("proxy request failed: {0}")]
    ProxyError(#[from] reqwest::Error),

    #[error("invalid proxy response: {0}")]
    DecodeError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
