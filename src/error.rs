use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The upstream certificate did not verify against the configured CA
    /// and server name. The deployment is broken; the relay stops.
    #[error("Untrusted upstream certificate for '{server_name}': {reason}")]
    Trust { server_name: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a single upstream connection attempt failed.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("certificate for '{server_name}' rejected: {reason}")]
    Trust { server_name: String, reason: String },
}

impl ConnectError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectError::Trust { .. })
    }
}
