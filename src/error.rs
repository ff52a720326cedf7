//! Precondition failures that abort an operation before any child is launched.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A required executable does not resolve on `PATH`.
    #[error("required tool `{0}` not found on PATH")]
    ToolMissing(String),

    #[error("{what} not found: {}", path.display())]
    MissingDirectory { what: String, path: PathBuf },

    /// Readiness port is bound by something else and was not (or could not be) freed.
    #[error("port {port} needed by {service} is already in use")]
    PortOccupied { service: String, port: u16 },

    #[error("service {0} has an empty command line")]
    EmptyCommand(String),

    #[error("failed to launch {service}: {source}")]
    Launch {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid process pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
