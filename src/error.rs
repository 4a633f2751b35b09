use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid storage key component `{component}`: {reason}")]
    InvalidKeyComponent {
        component: &'static str,
        reason: String,
    },

    #[error("invalid request for sensor {sensor}: {reason}")]
    InvalidRequest { sensor: String, reason: String },

    #[error("unknown sensor: {0}")]
    UnknownSensor(String),

    #[error("failed to read catalog file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse catalog: {0}")]
    ConfigParse(String),

    #[error("missing credentials: {0}")]
    #[diagnostic(help("set CDSAPI_KEY / CDS_HARVEST_BUCKET or create ~/.cdsapirc"))]
    MissingCredentials(String),

    #[error("archive request failed: {0}")]
    ArchiveHttp(String),

    #[error("archive returned status {status}: {message}")]
    ArchiveStatus { status: u16, message: String },

    #[error("archive rejected job: {0}")]
    ArchiveRejected(String),

    #[error("{operation} gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("malformed archive {path}: {message}")]
    MalformedArchive { path: String, message: String },
}

impl HarvestError {
    /// True for failures raised by the remote archive, including exhausted retries.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            HarvestError::ArchiveHttp(_)
                | HarvestError::ArchiveStatus { .. }
                | HarvestError::ArchiveRejected(_)
                | HarvestError::RetryExhausted { .. }
        )
    }
}
