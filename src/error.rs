use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RdaError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid timestamp {0:?} (expected YYYYMMDDHHMM)")]
    InvalidTimestamp(String),

    #[error("invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    #[error("missing RDA credentials (set RDA_EMAIL and RDA_PASSWORD)")]
    #[diagnostic(help("credentials are the email and password of your RDA account"))]
    MissingCredentials,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("RDA error: {0}")]
    Provider(String),

    #[error("RDA error: submission accepted without a request id: {0}")]
    MissingRequestId(String),

    #[error("RDA request failed: {0}")]
    Http(String),

    #[error("RDA returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unexpected status from RDA: {0}")]
    JobFailed(String),

    #[error("download login failed: {0}")]
    Login(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("{primary}; purging the request afterwards also failed: {purge}")]
    PurgeAfterFailure {
        primary: Box<RdaError>,
        purge: Box<RdaError>,
    },
}

impl RdaError {
    pub fn is_user_error(&self) -> bool {
        match self {
            RdaError::InvalidQuery(_)
            | RdaError::InvalidTimestamp(_)
            | RdaError::InvalidBoundingBox(_)
            | RdaError::MissingCredentials
            | RdaError::ConfigRead(_)
            | RdaError::ConfigParse(_)
            | RdaError::Provider(_)
            | RdaError::MissingRequestId(_) => true,
            RdaError::PurgeAfterFailure { primary, .. } => primary.is_user_error(),
            _ => false,
        }
    }

    pub fn is_remote_error(&self) -> bool {
        match self {
            RdaError::Http(_)
            | RdaError::Status { .. }
            | RdaError::JobFailed(_)
            | RdaError::Login(_) => true,
            RdaError::PurgeAfterFailure { primary, .. } => primary.is_remote_error(),
            _ => false,
        }
    }
}
