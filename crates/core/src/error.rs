use thiserror::Error;

/// Errors returned synchronously by a submission; none of them change any
/// job state.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("media {0} is already being processed")]
    DuplicateInFlight(String),
    #[error("media id must not be empty")]
    InvalidId,
    #[error("cannot read media {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("no job for media {0}")]
    NotFound(String),
    #[error("job journal: {0:#}")]
    Journal(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
}
