//! Error type shared by every pipeline component.

use thiserror::Error;

/// Result alias for harvest operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Failures surfaced by the ingestion pipeline and its collaborators.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// The ingest filter could not evaluate the record.
    #[error("ingest filter failed: {0}")]
    FilterEvaluation(String),

    /// An extension point (metadata remover, bundle versioner, hook) failed.
    #[error("harvesting error: {0}")]
    Harvesting(String),

    /// Installing a freshly created workspace item failed.
    #[error("install failed: {0}")]
    Install(String),

    /// The underlying store failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The review workflow collaborator refused an operation.
    #[error("review workflow error: {0}")]
    Workflow(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another ingest of the same remote record into the same collection is in flight.
    #[error("record {remote_id} is already being ingested into {collection}")]
    Busy { remote_id: String, collection: String },
}

/// Coarse classification of a [`HarvestError`], stable for logs and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FilterEvaluation,
    Harvesting,
    Install,
    Persistence,
    Workflow,
    NotFound,
    Busy,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::FilterEvaluation => "filter",
            ErrorKind::Harvesting => "harvesting",
            ErrorKind::Install => "install",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Workflow => "workflow",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Busy => "busy",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl HarvestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarvestError::FilterEvaluation(_) => ErrorKind::FilterEvaluation,
            HarvestError::Harvesting(_) => ErrorKind::Harvesting,
            HarvestError::Install(_) => ErrorKind::Install,
            HarvestError::Persistence(_) => ErrorKind::Persistence,
            HarvestError::Workflow(_) => ErrorKind::Workflow,
            HarvestError::NotFound(_) => ErrorKind::NotFound,
            HarvestError::Busy { .. } => ErrorKind::Busy,
        }
    }

    /// Wrap any error raised inside an extension point as [`HarvestError::Harvesting`].
    ///
    /// Errors that are already `Harvesting` pass through unchanged.
    pub fn into_harvesting(self, during: &str) -> HarvestError {
        match self {
            HarvestError::Harvesting(_) => self,
            other => HarvestError::Harvesting(format!("{}: {}", during, other)),
        }
    }
}
