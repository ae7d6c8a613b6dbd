use std::path::PathBuf;
use thiserror::Error;

/// Failures that invalidate a whole run. Raised before any streaming starts.
#[derive(Debug, Error)]
pub enum TriageError {
    #[error("corpus file not found: {0}")]
    CorpusNotFound(PathBuf),
    #[error("discovery artifact not found: {0}")]
    ArtifactNotFound(PathBuf),
    #[error("missing credentials: {0}")]
    MissingCredentials(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
