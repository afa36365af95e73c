use std::{io, path::PathBuf};

use thiserror::Error;
use uuid::Uuid;

use crate::engine::EngineError;

/// Terminal failure of a single retrieval job. Nothing in the pipeline
/// retries; the caller decides whether to submit again.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("engine reported success but nothing named {job_id}.* exists in {}", dir.display())]
    ArtifactMissing { job_id: Uuid, dir: PathBuf },
    #[error("refusing to overwrite existing artifact {}", path.display())]
    Collision { path: PathBuf },
    #[error("{action} {}: {source}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("internal engine failure: {0}")]
    Internal(String),
}

impl RetrievalError {
    pub(crate) fn filesystem(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }
}

impl From<EngineError> for RetrievalError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::SourceUnavailable(detail) => Self::SourceUnavailable(detail),
            EngineError::Network(detail) => Self::NetworkFailure(detail),
            other => Self::Internal(other.to_string()),
        }
    }
}
