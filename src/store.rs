//! Read side of the storage root: resolves a client-supplied filename to a
//! file that is guaranteed to live directly under the root.

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tokio::fs::{self, File};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid artifact name {0:?}")]
    InvalidName(String),
    #[error("artifact {0:?} not found")]
    NotFound(String),
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An opened artifact ready to be streamed.
#[derive(Debug)]
pub struct StoredArtifact {
    pub file: File,
    pub path: PathBuf,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the storage root if it does not exist yet.
    pub fn prepare(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Opens `name` for reading. Names that could leave the root, and names
    /// that resolve to anything but a regular file inside it, are reported as
    /// not found.
    pub async fn open(&self, name: &str) -> Result<StoredArtifact, StoreError> {
        validate_name(name)?;

        let root = fs::canonicalize(&self.root)
            .await
            .map_err(|source| StoreError::Io {
                action: "resolving storage root",
                path: self.root.clone(),
                source,
            })?;
        let path = match fs::canonicalize(root.join(name)).await {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_owned()));
            }
            Err(source) => {
                return Err(StoreError::Io {
                    action: "resolving",
                    path: root.join(name),
                    source,
                });
            }
        };
        // A symlink could still point elsewhere.
        if path.parent() != Some(root.as_path()) {
            return Err(StoreError::InvalidName(name.to_owned()));
        }

        let metadata = fs::metadata(&path).await.map_err(|source| StoreError::Io {
            action: "inspecting",
            path: path.clone(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound(name.to_owned()));
        }

        let file = File::open(&path).await.map_err(|source| StoreError::Io {
            action: "opening",
            path: path.clone(),
            source,
        })?;
        Ok(StoredArtifact {
            file,
            path,
            len: metadata.len(),
        })
    }
}

/// Accepts a bare filename only: no separators, no `.`/`..` components and no
/// NUL bytes. Dots inside a name (`Wait... what.mp4`) are fine.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        Err(StoreError::InvalidName(name.to_owned()))
    } else {
        Ok(())
    }
}
