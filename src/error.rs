use std::path::PathBuf;

use thiserror::Error;

use crate::remote::RemoteError;

/// Library error type for rotator operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A required setting is missing or out of range. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The image pool has nothing to rotate. Fatal to the loop only.
    #[error("no images found in {}", .0.display())]
    EmptyPool(PathBuf),

    /// Upload, listing or deletion against the identity service failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// YAML/serde configuration error.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
