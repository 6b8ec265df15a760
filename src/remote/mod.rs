//! Seam between the rotator and the identity service holding the profile photo.
//!
//! The rotator only needs three calls on an open session: upload-and-assign,
//! list and delete. Opening and closing the session is a separate step so the
//! caller can scope it around the whole loop.

pub mod mirror;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Credentials;

pub use mirror::{MirrorConnector, MirrorSession};

/// Remote handle to a previously uploaded profile photo.
///
/// Built by the identity backend; the rotator only orders and forwards these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRef {
    pub id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
    /// When the photo was uploaded, as reported by the service.
    pub date: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("uploading {} failed: {reason}", .path.display())]
    Upload { path: PathBuf, reason: String },

    #[error("assigning uploaded photo failed: {0}")]
    Assign(String),

    #[error("listing profile photos failed: {0}")]
    List(String),

    #[error("deleting {count} profile photo(s) failed: {reason}")]
    Delete { count: usize, reason: String },

    #[error("photo {id} is unknown or its reference is stale")]
    StaleReference { id: i64 },

    #[error("rate limited; retry after {0:?}")]
    RateLimited(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Opens sessions against the identity service.
#[async_trait]
pub trait IdentityConnector: Send + Sync {
    type Session: IdentitySession;

    async fn authenticate(&self, credentials: &Credentials) -> Result<Self::Session, RemoteError>;
}

/// An authenticated session. Each call is one unit: it either fully succeeds
/// or reports a single error.
#[async_trait]
pub trait IdentitySession: Send + Sync {
    /// Upload `image` and make it the current profile photo.
    async fn upload_and_assign(&self, image: &Path) -> Result<(), RemoteError>;

    /// Profile photo history in whatever order the service returns it.
    async fn list_profile_photos(&self) -> Result<Vec<PhotoRef>, RemoteError>;

    async fn delete_photos(&self, photos: &[PhotoRef]) -> Result<(), RemoteError>;

    /// Release the session. Called exactly once, after the loop exits.
    async fn teardown(&self) -> Result<(), RemoteError>;
}
