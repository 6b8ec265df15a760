//! Pruning of the remote profile photo history down to a fixed bound.

use tracing::{debug, info};

use crate::remote::{IdentitySession, PhotoRef, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    keep: usize,
}

impl RetentionPolicy {
    pub fn new(keep: usize) -> Self {
        Self { keep }
    }

    pub fn keep(&self) -> usize {
        self.keep
    }

    /// Run one eviction pass against `session`.
    ///
    /// Fetches the history fresh, orders it oldest-to-newest and deletes
    /// everything but the newest `keep` entries in a single batch. Returns the
    /// number of deleted photos; no delete call is made when that is zero.
    pub async fn prune<S>(&self, session: &S) -> Result<usize, RemoteError>
    where
        S: IdentitySession + ?Sized,
    {
        let mut photos = session.list_profile_photos().await?;
        order_oldest_first(&mut photos);
        let evict = compute_eviction_set(&photos, self.keep);
        if evict.is_empty() {
            debug!(history = photos.len(), keep = self.keep, "nothing to evict");
            return Ok(0);
        }

        session.delete_photos(&evict).await?;
        info!(
            evicted = evict.len(),
            kept = photos.len() - evict.len(),
            "old profile photos deleted"
        );
        Ok(evict.len())
    }
}

/// Photos to delete so that at most `keep` remain.
///
/// `current` must already be ordered oldest-to-newest; the returned refs are
/// the oldest `len - keep` entries, in that same order.
pub fn compute_eviction_set(current: &[PhotoRef], keep: usize) -> Vec<PhotoRef> {
    if current.len() <= keep {
        return Vec::new();
    }
    current[..current.len() - keep].to_vec()
}

/// Sort by upload date, then id. Stable, so equal keys keep the service's order.
pub fn order_oldest_first(photos: &mut [PhotoRef]) {
    photos.sort_by_key(|p| (p.date, p.id));
}
