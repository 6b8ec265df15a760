//! Directory scanning for rotation candidates.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};
use walkdir::WalkDir;

/// Lowercase extensions accepted into the pool.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Handle to a local image file discovered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageCandidate {
    path: PathBuf,
}

impl ImageCandidate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ImageCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[inline]
pub fn is_image(p: &Path) -> bool {
    matches!(
        p.extension()
            .and_then(OsStr::to_str)
            .map(|s| s.to_ascii_lowercase()),
        Some(ref e) if IMAGE_EXTENSIONS.contains(&e.as_str())
    )
}

/// List the images directly inside `dir`, sorted by file name.
///
/// A missing directory is logged and yields an empty pool; deciding whether
/// that is fatal is up to the caller.
pub fn list_candidates(dir: &Path) -> Vec<ImageCandidate> {
    if !dir.is_dir() {
        error!(dir = %dir.display(), "images directory does not exist");
        return Vec::new();
    }

    let mut candidates = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!("skipping unreadable entry: {err}");
                continue;
            }
        };
        if entry.file_type().is_file() && is_image(entry.path()) {
            candidates.push(ImageCandidate::new(entry.into_path()));
        }
    }

    info!(
        dir = %dir.display(),
        discovered = candidates.len(),
        "image pool scanned"
    );
    candidates
}
