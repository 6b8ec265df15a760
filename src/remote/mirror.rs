//! Identity backend that publishes the profile photo into a local directory.
//!
//! Layout under `<root>/<session>/`:
//! - `photo-<id>.<ext>`: every uploaded photo still in the history
//! - `current.<ext>`: copy of the photo currently assigned
//! - `history.json`: the photo history and the id counter

use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::{IdentityConnector, IdentitySession, PhotoRef, RemoteError};
use crate::config::Credentials;

const MANIFEST_FILE: &str = "history.json";
const CURRENT_STEM: &str = "current";
const FILE_REFERENCE_LEN: usize = 8;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Manifest {
    last_id: i64,
    current: Option<i64>,
    /// Oldest first.
    photos: Vec<StoredPhoto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StoredPhoto {
    photo: PhotoRef,
    file_name: String,
}

#[derive(Debug, Clone)]
pub struct MirrorConnector {
    root: PathBuf,
}

impl MirrorConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl IdentityConnector for MirrorConnector {
    type Session = MirrorSession;

    #[instrument(skip(self, credentials), fields(root = %self.root.display()))]
    async fn authenticate(&self, credentials: &Credentials) -> Result<MirrorSession, RemoteError> {
        if credentials.api_id == 0 || credentials.api_hash.trim().is_empty() {
            return Err(RemoteError::Auth("api id and api hash are required".into()));
        }
        let session = credentials.session.trim();
        if !is_plain_name(session) {
            return Err(RemoteError::Auth(format!(
                "session '{session}' must be a single plain path component"
            )));
        }

        let dir = self.root.join(session);
        fs::create_dir_all(&dir).await?;
        let manifest = load_manifest(&dir).await?;
        info!(
            dir = %dir.display(),
            api_id = credentials.api_id,
            photos = manifest.photos.len(),
            "mirror session opened"
        );
        Ok(MirrorSession {
            dir,
            manifest: Mutex::new(manifest),
        })
    }
}

#[derive(Debug)]
pub struct MirrorSession {
    dir: PathBuf,
    manifest: Mutex<Manifest>,
}

impl MirrorSession {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the currently assigned photo, if any.
    pub async fn current_photo(&self) -> Option<PathBuf> {
        let manifest = self.manifest.lock().await;
        let id = manifest.current?;
        manifest
            .photos
            .iter()
            .find(|stored| stored.photo.id == id)
            .map(|stored| self.dir.join(current_file_name(&stored.file_name)))
    }
}

#[async_trait]
impl IdentitySession for MirrorSession {
    async fn upload_and_assign(&self, image: &Path) -> Result<(), RemoteError> {
        let mut manifest = self.manifest.lock().await;
        let id = manifest.last_id + 1;
        let ext = image
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "jpg".to_string());
        let file_name = format!("photo-{id}.{ext}");
        let uploaded = self.dir.join(&file_name);

        fs::copy(image, &uploaded)
            .await
            .map_err(|err| RemoteError::Upload {
                path: image.to_path_buf(),
                reason: err.to_string(),
            })?;
        debug!(id, file = %uploaded.display(), "mirror: uploaded");

        if let Err(err) = self.assign(&uploaded, &ext).await {
            // An unassigned upload never shows up in the history.
            let _ = fs::remove_file(&uploaded).await;
            return Err(RemoteError::Assign(err.to_string()));
        }

        let (access_hash, file_reference) = mint_reference();
        // Never older than the existing history, even if the wall clock stepped back.
        let date = manifest
            .photos
            .iter()
            .map(|stored| stored.photo.date)
            .fold(Utc::now(), |newest, date| newest.max(date));
        manifest.last_id = id;
        manifest.current = Some(id);
        manifest.photos.push(StoredPhoto {
            photo: PhotoRef {
                id,
                access_hash,
                file_reference,
                date,
            },
            file_name,
        });
        persist(&self.dir, &manifest).await?;
        info!(id, "mirror: profile photo assigned");
        Ok(())
    }

    async fn list_profile_photos(&self) -> Result<Vec<PhotoRef>, RemoteError> {
        let manifest = self.manifest.lock().await;
        // Newest first, like most identity services.
        Ok(manifest
            .photos
            .iter()
            .rev()
            .map(|stored| stored.photo.clone())
            .collect())
    }

    async fn delete_photos(&self, photos: &[PhotoRef]) -> Result<(), RemoteError> {
        let mut manifest = self.manifest.lock().await;

        // Validate the whole batch before touching anything.
        for wanted in photos {
            let known = manifest.photos.iter().any(|stored| {
                stored.photo.id == wanted.id
                    && stored.photo.access_hash == wanted.access_hash
                    && stored.photo.file_reference == wanted.file_reference
            });
            if !known {
                return Err(RemoteError::StaleReference { id: wanted.id });
            }
        }

        let wanted: HashSet<i64> = photos.iter().map(|p| p.id).collect();
        let mut removed = HashSet::new();
        let mut failure = None;
        for stored in manifest.photos.iter().filter(|s| wanted.contains(&s.photo.id)) {
            match remove_if_exists(&self.dir.join(&stored.file_name)).await {
                Ok(()) => {
                    removed.insert(stored.photo.id);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        manifest.photos.retain(|stored| !removed.contains(&stored.photo.id));
        if manifest.current.is_some_and(|id| removed.contains(&id)) {
            manifest.current = None;
            if let Err(err) = self.clear_current(None).await {
                failure.get_or_insert(err);
            }
        }
        persist(&self.dir, &manifest).await?;

        match failure {
            Some(err) => Err(RemoteError::Delete {
                count: photos.len(),
                reason: err.to_string(),
            }),
            None => {
                debug!(removed = removed.len(), "mirror: photos deleted");
                Ok(())
            }
        }
    }

    async fn teardown(&self) -> Result<(), RemoteError> {
        let manifest = self.manifest.lock().await;
        persist(&self.dir, &manifest).await?;
        info!(dir = %self.dir.display(), "mirror session closed");
        Ok(())
    }
}

impl MirrorSession {
    async fn assign(&self, uploaded: &Path, ext: &str) -> io::Result<()> {
        let current = self.dir.join(format!("{CURRENT_STEM}.{ext}"));
        let staging = self.dir.join(format!(".{CURRENT_STEM}.{ext}.tmp"));
        fs::copy(uploaded, &staging).await?;
        fs::rename(&staging, &current).await?;
        self.clear_current(Some(&current)).await
    }

    /// Remove `current.*` files other than `keep`.
    async fn clear_current(&self, keep: Option<&Path>) -> io::Result<()> {
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_current = path.file_stem().and_then(|s| s.to_str()) == Some(CURRENT_STEM);
            if is_current && keep != Some(path.as_path()) {
                remove_if_exists(&path).await?;
            }
        }
        Ok(())
    }
}

fn current_file_name(uploaded_name: &str) -> String {
    match Path::new(uploaded_name).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{CURRENT_STEM}.{ext}"),
        None => CURRENT_STEM.to_string(),
    }
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn mint_reference() -> (i64, Vec<u8>) {
    let mut rng = rand::rng();
    let mut file_reference = vec![0u8; FILE_REFERENCE_LEN];
    rng.fill(&mut file_reference[..]);
    (rng.random(), file_reference)
}

async fn load_manifest(dir: &Path) -> Result<Manifest, RemoteError> {
    match fs::read(dir.join(MANIFEST_FILE)).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|err| RemoteError::Auth(format!("unreadable {MANIFEST_FILE}: {err}"))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Manifest::default()),
        Err(err) => Err(err.into()),
    }
}

async fn persist(dir: &Path, manifest: &Manifest) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    let staging = dir.join(format!(".{MANIFEST_FILE}.tmp"));
    fs::write(&staging, bytes).await?;
    fs::rename(&staging, dir.join(MANIFEST_FILE)).await
}

async fn remove_if_exists(p: &Path) -> io::Result<()> {
    match fs::remove_file(p).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %p.display(), "delete: already gone; skipping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
