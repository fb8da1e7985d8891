/*!
`image-cache` is a content-addressed, cross-process-safe cache of base images
for test environments.

An image is identified by its *source* string, either a well-known short
reference (`ubuntu:24.04`) resolved through the built-in [`registry`], or a
full HTTPS URL. The cache key is the SHA-256 of the source string; each key is
guarded by an advisory file lock under `<cacheDir>/.locks/` so concurrent
test processes download a given image at most once.

Cache state is kept in `<cacheDir>/metadata.json`, written atomically
(temp-file + rename) and reloaded at construction. Image payloads live at
`<cacheDir>/<image-name>/<file>`.
*/

pub mod download;
mod error;
pub mod registry;

pub use download::{file_sha256, verify_checksum, Downloader};
pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const METADATA_FILE: &str = "metadata.json";
const LOCK_DIR: &str = ".locks";
const METADATA_VERSION: u32 = 1;

/// Lifecycle of a cache entry.
///
/// `Customizing` is set by callers that post-process an image in place
/// (e.g. `virt-customize`) so other processes do not treat it as ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Downloading,
    Ready,
    Failed,
    Customizing,
}

/// One cached image, keyed in the metadata by the SHA-256 of its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntry {
    pub name: String,
    pub source: String,
    pub resolved_url: String,
    pub local_path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
    pub status: ImageStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheMetadata {
    version: u32,
    entries: BTreeMap<String, ImageEntry>,
}

impl Default for CacheMetadata {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// The image cache. See the crate docs for the on-disk layout.
#[derive(Debug)]
pub struct ImageCache {
    cache_dir: PathBuf,
    metadata: Mutex<CacheMetadata>,
    downloader: Downloader,
}

impl ImageCache {
    /// Opens (creating if needed) a cache rooted at `cache_dir` and loads its
    /// metadata.
    pub fn new<P: AsRef<Path>>(cache_dir: P) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir).context(error::MkdirSnafu { path: &cache_dir })?;
        fs::create_dir_all(cache_dir.join(LOCK_DIR)).context(error::MkdirSnafu {
            path: cache_dir.join(LOCK_DIR),
        })?;

        let metadata_path = cache_dir.join(METADATA_FILE);
        let metadata = if metadata_path.exists() {
            let raw = fs::read_to_string(&metadata_path).context(error::MetadataReadSnafu {
                path: &metadata_path,
            })?;
            serde_json::from_str(&raw).context(error::MetadataParseSnafu {
                path: &metadata_path,
            })?
        } else {
            CacheMetadata::default()
        };

        Ok(Self {
            cache_dir,
            downloader: Downloader::default(),
            metadata: Mutex::new(metadata),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Ensures a local copy of the image named by `source`, downloading if the
    /// cache has no healthy copy, and returns the resulting entry.
    ///
    /// `expected_sha256` (if given) is verified against both cached and
    /// freshly-downloaded payloads; a mismatch on a cached file triggers a
    /// re-download, a mismatch on a fresh download is an error.
    pub async fn ensure_image(
        &self,
        cancel: &CancellationToken,
        name: &str,
        source: &str,
        expected_sha256: Option<&str>,
    ) -> Result<ImageEntry> {
        let (resolved_url, registered_sha256) = match registry::resolve(source) {
            Some(well_known) => (well_known.url, well_known.sha256),
            None => {
                ensure!(
                    source.starts_with("https://"),
                    error::NotHttpsSnafu { source_ref: source }
                );
                (source.to_string(), None)
            }
        };
        let expected = expected_sha256
            .map(str::to_string)
            .or(registered_sha256)
            .unwrap_or_default();

        let key = hex::encode(Sha256::digest(source.as_bytes()));
        // Cross-process exclusion first, then the in-process metadata lock.
        // The lock is released when `_flock` drops at the end of this call.
        let _flock = self.acquire_key_lock(&key).await?;
        let mut metadata = self.metadata.lock().await;

        if let Some(entry) = metadata.entries.get(&key) {
            if entry.status == ImageStatus::Ready && entry.local_path.is_file() {
                match Self::verify_blocking(entry.local_path.clone(), expected.clone()).await {
                    Ok(()) => {
                        debug!("Cache hit for '{}' at '{}'", source, entry.local_path.display());
                        return Ok(entry.clone());
                    }
                    Err(e) => {
                        warn!("Cached copy of '{}' failed verification, re-downloading: {}", source, e);
                    }
                }
            }
        }

        let dest_dir = self.cache_dir.join(name);
        fs::create_dir_all(&dest_dir).context(error::MkdirSnafu { path: &dest_dir })?;
        let file_name = url_file_name(&resolved_url)?;
        let dest = dest_dir.join(file_name);

        let mut entry = ImageEntry {
            name: name.to_string(),
            source: source.to_string(),
            resolved_url: resolved_url.clone(),
            local_path: dest.clone(),
            sha256: String::new(),
            size_bytes: 0,
            downloaded_at: Utc::now(),
            status: ImageStatus::Downloading,
        };
        metadata.entries.insert(key.clone(), entry.clone());
        self.persist(&metadata)?;

        info!("Downloading '{}' from '{}'", name, resolved_url);
        let outcome = self.downloader.fetch(cancel, &resolved_url, &dest).await;
        if let Err(e) = outcome {
            entry.status = ImageStatus::Failed;
            metadata.entries.insert(key.clone(), entry);
            self.persist(&metadata)?;
            remove_if_present(&dest)?;
            return Err(e);
        }

        if let Err(e) = Self::verify_blocking(dest.clone(), expected).await {
            entry.status = ImageStatus::Failed;
            metadata.entries.insert(key.clone(), entry);
            self.persist(&metadata)?;
            remove_if_present(&dest)?;
            return Err(e);
        }

        let size = fs::metadata(&dest)
            .context(error::StatSnafu { path: &dest })?
            .len();
        let dest_for_hash = dest.clone();
        let sha256 = tokio::task::spawn_blocking(move || file_sha256(&dest_for_hash))
            .await
            .context(error::TaskJoinSnafu)??;

        entry.sha256 = sha256;
        entry.size_bytes = size;
        entry.downloaded_at = Utc::now();
        entry.status = ImageStatus::Ready;
        metadata.entries.insert(key, entry.clone());
        self.persist(&metadata)?;
        info!(
            "Image '{}' ready at '{}' ({} bytes)",
            name,
            dest.display(),
            size
        );
        Ok(entry)
    }

    /// Read-only lookup of a ready image by name. Never downloads.
    pub async fn get_image_path(&self, name: &str) -> Option<PathBuf> {
        let metadata = self.metadata.lock().await;
        metadata
            .entries
            .values()
            .find(|entry| entry.name == name && entry.status == ImageStatus::Ready)
            .map(|entry| entry.local_path.clone())
    }

    /// Takes the per-key advisory file lock, blocking until it is granted.
    async fn acquire_key_lock(&self, key: &str) -> Result<File> {
        let lock_path = self.cache_dir.join(LOCK_DIR).join(format!("{}.lock", key));
        tokio::task::spawn_blocking(move || -> Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)
                .context(error::LockOpenSnafu { path: &lock_path })?;
            file.lock_exclusive()
                .context(error::LockAcquireSnafu { path: &lock_path })?;
            Ok(file)
        })
        .await
        .context(error::TaskJoinSnafu)?
    }

    async fn verify_blocking(path: PathBuf, expected: String) -> Result<()> {
        tokio::task::spawn_blocking(move || verify_checksum(&path, &expected))
            .await
            .context(error::TaskJoinSnafu)?
    }

    /// Writes metadata atomically: serialize to `metadata.json.tmp`, rename.
    fn persist(&self, metadata: &CacheMetadata) -> Result<()> {
        let path = self.cache_dir.join(METADATA_FILE);
        let tmp = self.cache_dir.join(format!("{}.tmp", METADATA_FILE));
        let raw = serde_json::to_string_pretty(metadata).context(error::MetadataSerializeSnafu)?;
        fs::write(&tmp, raw).context(error::MetadataWriteSnafu { path: &tmp })?;
        fs::rename(&tmp, &path).context(error::RenameSnafu {
            from: &tmp,
            to: &path,
        })?;
        Ok(())
    }
}

fn url_file_name(url: &str) -> Result<&str> {
    url.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .context(error::UrlFileNameSnafu { url })
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(error::RemovePartialSnafu { path }),
    }
}
