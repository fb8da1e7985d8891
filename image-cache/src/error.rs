use snafu::Snafu;
use std::io;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Download of '{}' was cancelled", url))]
    Cancelled { url: String },

    #[snafu(display(
        "Checksum mismatch for '{}': expected {}, computed {}",
        path.display(),
        expected,
        computed
    ))]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        computed: String,
    },

    #[snafu(display("Failed to read '{}' for hashing: {}", path.display(), source))]
    ChecksumRead { path: PathBuf, source: io::Error },

    #[snafu(display(
        "Download of '{}' failed after {} attempts: {}",
        url,
        attempts,
        message
    ))]
    DownloadExhausted {
        url: String,
        attempts: u32,
        message: String,
    },

    #[snafu(display("GET '{}' returned {}", url, status))]
    DownloadStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[snafu(display("Failed to acquire cache lock '{}': {}", path.display(), source))]
    LockAcquire { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to open cache lock '{}': {}", path.display(), source))]
    LockOpen { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to parse cache metadata at '{}': {}", path.display(), source))]
    MetadataParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to read cache metadata at '{}': {}", path.display(), source))]
    MetadataRead { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to serialize cache metadata: {}", source))]
    MetadataSerialize { source: serde_json::Error },

    #[snafu(display("Failed to write cache metadata at '{}': {}", path.display(), source))]
    MetadataWrite { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to create cache directory '{}': {}", path.display(), source))]
    Mkdir { path: PathBuf, source: io::Error },

    #[snafu(display("Image source '{}' is not a well-known reference or HTTPS URL", source_ref))]
    NotHttps { source_ref: String },

    #[snafu(display("Failed to remove partial download '{}': {}", path.display(), source))]
    RemovePartial { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to rename '{}' to '{}': {}", from.display(), to.display(), source))]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[snafu(display("GET '{}' failed: {}", url, source))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("Failed to stat downloaded file '{}': {}", path.display(), source))]
    Stat { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to stream '{}' to disk at '{}': {}", url, path.display(), source))]
    StreamToDisk {
        url: String,
        path: PathBuf,
        source: io::Error,
    },

    #[snafu(display("Blocking task for cache lock panicked: {}", source))]
    TaskJoin { source: tokio::task::JoinError },

    #[snafu(display("URL '{}' has no file name to cache under", url))]
    UrlFileName { url: String },

    #[snafu(display("Failed to parse image URL '{}': {}", url, source))]
    UrlParse { url: String, source: url::ParseError },
}

pub type Result<T> = std::result::Result<T, Error>;
