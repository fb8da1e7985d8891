//! HTTPS downloader for base images.
//!
//! Follows the fetch-to-temp-then-rename pattern: the response body is
//! streamed into `<dest>.tmp` and only renamed into place once the transfer
//! completes, so a readable file at the destination is always a complete one.
//! Transient failures (5xx, connection resets, DNS hiccups, timeouts) are
//! retried with exponential backoff; 4xx responses and cancellation are not.

use crate::error::{self, Result};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use snafu::{ensure, ResultExt};
use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const DEFAULT_ATTEMPTS: u32 = 4;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    attempts: u32,
    backoff_base: Duration,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF_BASE)
    }
}

impl Downloader {
    pub fn new(attempts: u32, backoff_base: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            attempts: attempts.max(1),
            backoff_base,
        }
    }

    /// Downloads `url` to `dest`, retrying transient failures.
    ///
    /// Only `https` URLs are accepted. On success the file at `dest` is
    /// complete; on failure no file is left at `dest`.
    pub async fn fetch(&self, cancel: &CancellationToken, url: &str, dest: &Path) -> Result<()> {
        let parsed = url::Url::parse(url).context(error::UrlParseSnafu { url })?;
        ensure!(
            parsed.scheme() == "https",
            error::NotHttpsSnafu { source_ref: url }
        );

        let tmp = dest.with_extension("tmp");
        let mut last_error = String::new();
        for attempt in 0..self.attempts {
            if attempt > 0 {
                // base * 2^(n-1) before the nth retry
                let delay = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                debug!("Retrying '{}' in {:?} (attempt {})", url, delay, attempt + 1);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return error::CancelledSnafu { url }.fail();
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.fetch_once(cancel, url, &tmp).await {
                Ok(()) => {
                    std::fs::rename(&tmp, dest).context(error::RenameSnafu {
                        from: &tmp,
                        to: dest,
                    })?;
                    return Ok(());
                }
                Err(e) => {
                    remove_if_present(&tmp)?;
                    if !retryable(&e) {
                        return Err(e);
                    }
                    warn!("Transient failure fetching '{}': {}", url, e);
                    last_error = e.to_string();
                }
            }
        }

        error::DownloadExhaustedSnafu {
            url,
            attempts: self.attempts,
            message: last_error,
        }
        .fail()
    }

    async fn fetch_once(&self, cancel: &CancellationToken, url: &str, tmp: &Path) -> Result<()> {
        let mut response = tokio::select! {
            _ = cancel.cancelled() => {
                return error::CancelledSnafu { url }.fail();
            }
            r = self.client.get(url).send() => {
                r.context(error::RequestSnafu { url })?
            }
        };
        let status = response.status();
        ensure!(
            status.is_success(),
            error::DownloadStatusSnafu { url, status }
        );

        let mut file = tokio::fs::File::create(tmp)
            .await
            .context(error::StreamToDiskSnafu { url, path: tmp })?;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    return error::CancelledSnafu { url }.fail();
                }
                c = response.chunk() => c.context(error::RequestSnafu { url })?,
            };
            match chunk {
                Some(bytes) => {
                    file.write_all(&bytes)
                        .await
                        .context(error::StreamToDiskSnafu { url, path: tmp })?;
                }
                None => break,
            }
        }
        file.flush()
            .await
            .context(error::StreamToDiskSnafu { url, path: tmp })?;
        Ok(())
    }
}

/// Decides whether a failed attempt is worth retrying.
///
/// 5xx statuses and transport-level failures (reset, refused, unreachable,
/// DNS, timeout) are transient; everything else, including 4xx and
/// cancellation, is final.
fn retryable(error: &crate::Error) -> bool {
    match error {
        crate::Error::DownloadStatus { status, .. } => status.is_server_error(),
        crate::Error::Request { source, .. } => {
            if source.is_timeout() || source.is_connect() {
                return true;
            }
            let detail = format!("{:?}", source).to_lowercase();
            detail.contains("reset")
                || detail.contains("refused")
                || detail.contains("unreachable")
                || detail.contains("dns")
        }
        _ => false,
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(error::RemovePartialSnafu { path }),
    }
}

/// Computes the SHA-256 of a file as lowercase hex.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut f = File::open(path).context(error::ChecksumReadSnafu { path })?;
    let mut digest = Sha256::new();
    io::copy(&mut f, &mut digest).context(error::ChecksumReadSnafu { path })?;
    Ok(hex::encode(digest.finalize()))
}

/// Verifies a file against an expected SHA-256, case-insensitively.
///
/// An empty `expected` skips verification and succeeds.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    if expected.is_empty() {
        return Ok(());
    }
    let computed = file_sha256(path)?;
    ensure!(
        computed.eq_ignore_ascii_case(expected),
        error::ChecksumMismatchSnafu {
            path,
            expected,
            computed,
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // sha256 of "hello world\n"
    const HELLO_SHA256: &str = "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447";

    fn fixture(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn empty_expected_skips_verification() {
        let f = fixture(b"anything at all");
        verify_checksum(f.path(), "").unwrap();
    }

    #[test]
    fn checksum_compare_is_case_insensitive() {
        let f = fixture(b"hello world\n");
        verify_checksum(f.path(), HELLO_SHA256).unwrap();
        verify_checksum(f.path(), &HELLO_SHA256.to_uppercase()).unwrap();
    }

    #[test]
    fn checksum_mismatch_is_an_error() {
        let f = fixture(b"hello world\n");
        let err = verify_checksum(f.path(), "deadbeef").unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[tokio::test]
    async fn non_https_is_rejected_without_retry() {
        let downloader = Downloader::default();
        let cancel = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let err = downloader
            .fetch(
                &cancel,
                "http://mirror.example.test/image.img",
                &dir.path().join("image.img"),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTPS"));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_request() {
        let downloader = Downloader::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let dir = tempfile::tempdir().unwrap();
        let err = downloader
            .fetch(
                &cancel,
                "https://mirror.example.test/image.img",
                &dir.path().join("image.img"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Cancelled { .. }));
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = crate::Error::DownloadStatus {
            url: "https://example.test/x".to_string(),
            status: reqwest::StatusCode::BAD_GATEWAY,
        };
        assert!(retryable(&err));

        let err = crate::Error::DownloadStatus {
            url: "https://example.test/x".to_string(),
            status: reqwest::StatusCode::NOT_FOUND,
        };
        assert!(!retryable(&err));
    }
}
