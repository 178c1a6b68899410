//! HTTP fetch implementation
//!
//! Every page and file request of a run goes through [`Downloader`], which
//! retries transient failures a fixed number of times. File fetches consult
//! the record store first, resolve the local name from the response, and never
//! overwrite a file that is already on disk.

use std::{
    io,
    path::Path,
    sync::Arc,
    time::Duration,
};

use reqwest::{Client, Url, header};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::models::{
    DownloadOutcome, FetchError, conflict_name, extract_file_id, fallback_filename,
    parse_content_disposition,
};
use crate::{
    config::FetchConfig,
    db::{FileRecord, FileStatus, RecordStore, StoreError, StoreHandle},
    sanitize::{sanitize_filename, split_extension},
    util::checksum,
};

/// A successful response, fully read
#[derive(Debug)]
pub struct Fetched {
    pub url: Url,
    pub headers: header::HeaderMap,
    pub body: Vec<u8>,
}

impl Fetched {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Local name announced by the server, if any
    pub fn announced_filename(&self) -> Option<String> {
        let value = self.headers.get(header::CONTENT_DISPOSITION)?;
        parse_content_disposition(&String::from_utf8_lossy(value.as_bytes()))
    }
}

#[derive(Clone)]
pub struct Downloader {
    client: Client,
    store: Arc<RecordStore>,
    max_attempts: u32,
    retry_delay: Duration,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl Downloader {
    /// `client` must be the logged-in session's client; its cookies authorise every request.
    pub fn new(
        client: Client,
        store: Arc<RecordStore>,
        config: &FetchConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            client,
            store,
            max_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay(),
            cancel_token,
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// GET `url`, retrying connection failures, timeouts and server errors.
    ///
    /// Client errors (4xx) fail at once.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn get_with_retry(&self, url: &Url) -> Result<Fetched, FetchError> {
        let mut attempt = 1;

        loop {
            match self.get_once(url).await {
                Ok(fetched) => {
                    trace!(attempt, bytes = fetched.body.len(), "Request succeeded");
                    return Ok(fetched);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_secs = self.retry_delay.as_secs(),
                        "Request failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel_token.cancelled() => {
                            info!("Run cancelled during retry wait");
                            return Err(FetchError::Cancelled);
                        }
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(FetchError::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch a listing or detail page as text
    pub async fn get_page(&self, url: &Url) -> Result<String, FetchError> {
        Ok(self.get_with_retry(url).await?.text())
    }

    async fn get_once(&self, url: &Url) -> Result<Fetched, FetchError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        let final_url = response.url().clone();
        let headers = response.headers().clone();
        let body: Vec<u8> = response.bytes().await?.into();
        Ok(Fetched {
            url: final_url,
            headers,
            body,
        })
    }

    /// Fetch one remote file into `destination`.
    ///
    /// Per-file problems come back as [`DownloadOutcome::Failed`]; only record
    /// store failures, which make the whole run untrustworthy, are errors.
    #[instrument(level = "debug", skip(self, handle), fields(url = %url))]
    pub async fn fetch_file(
        &self,
        url: &Url,
        destination: &Path,
        handle: &StoreHandle,
    ) -> Result<DownloadOutcome, StoreError> {
        let file_id = extract_file_id(url.as_str());

        if let Some(id) = file_id {
            if !self.store.is_full_rescan() {
                match handle.status(id)? {
                    FileStatus::Exists => {
                        debug!(id, "Already recorded, skipping");
                        return Ok(DownloadOutcome::SkippedAlreadyRecorded);
                    }
                    FileStatus::Deleted => {
                        info!(id, "Recorded as deleted, fetching again");
                    }
                    FileStatus::New => {}
                }
            }
        }

        let fetched = match self.get_with_retry(url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(error = %e, destination = ?destination, "Download failed");
                return Ok(DownloadOutcome::Failed(e.to_string()));
            }
        };
        trace!(final_url = %fetched.url, bytes = fetched.body.len(), "Downloaded");

        let name = sanitize_filename(
            &fetched
                .announced_filename()
                .unwrap_or_else(fallback_filename),
        );

        let outcome = match store_body(destination, &name, &fetched.body).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Failed to save download");
                return Ok(DownloadOutcome::Failed(e.to_string()));
            }
        };

        if let (true, Some(path)) = (outcome.is_write(), outcome.path()) {
            match file_id {
                Some(id) => self.store.enqueue(FileRecord::new(id, path))?,
                None => warn!(path = ?path, "No file identifier in URL, the file will not be recorded"),
            }
        }

        info!(outcome = %outcome, "Fetched file");
        Ok(outcome)
    }
}

/// Put `body` at `destination/name` without ever replacing an existing file.
///
/// Identical content at the resolved path (or at one of its conflict names)
/// is left alone; different content is written to the first unused conflict
/// name.
pub async fn store_body(
    destination: &Path,
    name: &str,
    body: &[u8],
) -> Result<DownloadOutcome, FetchError> {
    tokio::fs::create_dir_all(destination)
        .await
        .map_err(|source| FetchError::Write {
            path: destination.to_path_buf(),
            source,
        })?;

    let target = destination.join(name);
    if write_new(&target, body).await? {
        return Ok(DownloadOutcome::WrittenNew(target));
    }

    let body_checksum = checksum(body);
    if has_checksum(&target, body_checksum).await? {
        debug!(path = ?target, "Identical file already on disk");
        return Ok(DownloadOutcome::SkippedIdentical(target));
    }

    let (stem, extension) = split_extension(name);
    let mut attempt = 1;
    loop {
        let candidate = destination.join(conflict_name(stem, extension, attempt));
        if write_new(&candidate, body).await? {
            info!(original = ?target, renamed = ?candidate, "Remote file changed, kept both copies");
            return Ok(DownloadOutcome::RenamedConflict(candidate));
        }
        if has_checksum(&candidate, body_checksum).await? {
            debug!(path = ?candidate, "Identical file already on disk under a conflict name");
            return Ok(DownloadOutcome::SkippedIdentical(candidate));
        }
        attempt += 1;
    }
}

/// Create `path` and write `body` into it. Returns false if `path` already exists.
pub(crate) async fn write_new(path: &Path, body: &[u8]) -> Result<bool, FetchError> {
    let write_error = |source| FetchError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(write_error(e)),
    };

    let written = async {
        file.write_all(body).await?;
        file.flush().await
    }
    .await;

    if let Err(e) = written {
        // never leave a partial file behind
        let _ = tokio::fs::remove_file(path).await;
        return Err(write_error(e));
    }
    Ok(true)
}

async fn has_checksum(path: &Path, expected: u32) -> Result<bool, FetchError> {
    let existing = tokio::fs::read(path)
        .await
        .map_err(|source| FetchError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(checksum(&existing) == expected)
}
