//! Resumable, retryable downloads
//!
//! A [`Transfer`] streams one URL into `<dir>/<name>.part` and renames it to
//! `<dir>/<name>` once every expected byte is on disk, so partial files are
//! always distinguishable from complete ones. An existing partial file is
//! resumed with a ranged request when the server supports it.
//!
//! Retries are immediate and strictly sequential within one transfer; the
//! [`TransferScheduler`] bounds how many transfers run at once.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::{Response, StatusCode};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::app::client::PortalClient;
use crate::errors::{TransferError, TransferResult};

pub mod filename;
pub mod scheduler;

pub use filename::{normalize_filename, partial_path, swap_extension};
pub use scheduler::{SchedulerState, TransferFailure, TransferHandle, TransferScheduler};

/// Progress callback receiving `(total_bytes, completed_bytes)`
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Predicate over the output path; `false` skips the transfer
pub type FilterFn = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// How a transfer finished successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// `<dir>/<name>`
    pub path: PathBuf,
    /// Bytes written during this run
    pub bytes_written: u64,
    /// Offset the transfer resumed from, if it resumed
    pub resumed_from: Option<u64>,
    /// The final-extension counterpart already existed, so nothing after
    /// the transfer needs to run
    pub already_complete: bool,
}

/// One download, configured with builder methods
#[derive(Clone)]
pub struct Transfer {
    url: Url,
    dirname: Option<PathBuf>,
    filename: Option<String>,
    detect_filename: bool,
    final_ext: Option<String>,
    filter: Option<FilterFn>,
    progress: Option<ProgressFn>,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("url", &self.url.as_str())
            .field("dirname", &self.dirname)
            .field("filename", &self.filename)
            .field("detect_filename", &self.detect_filename)
            .field("final_ext", &self.final_ext)
            .finish_non_exhaustive()
    }
}

/// How the body of one attempt is written
enum WriteMode {
    Fresh,
    Append { offset: u64 },
}

impl Transfer {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            dirname: None,
            filename: None,
            detect_filename: false,
            final_ext: None,
            filter: None,
            progress: None,
        }
    }

    /// Parses `url` first
    pub fn from_str_url(url: &str) -> TransferResult<Self> {
        let parsed = Url::parse(url).map_err(|e| TransferError::InvalidUrl {
            url: url.to_string(),
            error: e.to_string(),
        })?;
        Ok(Self::new(parsed))
    }

    /// Destination directory, required
    pub fn dirname(mut self, dirname: impl Into<PathBuf>) -> Self {
        self.dirname = Some(dirname.into());
        self
    }

    /// Explicit output filename; normalized
    pub fn filename(mut self, filename: &str) -> Self {
        self.filename = Some(normalize_filename(filename));
        self
    }

    /// Ask the server for the filename with a HEAD request
    pub fn detect_filename(mut self) -> Self {
        self.detect_filename = true;
        self
    }

    /// Treat an existing `<name>` with this extension as already complete
    pub fn final_ext(mut self, ext: impl Into<String>) -> Self {
        self.final_ext = Some(ext.into());
        self
    }

    pub fn filter(mut self, filter: FilterFn) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn report(&self, total: u64, completed: u64) {
        if let Some(progress) = &self.progress {
            progress(total, completed);
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(path))
    }

    /// Runs the transfer with up to `max_retries` attempts
    ///
    /// # Errors
    ///
    /// - `TransferError::Aborted` if the filter rejects the output path
    /// - `TransferError::RangeMismatch` if a resume response has the wrong size
    /// - `TransferError::RetriesExhausted` carrying the last attempt's error
    /// - `TransferError::Cancelled` if the run is interrupted
    pub async fn run(mut self, client: &PortalClient, max_retries: u32) -> TransferResult<TransferOutcome> {
        let dirname = self.dirname.clone().ok_or(TransferError::MissingDirectory)?;

        let provisional = self
            .filename
            .clone()
            .unwrap_or_else(|| filename::url_filename(&self.url));
        let path = dirname.join(&provisional);

        // Decided before any request is made
        if !self.accepts(&path) {
            debug!("Skipping {}", path.display());
            return Err(TransferError::Aborted { path });
        }

        let path = if self.detect_filename {
            let detected = self.detect(client).await?;
            let path = dirname.join(detected);
            if !self.accepts(&path) {
                debug!("Skipping {}", path.display());
                return Err(TransferError::Aborted { path });
            }
            path
        } else {
            path
        };

        if let Some(ext) = &self.final_ext {
            let finished = swap_extension(&path, ext);
            if fs::try_exists(&finished).await.unwrap_or(false) {
                debug!("{} already exists", finished.display());
                return Ok(TransferOutcome {
                    path,
                    bytes_written: 0,
                    resumed_from: None,
                    already_complete: true,
                });
            }
        }

        fs::create_dir_all(&dirname).await?;

        let attempts = max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(client, &path).await {
                Ok(outcome) => {
                    info!("Downloaded {}", path.display());
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Transfer of {} failed (attempt {}/{}): {}. Retrying",
                        path.display(),
                        attempt,
                        attempts,
                        e
                    );
                }
                Err(e) if e.is_retryable() => {
                    return Err(TransferError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// HEAD request; follows redirects and remembers the final URL
    async fn detect(&mut self, client: &PortalClient) -> TransferResult<String> {
        let response = client.send(client.head(self.url.clone())).await?;
        if !response.status().is_success() {
            return Err(TransferError::ServerError {
                status: response.status().as_u16(),
            });
        }
        self.url = response.url().clone();

        let name = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename::content_disposition_filename)
            .map(|name| normalize_filename(&name))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| filename::url_filename(&self.url));
        debug!("Detected filename {}", name);
        Ok(name)
    }

    async fn attempt(&self, client: &PortalClient, path: &Path) -> TransferResult<TransferOutcome> {
        let response = client.send(client.http().get(self.url.clone())).await?;
        check_status(&response)?;
        let total = response.content_length();

        let part = partial_path(path);
        let existing = file_len(&part).await;

        if let (Some(n), Some(len)) = (total, file_len(path).await) {
            if len == n {
                self.report(n, n);
                return Ok(TransferOutcome {
                    path: path.to_path_buf(),
                    bytes_written: 0,
                    resumed_from: None,
                    already_complete: false,
                });
            }
        }

        let (response, mode) = match (total, existing) {
            (Some(n), Some(k)) if k == n => {
                fs::rename(&part, path).await?;
                self.report(n, n);
                return Ok(TransferOutcome {
                    path: path.to_path_buf(),
                    bytes_written: 0,
                    resumed_from: Some(k),
                    already_complete: false,
                });
            }
            (Some(n), Some(k)) if k > 0 && k < n && accepts_ranges(response.headers()) => {
                drop(response);
                self.resume(client, path, n, k).await?
            }
            _ => (response, WriteMode::Fresh),
        };

        self.stream(client, response, path, total, mode).await
    }

    /// Ranged request for bytes `k..`
    ///
    /// The range starts at offset `k`, the first byte not yet on disk.
    async fn resume(
        &self,
        client: &PortalClient,
        path: &Path,
        total: u64,
        offset: u64,
    ) -> TransferResult<(Response, WriteMode)> {
        debug!("Resuming {} from byte {}", path.display(), offset);
        let request = client
            .http()
            .get(self.url.clone())
            .header(header::RANGE, format!("bytes={}-", offset));
        let response = client.send(request).await?;
        check_status(&response)?;

        let received = response.content_length();
        let expected = total - offset;
        match (response.status(), received) {
            (StatusCode::PARTIAL_CONTENT, Some(len)) if len == expected => {
                Ok((response, WriteMode::Append { offset }))
            }
            // Range ignored; the full body follows
            (StatusCode::OK, Some(len)) if len == total => Ok((response, WriteMode::Fresh)),
            _ => Err(TransferError::RangeMismatch {
                filename: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                partial: offset,
                expected,
                received,
            }),
        }
    }

    async fn stream(
        &self,
        client: &PortalClient,
        response: Response,
        path: &Path,
        total: Option<u64>,
        mode: WriteMode,
    ) -> TransferResult<TransferOutcome> {
        let part = partial_path(path);
        let (mut file, offset) = match mode {
            WriteMode::Fresh => (
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&part)
                    .await?,
                0,
            ),
            WriteMode::Append { offset } => (
                OpenOptions::new().append(true).open(&part).await?,
                offset,
            ),
        };

        let mut completed = offset;
        self.report(total.unwrap_or(completed), completed);

        let mut body = std::pin::pin!(response.bytes_stream());
        while let Some(chunk) = client.cancellable(body.next()).await? {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            completed += chunk.len() as u64;
            self.report(total.unwrap_or(completed), completed);
        }
        file.flush().await?;
        drop(file);

        if let Some(n) = total {
            if completed != n {
                return Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("received {} of {} bytes", completed, n),
                )));
            }
        }

        fs::rename(&part, path).await?;

        Ok(TransferOutcome {
            path: path.to_path_buf(),
            bytes_written: completed - offset,
            resumed_from: (offset > 0).then_some(offset),
            already_complete: false,
        })
    }
}

fn check_status(response: &Response) -> TransferResult<()> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(TransferError::ServerError {
            status: response.status().as_u16(),
        })
    }
}

fn accepts_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| !v.is_empty() && v != "none")
}

async fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).await.ok().map(|m| m.len())
}
