//! Resource fetching: list a job's inputs and download them to scratch files.
//!
//! ## Why temp files instead of buffers?
//!
//! A session can hold dozens of full-resolution screenshots. Spilling each
//! download to a [`TempPath`] inside the job's scratch directory keeps
//! memory flat while downloads overlap, and ties deletion of every local
//! file to the lifetime of its [`ResourceHandle`]: released explicitly on
//! the normal path, removed by `Drop` on every other one.
//!
//! ## Failure policy
//!
//! A single failed download is not fatal. It is logged, reported back as a
//! [`FetchError`], and excluded from the result. Whether the surviving set
//! is still usable is the caller's decision.

use crate::clients::ObjectStore;
use crate::error::{FetchError, JobError};
use crate::pipeline::{bounded, file_name};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tracing::{debug, info, warn};

/// File the storage console creates to materialise an empty folder.
pub const PLACEHOLDER_MARKER: &str = ".emptyFolderPlaceholder";

/// Screenshot extensions accepted from the `screenshots` folder.
pub const SCREENSHOT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// One downloaded object, backed by a local file that lives as long as the handle.
#[derive(Debug)]
pub struct ResourceHandle {
    remote_key: String,
    display_name: String,
    local: TempPath,
}

impl ResourceHandle {
    pub fn remote_key(&self) -> &str {
        &self.remote_key
    }

    /// Original file name, used as the page caption.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }

    /// Delete the local file now, reporting failure instead of ignoring it.
    pub fn release(self) -> Result<(), JobError> {
        let key = self.remote_key;
        self.local
            .close()
            .map_err(|e| JobError::Internal(format!("could not delete local copy of '{key}': {e}")))
    }
}

/// Remote keys of everything one job needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInputs {
    /// Screenshot keys in listing-name order.
    pub screenshots: Vec<String>,
    /// Key of the event log.
    pub data_file: String,
}

pub struct ResourceFetcher {
    objects: Arc<dyn ObjectStore>,
    scratch: PathBuf,
    concurrency: usize,
    timeout: Duration,
}

impl ResourceFetcher {
    /// `scratch` must exist and outlive every handle the fetcher returns.
    pub fn new(objects: Arc<dyn ObjectStore>, scratch: impl Into<PathBuf>, concurrency: usize, timeout: Duration) -> Self {
        Self {
            objects,
            scratch: scratch.into(),
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// List `<owner>/<job>/screenshots` and `<owner>/<job>/json`.
    ///
    /// Fails with `NotFound` when there is no screenshot or no `.json` file.
    pub async fn list_inputs(&self, owner_id: &str, job_id: &str) -> Result<JobInputs, JobError> {
        let shots_dir = format!("{owner_id}/{job_id}/screenshots");
        let mut shots: Vec<String> = self
            .list_dir(&shots_dir)
            .await?
            .into_iter()
            .filter(|name| has_extension(name, SCREENSHOT_EXTENSIONS))
            .collect();
        shots.sort();
        if shots.is_empty() {
            return Err(JobError::not_found(format!("screenshots under '{shots_dir}'")));
        }

        let data_dir = format!("{owner_id}/{job_id}/json");
        let mut data: Vec<String> = self
            .list_dir(&data_dir)
            .await?
            .into_iter()
            .filter(|name| has_extension(name, &["json"]))
            .collect();
        data.sort();
        let Some(data_name) = data.into_iter().next() else {
            return Err(JobError::not_found(format!("event log (.json) under '{data_dir}'")));
        };

        info!("Found {} screenshots and event log {}", shots.len(), data_name);
        Ok(JobInputs {
            screenshots: shots.into_iter().map(|n| format!("{shots_dir}/{n}")).collect(),
            data_file: format!("{data_dir}/{data_name}"),
        })
    }

    async fn list_dir(&self, dir: &str) -> Result<Vec<String>, JobError> {
        let entries = bounded(&format!("listing '{dir}'"), self.timeout, self.objects.list(dir))
            .await?
            .map_err(|e| JobError::upstream("object store", format!("listing '{dir}': {e}")))?;
        Ok(entries
            .into_iter()
            .map(|e| e.name)
            .filter(|name| name != PLACEHOLDER_MARKER)
            .collect())
    }

    /// Download one object into a scratch file.
    pub async fn fetch_one(&self, key: &str) -> Result<ResourceHandle, FetchError> {
        let bytes = match tokio::time::timeout(self.timeout, self.objects.download(key)).await {
            Err(_) => {
                return Err(FetchError::Timeout {
                    key: key.to_string(),
                    secs: self.timeout.as_secs(),
                })
            }
            Ok(Err(e)) => {
                return Err(FetchError::Download {
                    key: key.to_string(),
                    detail: e.to_string(),
                })
            }
            Ok(Ok(bytes)) => bytes,
        };

        let write_err = |e: std::io::Error| FetchError::Write {
            key: key.to_string(),
            detail: e.to_string(),
        };
        let display_name = file_name(key).to_string();
        let local = tempfile::Builder::new()
            .prefix("res-")
            .suffix(&format!("-{display_name}"))
            .tempfile_in(&self.scratch)
            .map_err(write_err)?
            .into_temp_path();
        // On a failed write `local` drops here and removes the partial file.
        tokio::fs::write(&local, &bytes).await.map_err(write_err)?;

        debug!("Downloaded {} ({} bytes)", key, bytes.len());
        Ok(ResourceHandle {
            remote_key: key.to_string(),
            display_name,
            local,
        })
    }

    /// Download every key with at most `concurrency` requests in flight.
    ///
    /// Keys naming the folder placeholder are skipped. No ordering guarantee.
    pub async fn fetch_all(&self, keys: &[String]) -> Vec<ResourceHandle> {
        self.fetch_all_with_errors(keys).await.0
    }

    /// Like [`fetch_all`](Self::fetch_all), also returning the excluded failures.
    pub async fn fetch_all_with_errors(&self, keys: &[String]) -> (Vec<ResourceHandle>, Vec<FetchError>) {
        let wanted: Vec<String> = keys
            .iter()
            .filter(|k| file_name(k) != PLACEHOLDER_MARKER)
            .cloned()
            .collect();

        // Owned keys: the futures must not borrow the closure argument.
        let results: Vec<Result<ResourceHandle, FetchError>> = stream::iter(wanted)
            .map(|key| async move { self.fetch_one(&key).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut handles = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(h) => handles.push(h),
                Err(e) => {
                    warn!("Excluding {}: {}", e.key(), e);
                    errors.push(e);
                }
            }
        }
        info!("Fetched {}/{} objects", handles.len(), handles.len() + errors.len());
        (handles, errors)
    }
}

fn has_extension(name: &str, allowed: &[&str]) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}
