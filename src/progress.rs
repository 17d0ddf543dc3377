//! Progress-callback trait for per-job stage events.
//!
//! Inject an [`Arc<dyn JobProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as a background job moves through its stages.
//!
//! # Why callbacks instead of channels?
//!
//! The durable status record is the contract for callers who only poll.
//! Callbacks are for hosts that want finer detail (a terminal progress bar,
//! a log shipper) without the library knowing how they communicate. The
//! trait is `Send + Sync` because every job runs on its own spawned task and
//! several jobs can report events at the same time.
//!
//! # Example
//!
//! ```rust
//! use edgequake_sopgen::{JobProgressCallback, PipelineConfig, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct StageCounter {
//!     done: AtomicUsize,
//! }
//!
//! impl JobProgressCallback for StageCounter {
//!     fn on_stage_complete(&self, job_id: &str, stage: Stage) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{job_id}: {stage} done ({n})");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(StageCounter { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::job::JobStatus;
use std::fmt;
use std::sync::Arc;

/// Stages of a background run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ResolveSchema,
    FetchResources,
    AssembleArtifact,
    BuildContext,
    Generate,
    Render,
    Persist,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::ResolveSchema,
        Stage::FetchResources,
        Stage::AssembleArtifact,
        Stage::BuildContext,
        Stage::Generate,
        Stage::Render,
        Stage::Persist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ResolveSchema => "resolve-schema",
            Stage::FetchResources => "fetch-resources",
            Stage::AssembleArtifact => "assemble-artifact",
            Stage::BuildContext => "build-context",
            Stage::Generate => "generate",
            Stage::Render => "render",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called by the Lifecycle Manager as a job's background run progresses.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Events for different jobs may arrive concurrently.
pub trait JobProgressCallback: Send + Sync {
    /// Called once when the background run has written `pending`.
    fn on_job_start(&self, job_id: &str) {
        let _ = job_id;
    }

    fn on_stage_start(&self, job_id: &str, stage: Stage) {
        let _ = (job_id, stage);
    }

    fn on_stage_complete(&self, job_id: &str, stage: Stage) {
        let _ = (job_id, stage);
    }

    /// Called for every object that the Resource Fetcher had to exclude.
    ///
    /// # Arguments
    /// * `key`  : remote key of the object
    /// * `error`: human-readable error description
    fn on_download_error(&self, job_id: &str, key: &str, error: &str) {
        let _ = (job_id, key, error);
    }

    /// Called once after the terminal status was written (or attempted).
    ///
    /// `error` is `Some` exactly when `status` is `failed`.
    fn on_job_complete(&self, job_id: &str, status: JobStatus, error: Option<&str>) {
        let _ = (job_id, status, error);
    }
}

/// A no-op implementation, the default when no callback is configured.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn JobProgressCallback>;
