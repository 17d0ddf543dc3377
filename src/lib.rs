//! # edgequake-sopgen
//!
//! Turn a recorded UI session (screenshots plus an event log) into a
//! step-by-step procedure document, generated by a schema-constrained model
//! and persisted behind a durable job status.
//!
//! ## Why a job pipeline?
//!
//! Generation over a few dozen screenshots takes minutes. The submitting
//! request cannot wait that long, so [`JobManager::submit`] records the job
//! as `queued` and returns at once; a background task does the work and
//! leaves exactly one terminal status (`success` or `failed`) behind, which
//! callers read with [`JobManager::status`].
//!
//! ## Pipeline Overview
//!
//! ```text
//! JobRequest
//!  │
//!  ├─ 1. Resolve   owner template, else public template → output schema
//!  ├─ 2. Fetch     list + download screenshots and event log (bounded concurrency)
//!  ├─ 3. Assemble  one captioned PDF page per screenshot (spawn_blocking)
//!  ├─ 4. Context   top-k similar knowledge-base items (never fails)
//!  ├─ 5. Generate  upload PDF, one schema-constrained call, delete upload
//!  ├─ 6. Render    JSON → Markdown with absolute screenshot URLs
//!  └─ 7. Persist   success record (or failed, whatever went wrong)
//! ```
//!
//! A finished document can be revised section by section with
//! [`Rephraser`], one text-only engine call per edit.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_sopgen::clients::memory::{MemoryBackend, MemorySimilarityService};
//! use edgequake_sopgen::{JobManager, JobRequest, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new(r#"{"docTitle":"Demo"}"#, MemorySimilarityService::new(vec![]));
//!     let manager = JobManager::new(backend.clients(), PipelineConfig::default())?;
//!     let ack = manager
//!         .submit(JobRequest::new("job-1", "owner-1", "How do I add a product?", "tpl-1", "jira"))
//!         .await?;
//!     let status = manager.wait(&ack.job_id).await?;
//!     println!("{}: {}", ack.job_id, status);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `sopgen` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod clients;
pub mod config;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod rephrase;
pub mod schema;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use clients::{
    Clients, Embedder, GenerationEngine, ObjectEntry, ObjectStore, RelationalStore, SimilarityMatch,
    SimilarityService, UploadHandle,
};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{ClientError, FetchError, JobError};
pub use job::{Acknowledgement, JobRecord, JobRequest, JobStatus, StatusReport, SupplementaryFile};
pub use lifecycle::JobManager;
pub use pipeline::generate::GenerationResult;
pub use pipeline::render::{RenderedDocument, Renderer};
pub use progress::{JobProgressCallback, NoopProgressCallback, ProgressCallback, Stage};
pub use rephrase::Rephraser;
pub use schema::GenerationSchema;
pub use stream::{status_stream, StatusStream};
