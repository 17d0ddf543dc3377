//! Collaborator abstractions.
//!
//! The pipeline talks to four external capabilities, each behind an
//! object-safe async trait so a [`crate::JobManager`] can be wired with real
//! adapters ([`supabase`], [`gemini`]) or the in-memory doubles in
//! [`memory`].
//!
//! | Trait | Used by | Real adapter |
//! |-------|---------|--------------|
//! | [`ObjectStore`] | Resource Fetcher | Supabase Storage |
//! | [`RelationalStore`] | Schema Resolver, Lifecycle Manager | PostgREST |
//! | [`GenerationEngine`] | Generation Invoker | Gemini |
//! | [`SimilarityService`] | Context Builder | PostgREST RPC + Gemini embeddings |

use crate::error::ClientError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub mod gemini;
pub mod memory;
pub mod supabase;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// File name relative to the listed directory.
    pub name: String,
}

/// Remote blob storage addressed by `/`-separated keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List the direct children of `dir`.
    async fn list(&self, dir: &str) -> Result<Vec<ObjectEntry>, ClientError>;

    /// Download the full contents of `path`.
    async fn download(&self, path: &str) -> Result<Vec<u8>, ClientError>;
}

/// Table store with upsert and single-row lookup.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Insert `record`, or merge it into the row with the same `conflict_key` value.
    async fn upsert(&self, table: &str, record: Value, conflict_key: &str) -> Result<(), ClientError>;

    /// First row of `table` whose columns equal every `(column, value)` filter.
    async fn select(&self, table: &str, filters: &[(&str, &str)]) -> Result<Option<Value>, ClientError>;
}

/// Reference to an artifact uploaded to the generation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadHandle {
    /// Engine-side resource name, used for deletion.
    pub name: String,
    /// URI passed to `generate`.
    pub uri: String,
    pub mime_type: String,
}

/// Schema-constrained generation over an uploaded artifact.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Transfer `bytes` and return as soon as the engine-side file exists.
    ///
    /// The returned handle must be deleted even if it never becomes usable.
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str, display_name: &str) -> Result<UploadHandle, ClientError>;

    /// Block until `upload` can be referenced by [`generate`](Self::generate).
    async fn wait_until_active(&self, _upload: &UploadHandle) -> Result<(), ClientError> {
        Ok(())
    }

    /// One deterministic generation returning the raw response text.
    async fn generate(&self, prompt: &str, schema: &Value, upload: &UploadHandle) -> Result<String, ClientError>;

    /// One deterministic text-only generation, no artifact, no schema.
    async fn complete(&self, prompt: &str) -> Result<String, ClientError>;

    async fn delete(&self, upload: &UploadHandle) -> Result<(), ClientError>;
}

/// One item returned by a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub id: String,
    pub text: String,
    pub score: f32,
}

/// Text → vector. Split out so a search backend can borrow another
/// provider's embedding model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ClientError>;
}

/// Embedding plus nearest-neighbour search over an owner's indexed items.
#[async_trait]
pub trait SimilarityService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ClientError>;

    async fn search(
        &self,
        vector: &[f32],
        owner_id: &str,
        integration_type: &str,
        top_k: usize,
    ) -> Result<Vec<SimilarityMatch>, ClientError>;
}

/// The collaborator set a job runs against. Cheap to clone.
#[derive(Clone)]
pub struct Clients {
    pub objects: Arc<dyn ObjectStore>,
    pub records: Arc<dyn RelationalStore>,
    pub engine: Arc<dyn GenerationEngine>,
    pub similarity: Arc<dyn SimilarityService>,
}

impl Clients {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn RelationalStore>,
        engine: Arc<dyn GenerationEngine>,
        similarity: Arc<dyn SimilarityService>,
    ) -> Self {
        Self {
            objects,
            records,
            engine,
            similarity,
        }
    }
}

impl std::fmt::Debug for Clients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clients").finish_non_exhaustive()
    }
}
