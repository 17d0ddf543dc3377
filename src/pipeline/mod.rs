//! Pipeline stages for one document-generation job.
//!
//! Each submodule implements exactly one step. Keeping stages separate makes
//! each independently testable against the in-memory collaborators and lets
//! the Lifecycle Manager own sequencing, cleanup and status writes.
//!
//! ## Data Flow
//!
//! ```text
//! resolve ──▶ fetch ──▶ assemble ──▶ context ──▶ generate ──▶ render
//! (template)  (storage)  (lopdf PDF)  (similarity) (engine)    (Markdown)
//! ```
//!
//! 1. [`resolve`] : owner template, then public template; yields the schema
//! 2. [`fetch`]   : list and download screenshots + event log; the only
//!    stage with intra-job parallelism
//! 3. [`assemble`]: one captioned PDF page per screenshot; runs in
//!    `spawn_blocking` because image decoding is CPU-bound
//! 4. [`context`] : top-k similar items as prompt context; never fails
//! 5. [`generate`]: upload, one schema-constrained call, guaranteed delete
//! 6. [`render`]  : pure JSON → Markdown walk, finished by [`postprocess`]

pub mod assemble;
pub mod context;
pub mod fetch;
pub mod generate;
pub mod postprocess;
pub mod render;
pub mod resolve;

use crate::error::JobError;
use std::future::Future;
use std::time::Duration;

/// Await `fut` for at most `limit`; expiry becomes [`JobError::Timeout`].
pub(crate) async fn bounded<T>(
    operation: &str,
    limit: Duration,
    fut: impl Future<Output = T>,
) -> Result<T, JobError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| JobError::Timeout {
            operation: operation.to_string(),
            secs: limit.as_secs(),
        })
}

/// Last `/`-separated segment of a storage key.
pub(crate) fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_maps_expiry_to_timeout() {
        let err = bounded("slow call", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await
        .unwrap_err();
        assert!(matches!(err, JobError::Timeout { ref operation, .. } if operation == "slow call"));
    }

    #[tokio::test]
    async fn bounded_passes_value_through() {
        assert_eq!(bounded("fast", Duration::from_secs(1), async { 7 }).await.unwrap(), 7);
    }

    #[test]
    fn file_name_takes_last_segment() {
        assert_eq!(file_name("u1/j1/screenshots/a.png"), "a.png");
        assert_eq!(file_name("a.png"), "a.png");
    }
}
