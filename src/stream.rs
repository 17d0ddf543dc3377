//! Status streaming: follow a job's stored status until it is terminal.
//!
//! [`JobManager::status`] is a single read. Callers that want to wait on a
//! job they did not submit themselves (another process, a CLI started after
//! the fact) only have the status record, so this module polls it and yields
//! every change.

use crate::error::JobError;
use crate::job::{JobStatus, StatusReport};
use crate::lifecycle::JobManager;
use futures::stream;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;
use tracing::debug;

/// A boxed stream of observed status changes.
pub type StatusStream = Pin<Box<dyn Stream<Item = Result<StatusReport, JobError>> + Send>>;

struct PollState {
    manager: JobManager,
    job_id: String,
    interval: Duration,
    last: Option<JobStatus>,
    polled: bool,
    finished: bool,
}

/// Poll the status of `job_id` every `interval`.
///
/// The first read happens immediately. Consecutive identical statuses are
/// yielded once. The stream ends after a terminal status or after the first
/// error, which is yielded.
pub fn status_stream(manager: JobManager, job_id: impl Into<String>, interval: Duration) -> StatusStream {
    let state = PollState {
        manager,
        job_id: job_id.into(),
        interval,
        last: None,
        polled: false,
        finished: false,
    };
    Box::pin(stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            if st.polled {
                tokio::time::sleep(st.interval).await;
            }
            st.polled = true;
            match st.manager.status(&st.job_id).await {
                Ok(report) if st.last == Some(report.status) => continue,
                Ok(report) => {
                    debug!("Job {} observed as {}", st.job_id, report.status);
                    st.last = Some(report.status);
                    st.finished = report.status.is_terminal();
                    return Some((Ok(report), st));
                }
                Err(e) => {
                    st.finished = true;
                    return Some((Err(e), st));
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::{MemoryBackend, MemorySimilarityService};
    use crate::clients::RelationalStore;
    use crate::config::PipelineConfig;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn yields_changes_until_terminal() {
        let backend = MemoryBackend::new("{}", MemorySimilarityService::new(vec![]));
        backend
            .records
            .insert("generated_docs", json!({ "id": "j1", "user_id": "u1", "status": "pending" }));
        let manager = JobManager::new(backend.clients(), PipelineConfig::default()).unwrap();
        let records = Arc::clone(&backend.records);
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            records
                .upsert("generated_docs", json!({ "id": "j1", "status": "success" }), "id")
                .await
                .unwrap();
        });

        let seen: Vec<JobStatus> = status_stream(manager, "j1", Duration::from_millis(5))
            .map(|r| r.unwrap().status)
            .collect()
            .await;
        writer.await.unwrap();
        assert_eq!(seen, vec![JobStatus::Pending, JobStatus::Success]);
    }

    #[tokio::test]
    async fn unknown_job_ends_with_not_found() {
        let backend = MemoryBackend::new("{}", MemorySimilarityService::new(vec![]));
        let manager = JobManager::new(backend.clients(), PipelineConfig::default()).unwrap();
        let items: Vec<_> = status_stream(manager, "nope", Duration::from_millis(5)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(JobError::NotFound { .. })));
    }
}
