//! Job lifecycle: submission, the background run, and status reads.
//!
//! ## Status protocol
//!
//! ```text
//! submit ──▶ queued ──(task starts)──▶ pending ──▶ success
//!                                          └─────▶ failed
//! ```
//!
//! `queued` is written by [`JobManager::submit`] before anything else
//! happens, so a caller that gets an [`Acknowledgement`] can poll
//! [`JobManager::status`] immediately. Everything after that runs in a
//! spawned task that writes `pending`, then exactly one terminal status.
//! A failed success write is followed by a `failed` write, so the record
//! never stays `pending` when the store recovers in time.
//!
//! ## Cleanup
//!
//! All local files live in a per-job [`TempDir`]; the engine upload is
//! owned by a guard in [`crate::pipeline::generate`]. Both are released on
//! the normal path and dropped on every other one, panics included.

use crate::clients::Clients;
use crate::config::PipelineConfig;
use crate::error::JobError;
use crate::job::{Acknowledgement, Job, JobRecord, JobRequest, JobStatus, StatusReport};
use crate::pipeline::assemble;
use crate::pipeline::bounded;
use crate::pipeline::context::ContextBuilder;
use crate::pipeline::fetch::{ResourceFetcher, ResourceHandle};
use crate::pipeline::generate::{GenerationInvoker, GenerationRequest, GenerationResult};
use crate::pipeline::render::{RenderedDocument, Renderer};
use crate::pipeline::resolve::{ResolvedTemplate, SchemaResolver};
use crate::progress::Stage;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Conflict column of the job table.
const JOB_KEY: &str = "id";

/// Finished runs remembered for [`JobManager::wait`].
const FINISHED_RETAINED: usize = 256;

/// Runs jobs against one set of collaborators. Cheap to clone.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

struct Inner {
    clients: Clients,
    config: PipelineConfig,
    renderer: Renderer,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    /// Ids with a run between `queued` and its terminal write.
    active: HashSet<String>,
    /// Handles of running jobs. A run removes its own entry when it ends.
    handles: HashMap<String, JoinHandle<JobStatus>>,
    /// Most recent terminal statuses, oldest first.
    finished: VecDeque<(String, JobStatus)>,
}

impl Registry {
    fn finish(&mut self, job_id: &str, status: JobStatus) {
        self.active.remove(job_id);
        self.handles.remove(job_id);
        self.finished.retain(|(id, _)| id != job_id);
        if self.finished.len() == FINISHED_RETAINED {
            self.finished.pop_front();
        }
        self.finished.push_back((job_id.to_string(), status));
    }

    fn finished_status(&self, job_id: &str) -> Option<JobStatus> {
        self.finished
            .iter()
            .find(|(id, _)| id == job_id)
            .map(|(_, status)| *status)
    }
}

/// What a successful run hands to the persistence step.
struct Produced {
    document: RenderedDocument,
    category: String,
}

impl JobManager {
    pub fn new(clients: Clients, config: PipelineConfig) -> Result<Self, JobError> {
        let renderer = Renderer::new(&config.image_base_url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                clients,
                config,
                renderer,
                registry: Mutex::new(Registry::default()),
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Record the job as `queued` and start its background run.
    ///
    /// Returns once the `queued` row is written. A second submission of an
    /// id whose run has not finished yet is refused with `Conflict`.
    pub async fn submit(&self, request: JobRequest) -> Result<Acknowledgement, JobError> {
        request.validate()?;
        let job_id = request.job_id.clone();
        if !self.inner.registry().active.insert(job_id.clone()) {
            return Err(JobError::Conflict { job_id });
        }

        let job = Job::new(&request);
        if let Err(e) = self.inner.write_record(&job.initial_record()).await {
            self.inner.registry().active.remove(&job_id);
            return Err(e);
        }
        info!("Job {} queued for owner {}", job_id, request.owner_id);

        let inner = Arc::clone(&self.inner);
        // Spawned under the lock so the run cannot finish before its handle is stored.
        let mut registry = self.inner.registry();
        let handle = tokio::spawn(async move { inner.run(request, job).await });
        registry.handles.insert(job_id.clone(), handle);
        drop(registry);

        Ok(Acknowledgement {
            status: JobStatus::Queued,
            job_id,
        })
    }

    /// Read the stored status. Never touches a running job.
    pub async fn status(&self, job_id: &str) -> Result<StatusReport, JobError> {
        let cfg = &self.inner.config;
        let row = bounded(
            "status read",
            cfg.store_timeout(),
            self.inner.clients.records.select(&cfg.docs_table, &[(JOB_KEY, job_id)]),
        )
        .await?
        .map_err(|e| JobError::upstream("relational store", e))?
        .ok_or_else(|| JobError::not_found(format!("job '{job_id}'")))?;

        let status = row
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JobError::validation(format!("job '{job_id}' has no status column")))?
            .parse::<JobStatus>()?;
        Ok(StatusReport {
            job_id: job_id.to_string(),
            status,
        })
    }

    /// Wait for the background run of `job_id` and return its terminal status.
    ///
    /// A running job can be awaited by one caller. Runs that already ended
    /// answer from a bounded list of recent outcomes; `NotFound` when the id
    /// is in neither.
    pub async fn wait(&self, job_id: &str) -> Result<JobStatus, JobError> {
        let handle = {
            let mut registry = self.inner.registry();
            match registry.handles.remove(job_id) {
                Some(handle) => handle,
                None => {
                    return registry
                        .finished_status(job_id)
                        .ok_or_else(|| JobError::not_found(format!("job run '{job_id}'")))
                }
            }
        };
        handle
            .await
            .map_err(|e| JobError::Internal(format!("job task for '{job_id}' did not finish: {e}")))
    }

    /// Ids whose run has not reached its terminal write yet.
    pub fn active_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.registry().active.iter().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.inner.config)
            .field("active", &self.active_jobs())
            .finish()
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Background run. Always returns the status it tried to leave behind.
    async fn run(self: Arc<Self>, request: JobRequest, mut job: Job) -> JobStatus {
        let job_id = request.job_id.clone();
        let status = self.drive(&request, &mut job).await;
        self.registry().finish(&job_id, status);
        status
    }

    async fn drive(&self, request: &JobRequest, job: &mut Job) -> JobStatus {
        let job_id = request.job_id.as_str();
        if let Err(e) = self.transition(job, JobStatus::Pending).await {
            return self.fail(job, e).await;
        }
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_job_start(job_id);
        }

        let outcome = AssertUnwindSafe(self.produce(request)).catch_unwind().await;
        let produced = match outcome {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => return self.fail(job, e).await,
            Err(panic) => {
                let e = JobError::Internal(format!("pipeline panicked: {}", panic_message(&*panic)));
                return self.fail(job, e).await;
            }
        };

        self.stage_start(job_id, Stage::Persist);
        job.set_payload(
            produced.document.title,
            produced.document.content,
            produced.document.description,
            produced.category,
        );
        if let Err(e) = self.transition(job, JobStatus::Success).await {
            warn!("Job {}: success record not written, recording failure", job_id);
            return self.fail(job, e).await;
        }
        self.stage_complete(job_id, Stage::Persist);

        info!("Job {} succeeded", job_id);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_job_complete(job_id, JobStatus::Success, None);
        }
        JobStatus::Success
    }

    /// Log `cause` and write the terminal `failed` status.
    async fn fail(&self, job: &mut Job, cause: JobError) -> JobStatus {
        error!("Job {} failed ({}): {}", job.job_id, cause.kind(), cause);
        if let Err(e) = self.transition(job, JobStatus::Failed).await {
            error!("Job {}: could not record failure: {}", job.job_id, e);
        }
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_job_complete(&job.job_id, JobStatus::Failed, Some(&cause.to_string()));
        }
        JobStatus::Failed
    }

    /// Write the row for `next`, then commit it on the in-memory job.
    async fn transition(&self, job: &mut Job, next: JobStatus) -> Result<(), JobError> {
        self.write_record(&job.record_for(next)?).await?;
        job.commit(next)?;
        debug!("Job {} is now {}", job.job_id, next);
        Ok(())
    }

    async fn write_record(&self, record: &JobRecord) -> Result<(), JobError> {
        bounded(
            "job record write",
            self.config.store_timeout(),
            self.clients.records.upsert(&self.config.docs_table, record.to_value()?, JOB_KEY),
        )
        .await?
        .map_err(|e| JobError::upstream("relational store", format!("writing job '{}': {e}", record.id)))
    }

    // ── Stages ───────────────────────────────────────────────────────────

    async fn produce(&self, request: &JobRequest) -> Result<Produced, JobError> {
        let job_id = request.job_id.as_str();

        self.stage_start(job_id, Stage::ResolveSchema);
        let template = SchemaResolver::new(Arc::clone(&self.clients.records), &self.config)
            .resolve(&request.template_id, &request.owner_id)
            .await?;
        self.stage_complete(job_id, Stage::ResolveSchema);

        let scratch = self.scratch_dir(job_id)?;
        let (images, data) = self.fetch(request, scratch.path()).await?;

        let outcome = self.generate_from(request, &template, &images, &data).await;

        for handle in images.into_iter().chain(std::iter::once(data)) {
            if let Err(e) = handle.release() {
                warn!("Job {}: {}", job_id, e);
            }
        }
        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!("Job {}: could not remove {}: {}", job_id, scratch_path.display(), e);
        }

        let result = outcome?;

        self.stage_start(job_id, Stage::Render);
        let document = self.renderer.render(&result, &request.owner_id, job_id);
        self.stage_complete(job_id, Stage::Render);

        if let Some(ref dir) = self.config.debug_dir {
            write_debug_output(dir, job_id, &result, &document).await;
        }

        Ok(Produced {
            document,
            category: template.category,
        })
    }

    async fn fetch(&self, request: &JobRequest, scratch: &Path) -> Result<(Vec<ResourceHandle>, ResourceHandle), JobError> {
        let job_id = request.job_id.as_str();
        self.stage_start(job_id, Stage::FetchResources);
        let fetcher = ResourceFetcher::new(
            Arc::clone(&self.clients.objects),
            scratch,
            self.config.download_concurrency,
            self.config.download_timeout(),
        );
        let inputs = fetcher.list_inputs(&request.owner_id, job_id).await?;

        let (images, errors) = fetcher.fetch_all_with_errors(&inputs.screenshots).await;
        if let Some(ref cb) = self.config.progress_callback {
            for e in &errors {
                cb.on_download_error(job_id, e.key(), &e.to_string());
            }
        }
        if images.is_empty() {
            return Err(JobError::EmptyInput {
                detail: format!("all {} screenshot downloads failed", inputs.screenshots.len()),
            });
        }

        let data = fetcher
            .fetch_one(&inputs.data_file)
            .await
            .map_err(|e| JobError::upstream("object store", e))?;
        self.stage_complete(job_id, Stage::FetchResources);
        Ok((images, data))
    }

    async fn generate_from(
        &self,
        request: &JobRequest,
        template: &ResolvedTemplate,
        images: &[ResourceHandle],
        data: &ResourceHandle,
    ) -> Result<GenerationResult, JobError> {
        let job_id = request.job_id.as_str();

        self.stage_start(job_id, Stage::AssembleArtifact);
        let artifact = assemble::build(images, data).await?;
        let event_data = artifact
            .data
            .text()
            .ok_or_else(|| JobError::validation(format!("event log '{}' is unreadable or empty", data.display_name())))?
            .to_string();
        self.stage_complete(job_id, Stage::AssembleArtifact);

        self.stage_start(job_id, Stage::BuildContext);
        let context = ContextBuilder::new(
            Arc::clone(&self.clients.similarity),
            self.config.top_k,
            self.config.embedding_timeout(),
        )
        .augment(&request.owner_id, &request.query, &request.integration_type)
        .await;
        self.stage_complete(job_id, Stage::BuildContext);

        self.stage_start(job_id, Stage::Generate);
        let supplementary = request.file.as_ref().and_then(|f| f.text()).unwrap_or_default();
        let result = GenerationInvoker::new(Arc::clone(&self.clients.engine), &self.config)
            .generate(
                GenerationRequest {
                    job_id,
                    query: &request.query,
                    artifact: &artifact,
                    event_data: &event_data,
                    context: &context,
                    supplementary: &supplementary,
                },
                &template.schema,
            )
            .await?;
        self.stage_complete(job_id, Stage::Generate);
        Ok(result)
    }

    fn scratch_dir(&self, job_id: &str) -> Result<TempDir, JobError> {
        let prefix = format!("sopgen-{job_id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match self.config.temp_dir {
            Some(ref parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        };
        dir.map_err(|e| JobError::Internal(format!("could not create scratch directory: {e}")))
    }

    fn stage_start(&self, job_id: &str, stage: Stage) {
        info!("Job {}: {}", job_id, stage);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_start(job_id, stage);
        }
    }

    fn stage_complete(&self, job_id: &str, stage: Stage) {
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_complete(job_id, stage);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Best effort: failures only warn.
async fn write_debug_output(dir: &Path, job_id: &str, result: &GenerationResult, document: &RenderedDocument) {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!("Debug output disabled for job {}: {}", job_id, e);
        return;
    }
    let model_json = serde_json::to_string_pretty(result.fields()).unwrap_or_else(|_| result.raw().to_string());
    let files = [
        (format!("job_{job_id}_{stamp}_model_output.json"), model_json),
        (format!("job_{job_id}_{stamp}_output.md"), document.content.clone()),
    ];
    for (name, body) in files {
        let path = dir.join(name);
        match tokio::fs::write(&path, body).await {
            Ok(()) => debug!("Wrote {}", path.display()),
            Err(e) => warn!("Could not write {}: {}", path.display(), e),
        }
    }
}
