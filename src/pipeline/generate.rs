//! Generation: upload the artifact, run one schema-constrained call, parse.
//!
//! This module is intentionally thin: prompt wording lives in
//! [`crate::prompts`], schema semantics in [`crate::schema`].
//!
//! ## Upload lifetime
//!
//! The uploaded artifact is engine-side state that outlives the process if
//! nobody deletes it. [`EngineUpload`] owns it: the normal path awaits
//! [`EngineUpload::release`]; if the guard is dropped unreleased (an early
//! return, a panic, a cancelled task) `Drop` spawns the delete instead.
//! The guard exists as soon as the engine reports the file, before waiting
//! for it to become usable.
//!
//! ## No retry
//!
//! A generate call over a large document is slow and billed per token.
//! A failure fails the job; resubmission is the caller's decision.

use crate::clients::{GenerationEngine, UploadHandle};
use crate::config::PipelineConfig;
use crate::error::JobError;
use crate::pipeline::assemble::AssembledArtifact;
use crate::pipeline::bounded;
use crate::pipeline::postprocess::strip_json_fences;
use crate::prompts::{build_prompt, DEFAULT_SYSTEM_PROMPT};
use crate::schema::{json_kind, GenerationSchema};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ARTIFACT_MIME_TYPE: &str = "application/pdf";

/// Violations listed in a strict-mode error before truncating.
const MAX_REPORTED_VIOLATIONS: usize = 5;

/// Everything the engine call needs besides the schema.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub job_id: &'a str,
    pub query: &'a str,
    pub artifact: &'a AssembledArtifact,
    /// Event-log text.
    pub event_data: &'a str,
    /// Knowledge-base text from the Context Builder.
    pub context: &'a str,
    /// Decoded supplementary file, empty when none.
    pub supplementary: &'a str,
}

/// The parsed top-level object returned by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    fields: Map<String, Value>,
    raw: String,
}

impl GenerationResult {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Non-blank string field, trimmed.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// The reply text as the engine sent it.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Engine-side upload that is deleted exactly once.
pub struct EngineUpload {
    engine: Arc<dyn GenerationEngine>,
    handle: UploadHandle,
    timeout: Duration,
    released: bool,
}

impl EngineUpload {
    pub fn handle(&self) -> &UploadHandle {
        &self.handle
    }

    /// Delete the upload now. Failure is logged, not returned: the job's
    /// outcome does not depend on it.
    pub async fn release(mut self) {
        self.released = true;
        match tokio::time::timeout(self.timeout, self.engine.delete(&self.handle)).await {
            Ok(Ok(())) => debug!("Deleted engine upload {}", self.handle.name),
            Ok(Err(e)) => warn!("Failed to delete engine upload {}: {}", self.handle.name, e),
            Err(_) => warn!(
                "Deleting engine upload {} timed out after {}s",
                self.handle.name,
                self.timeout.as_secs()
            ),
        }
    }
}

impl Drop for EngineUpload {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                debug!("Engine upload {} dropped unreleased, deleting in background", handle.name);
                rt.spawn(async move {
                    if let Err(e) = engine.delete(&handle).await {
                        warn!("Background delete of engine upload {} failed: {}", handle.name, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to delete engine upload {}; it will leak", handle.name),
        }
    }
}

pub struct GenerationInvoker {
    engine: Arc<dyn GenerationEngine>,
    instructions: String,
    upload_timeout: Duration,
    generation_timeout: Duration,
    strict_schema: bool,
}

impl GenerationInvoker {
    pub fn new(engine: Arc<dyn GenerationEngine>, config: &PipelineConfig) -> Self {
        Self {
            engine,
            instructions: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            upload_timeout: config.upload_timeout(),
            generation_timeout: config.generation_timeout(),
            strict_schema: config.strict_schema,
        }
    }

    /// Upload the artifact and run one generation under `schema`.
    pub async fn generate(
        &self,
        request: GenerationRequest<'_>,
        schema: &GenerationSchema,
    ) -> Result<GenerationResult, JobError> {
        let upload = self.upload(request.artifact, request.job_id).await?;
        if let Err(e) = self.activate(&upload).await {
            upload.release().await;
            return Err(e);
        }

        let prompt = build_prompt(
            &self.instructions,
            request.query,
            request.event_data,
            request.context,
            request.supplementary,
            &schema.to_pretty_json(),
        );
        debug!("Prompt assembled ({} chars)", prompt.len());

        let reply = bounded(
            "generation",
            self.generation_timeout,
            self.engine.generate(&prompt, schema.raw(), upload.handle()),
        )
        .await;
        upload.release().await;

        let text = reply?.map_err(|e| JobError::upstream("generation engine", e))?;
        info!("Engine replied ({} chars)", text.len());
        parse_response(&text, schema, self.strict_schema)
    }

    async fn upload(&self, artifact: &AssembledArtifact, job_id: &str) -> Result<EngineUpload, JobError> {
        let display_name = format!("SOP_PDF_{job_id}");
        let handle = bounded(
            "artifact upload",
            self.upload_timeout,
            self.engine
                .upload(artifact.document.clone(), ARTIFACT_MIME_TYPE, &display_name),
        )
        .await?
        .map_err(|e| JobError::upstream("generation engine upload", e))?;
        info!("Uploaded {} pages as {}", artifact.page_count, handle.name);
        Ok(EngineUpload {
            engine: Arc::clone(&self.engine),
            handle,
            timeout: self.upload_timeout,
            released: false,
        })
    }

    /// Wait for the upload to become usable, under the same bound as the transfer.
    async fn activate(&self, upload: &EngineUpload) -> Result<(), JobError> {
        bounded(
            "artifact activation",
            self.upload_timeout,
            self.engine.wait_until_active(upload.handle()),
        )
        .await?
        .map_err(|e| JobError::upstream("generation engine upload", e))
    }
}

/// Parse and check an engine reply.
///
/// The reply must be a JSON object. Missing fields are fine; present values
/// of the wrong type are logged, and fatal only when `strict` is set.
pub fn parse_response(text: &str, schema: &GenerationSchema, strict: bool) -> Result<GenerationResult, JobError> {
    let body = strip_json_fences(text);
    if body.is_empty() {
        return Err(JobError::validation("engine reply is empty"));
    }
    let value: Value = serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(120).collect();
        JobError::validation(format!("engine reply is not valid JSON ({e}): {preview}"))
    })?;
    let fields = match value {
        Value::Object(map) => map,
        other => {
            return Err(JobError::validation(format!(
                "engine reply must be a JSON object, got {}",
                json_kind(&other)
            )))
        }
    };

    let violations = schema.check(&Value::Object(fields.clone()));
    if !violations.is_empty() {
        for v in &violations {
            warn!("Schema mismatch in engine reply: {}", v);
        }
        if strict {
            let listed: Vec<String> = violations
                .iter()
                .take(MAX_REPORTED_VIOLATIONS)
                .map(ToString::to_string)
                .collect();
            return Err(JobError::validation(format!(
                "{} schema violation(s): {}",
                violations.len(),
                listed.join("; ")
            )));
        }
    }

    Ok(GenerationResult {
        fields,
        raw: text.to_string(),
    })
}
