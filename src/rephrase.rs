//! Section rephrasing: rewrite one part of a generated document on request.
//!
//! Works on the Markdown a job produced (the `content` column of its
//! record). The section must occur verbatim in the document; the engine sees
//! the whole document for reference and returns only the rewritten section,
//! which the caller splices back in.

use crate::clients::GenerationEngine;
use crate::config::PipelineConfig;
use crate::error::JobError;
use crate::pipeline::bounded;
use crate::prompts::build_rephrase_prompt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct Rephraser {
    engine: Arc<dyn GenerationEngine>,
    timeout: Duration,
}

impl Rephraser {
    /// Uses the generation timeout of `config`.
    pub fn new(engine: Arc<dyn GenerationEngine>, config: &PipelineConfig) -> Self {
        Self {
            engine,
            timeout: config.generation_timeout(),
        }
    }

    /// Rewrite `section` of `document` as `query` asks.
    ///
    /// Blank inputs and a section that does not occur in the document are
    /// `ValidationFailure`s, checked before the engine is called.
    pub async fn rephrase(&self, query: &str, document: &str, section: &str) -> Result<String, JobError> {
        if query.trim().is_empty() || document.trim().is_empty() || section.trim().is_empty() {
            return Err(JobError::validation("query, document and section to rewrite are required"));
        }
        if !document.contains(section) {
            return Err(JobError::validation("section to rewrite does not occur in the document"));
        }

        let prompt = build_rephrase_prompt(query, document, section);
        debug!("Rephrase prompt assembled ({} chars)", prompt.len());
        let reply = bounded("rephrase", self.timeout, self.engine.complete(&prompt))
            .await?
            .map_err(|e| JobError::upstream("generation engine", e))?;

        let rewritten = reply.trim();
        if rewritten.is_empty() {
            return Err(JobError::validation("engine returned an empty section"));
        }
        let preview: String = section.chars().take(50).collect();
        info!("Rephrased section starting {:?} ({} → {} chars)", preview, section.len(), rewritten.len());
        Ok(rewritten.to_string())
    }
}
