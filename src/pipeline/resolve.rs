//! Schema resolution: find the generation schema for a template id.
//!
//! ## Lookup order
//!
//! 1. the owner's table, filtered by `id` **and** `user_id`
//! 2. the public table, filtered by `id` only
//!
//! A row only counts as a match when it carries a non-empty `components`
//! field, so an owner row that was saved without a schema falls through to
//! the public copy instead of failing the job.

use crate::clients::RelationalStore;
use crate::config::PipelineConfig;
use crate::error::JobError;
use crate::pipeline::bounded;
use crate::schema::GenerationSchema;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Category recorded when a template has no `name`.
pub const DEFAULT_CATEGORY: &str = "SOP";

/// Which table a template came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSource {
    Owner,
    Public,
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    pub schema: GenerationSchema,
    /// The template's `name`, stored as the job's category.
    pub category: String,
    pub source: TemplateSource,
}

pub struct SchemaResolver {
    records: Arc<dyn RelationalStore>,
    templates_table: String,
    public_templates_table: String,
    timeout: Duration,
}

impl SchemaResolver {
    pub fn new(records: Arc<dyn RelationalStore>, config: &PipelineConfig) -> Self {
        Self {
            records,
            templates_table: config.templates_table.clone(),
            public_templates_table: config.public_templates_table.clone(),
            timeout: config.store_timeout(),
        }
    }

    pub async fn resolve(&self, template_id: &str, owner_id: &str) -> Result<ResolvedTemplate, JobError> {
        let owner_filters = [("id", template_id), ("user_id", owner_id)];
        if let Some(row) = self.lookup(&self.templates_table, &owner_filters).await? {
            if let Some(resolved) = from_row(row, TemplateSource::Owner)? {
                info!("Template {} resolved from owner table", template_id);
                return Ok(resolved);
            }
            debug!("Owner template {} has no components, trying public table", template_id);
        }

        let public_filters = [("id", template_id)];
        if let Some(row) = self.lookup(&self.public_templates_table, &public_filters).await? {
            if let Some(resolved) = from_row(row, TemplateSource::Public)? {
                info!("Template {} resolved from public table", template_id);
                return Ok(resolved);
            }
        }

        Err(JobError::not_found(format!(
            "template '{template_id}' in '{}' or '{}'",
            self.templates_table, self.public_templates_table
        )))
    }

    async fn lookup(&self, table: &str, filters: &[(&str, &str)]) -> Result<Option<Value>, JobError> {
        bounded(
            &format!("template lookup in '{table}'"),
            self.timeout,
            self.records.select(table, filters),
        )
        .await?
        .map_err(|e| JobError::upstream("relational store", e))
    }
}

/// Parse a template row; `Ok(None)` when the row has no usable `components`.
fn from_row(row: Value, source: TemplateSource) -> Result<Option<ResolvedTemplate>, JobError> {
    let components = match row.get("components") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::Object(o)) if o.is_empty() => return Ok(None),
        // Some stores keep JSON columns as text.
        Some(Value::String(s)) => serde_json::from_str::<Value>(s)
            .map_err(|e| JobError::validation(format!("template components are not JSON: {e}")))?,
        Some(other) => other.clone(),
    };
    let schema = GenerationSchema::from_value(components)?;
    let category = row
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_CATEGORY)
        .to_string();
    Ok(Some(ResolvedTemplate {
        schema,
        category,
        source,
    }))
}
