//! Configuration for the job pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. One struct shared by every job keeps the
//! bounds (concurrency, timeouts) and the storage layout in one place.
//!
//! # Design choice: builder over constructor
//! Most callers only change a timeout or two. The builder lets them set only
//! what they care about and rely on the documented defaults for the rest.

use crate::error::JobError;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Public image URL prefix of the local Supabase stack.
pub const DEFAULT_IMAGE_BASE_URL: &str =
    "http://localhost:54321/storage/v1/object/public/log_dataa";

/// Configuration shared by every job a [`crate::JobManager`] runs.
///
/// # Example
/// ```rust
/// use edgequake_sopgen::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .download_concurrency(4)
///     .generation_timeout_secs(120)
///     .build()
///     .unwrap();
/// assert_eq!(config.top_k, 5);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Maximum screenshot downloads in flight per job. Default: 10.
    ///
    /// Downloads are network-bound. The bound caps sockets and scratch
    /// files a single job holds at once, not throughput.
    pub download_concurrency: usize,

    /// Similar items requested from the similarity service. Default: 5.
    pub top_k: usize,

    /// Bound on a single relational-store read or write, in seconds. Default: 15.
    pub store_timeout_secs: u64,

    /// Bound on a single object download (and listing), in seconds. Default: 60.
    pub download_timeout_secs: u64,

    /// Bound on the artifact upload to the engine, in seconds. Default: 120.
    pub upload_timeout_secs: u64,

    /// Bound on the generate call, in seconds. Default: 300.
    ///
    /// Schema-constrained generation over a multi-page document regularly
    /// takes more than a minute.
    pub generation_timeout_secs: u64,

    /// Bound on embedding plus similarity search, in seconds. Default: 30.
    pub embedding_timeout_secs: u64,

    /// Prefix of public screenshot URLs embedded in the Markdown.
    ///
    /// Rendered as `<base>/<owner>/<job>/screenshots/<file>`.
    pub image_base_url: String,

    /// Table holding job records. Default: `generated_docs`.
    pub docs_table: String,

    /// Owner-scoped templates. Default: `templates`.
    pub templates_table: String,

    /// Shared templates, consulted after the owner's. Default: `publictemplates`.
    pub public_templates_table: String,

    /// Parent directory for per-job scratch directories. Default: system temp dir.
    pub temp_dir: Option<PathBuf>,

    /// When set, the raw model JSON and rendered Markdown of every job are
    /// written here. Best effort: write failures only log a warning.
    pub debug_dir: Option<PathBuf>,

    /// Fail the job when a present value contradicts the schema. Default: false.
    ///
    /// The engine already constrains its output to the schema; by default a
    /// mismatch is logged and the section it affects is skipped by the
    /// renderer.
    pub strict_schema: bool,

    /// Custom system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Stage events. If None, events are dropped.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 10,
            top_k: 5,
            store_timeout_secs: 15,
            download_timeout_secs: 60,
            upload_timeout_secs: 120,
            generation_timeout_secs: 300,
            embedding_timeout_secs: 30,
            image_base_url: DEFAULT_IMAGE_BASE_URL.to_string(),
            docs_table: "generated_docs".to_string(),
            templates_table: "templates".to_string(),
            public_templates_table: "publictemplates".to_string(),
            temp_dir: None,
            debug_dir: None,
            strict_schema: false,
            system_prompt: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("download_concurrency", &self.download_concurrency)
            .field("top_k", &self.top_k)
            .field("store_timeout_secs", &self.store_timeout_secs)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("upload_timeout_secs", &self.upload_timeout_secs)
            .field("generation_timeout_secs", &self.generation_timeout_secs)
            .field("embedding_timeout_secs", &self.embedding_timeout_secs)
            .field("image_base_url", &self.image_base_url)
            .field("docs_table", &self.docs_table)
            .field("templates_table", &self.templates_table)
            .field("public_templates_table", &self.public_templates_table)
            .field("temp_dir", &self.temp_dir)
            .field("debug_dir", &self.debug_dir)
            .field("strict_schema", &self.strict_schema)
            .field("system_prompt", &self.system_prompt.as_ref().map(|p| p.len()))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn JobProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn download_concurrency(mut self, n: usize) -> Self {
        self.config.download_concurrency = n;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.config.top_k = k;
        self
    }

    pub fn store_timeout_secs(mut self, secs: u64) -> Self {
        self.config.store_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn upload_timeout_secs(mut self, secs: u64) -> Self {
        self.config.upload_timeout_secs = secs;
        self
    }

    pub fn generation_timeout_secs(mut self, secs: u64) -> Self {
        self.config.generation_timeout_secs = secs;
        self
    }

    pub fn embedding_timeout_secs(mut self, secs: u64) -> Self {
        self.config.embedding_timeout_secs = secs;
        self
    }

    pub fn image_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.image_base_url = url.into();
        self
    }

    pub fn docs_table(mut self, table: impl Into<String>) -> Self {
        self.config.docs_table = table.into();
        self
    }

    pub fn templates_table(mut self, table: impl Into<String>) -> Self {
        self.config.templates_table = table.into();
        self
    }

    pub fn public_templates_table(mut self, table: impl Into<String>) -> Self {
        self.config.public_templates_table = table.into();
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = Some(dir.into());
        self
    }

    pub fn debug_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.debug_dir = Some(dir.into());
        self
    }

    pub fn strict_schema(mut self, v: bool) -> Self {
        self.config.strict_schema = v;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, JobError> {
        let c = &self.config;
        if c.download_concurrency == 0 {
            return Err(JobError::InvalidConfig(
                "download_concurrency must be ≥ 1".into(),
            ));
        }
        if c.top_k == 0 {
            return Err(JobError::InvalidConfig("top_k must be ≥ 1".into()));
        }
        for (name, secs) in [
            ("store_timeout_secs", c.store_timeout_secs),
            ("download_timeout_secs", c.download_timeout_secs),
            ("upload_timeout_secs", c.upload_timeout_secs),
            ("generation_timeout_secs", c.generation_timeout_secs),
            ("embedding_timeout_secs", c.embedding_timeout_secs),
        ] {
            if secs == 0 {
                return Err(JobError::InvalidConfig(format!("{name} must be ≥ 1")));
            }
        }
        if reqwest::Url::parse(&c.image_base_url).is_err() {
            return Err(JobError::InvalidConfig(format!(
                "image_base_url is not a valid URL: '{}'",
                c.image_base_url
            )));
        }
        for (name, table) in [
            ("docs_table", &c.docs_table),
            ("templates_table", &c.templates_table),
            ("public_templates_table", &c.public_templates_table),
        ] {
            if table.trim().is_empty() {
                return Err(JobError::InvalidConfig(format!("{name} must not be empty")));
            }
        }
        Ok(self.config)
    }
}
