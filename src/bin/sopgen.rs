//! CLI binary for edgequake-sopgen.
//!
//! A thin shim over the library crate: maps flags to `PipelineConfig`, wires
//! the Supabase and Gemini adapters from the environment (or the in-memory
//! doubles for `--dry-run`), and prints progress and results.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_sopgen::clients::gemini::GeminiClient;
use edgequake_sopgen::clients::memory::{MemoryBackend, MemorySimilarityService};
use edgequake_sopgen::clients::supabase::{SupabaseClient, VectorSearch};
use edgequake_sopgen::{
    status_stream, Clients, JobManager, JobProgressCallback, JobRequest, JobStatus, PipelineConfig,
    ProgressCallback, RelationalStore, Rephraser, Stage, SupplementaryFile,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner with one log line per finished stage.
struct CliProgressCallback {
    bar: ProgressBar,
    done: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(Stage::ALL.len() as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:24.green/238}] {pos}/{len}  {msg}  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Queued");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            done: AtomicUsize::new(0),
        })
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_job_start(&self, job_id: &str) {
        self.bar.set_prefix("Running");
        self.bar.println(format!("{} {}", bold("◆"), bold(&format!("Job {job_id} started"))));
    }

    fn on_stage_start(&self, _job_id: &str, stage: Stage) {
        self.bar.set_message(stage.to_string());
    }

    fn on_stage_complete(&self, _job_id: &str, stage: Stage) {
        self.done.fetch_add(1, Ordering::Relaxed);
        self.bar.println(format!("  {} {}", green("✓"), stage));
        self.bar.inc(1);
    }

    fn on_download_error(&self, _job_id: &str, key: &str, error: &str) {
        self.bar
            .println(format!("  {} skipped {}  {}", yellow("⚠"), key, dim(error)));
    }

    fn on_job_complete(&self, job_id: &str, status: JobStatus, error: Option<&str>) {
        self.bar.finish_and_clear();
        match error {
            None => eprintln!(
                "{} Job {} {} ({} stages)",
                green("✔"),
                bold(job_id),
                status,
                self.done.load(Ordering::Relaxed)
            ),
            Some(e) => eprintln!("{} Job {} {}: {}", red("✘"), bold(job_id), status, e),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Generate a document and print the Markdown
  sopgen run --job-id 42 --owner u1 --template sop-basic --query "How do I add a product?"

  # Same job, written to a file, with model output kept for inspection
  sopgen run --job-id 42 --owner u1 --template sop-basic --query "..." -o sop.md --debug-dir debug_output

  # Offline run against local files and a canned engine reply
  sopgen run --dry-run --job-id demo --owner local --template t --query "..." \
      --screenshots ./shots --event-log ./events.json --template-json ./schema.json --reply ./reply.json

  # Follow a job until it finishes
  sopgen status 42 --follow

  # Rewrite one section of a generated document
  sopgen rephrase --document sop.md --section-file steps.md --query "Use shorter sentences"

ENVIRONMENT VARIABLES:
  SUPABASE_URL               Supabase project URL
  SUPABASE_SERVICE_ROLE_KEY  Service role key (storage + PostgREST)
  SUPABASE_BUCKET            Storage bucket (default: log_dataa)
  GOOGLE_API_KEY             Gemini API key (GEMINI_API_KEY also accepted)
  GEMINI_MODEL               Generation model (default: gemini-2.0-flash)
  GEMINI_EMBEDDING_MODEL     Embedding model (default: text-embedding-004)
"#;

/// Generate SOP documents from recorded sessions.
#[derive(Parser, Debug)]
#[command(
    name = "sopgen",
    version,
    about = "Generate SOP documents from recorded screenshots and event logs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "SOPGEN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "SOPGEN_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a job and wait for it to finish.
    Run(RunArgs),
    /// Print the stored status of a job.
    Status(StatusArgs),
    /// Rewrite one section of a generated Markdown document.
    Rephrase(RephraseArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    job_id: String,

    /// Owner (user) id; also the first storage path segment.
    #[arg(long, env = "SOPGEN_OWNER")]
    owner: String,

    /// What the document should answer.
    #[arg(long)]
    query: String,

    /// Template id holding the output schema.
    #[arg(long, env = "SOPGEN_TEMPLATE")]
    template: String,

    /// Knowledge-base integration searched for context.
    #[arg(long, default_value = "jira")]
    integration: String,

    /// Supplementary file whose text is added to the prompt.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long, env = "SOPGEN_OUTPUT")]
    output: Option<PathBuf>,

    /// Concurrent screenshot downloads.
    #[arg(short, long, env = "SOPGEN_CONCURRENCY", default_value_t = 10)]
    concurrency: usize,

    /// Knowledge-base items added as context.
    #[arg(long, env = "SOPGEN_TOP_K", default_value_t = 5)]
    top_k: usize,

    /// Generate call timeout in seconds.
    #[arg(long, env = "SOPGEN_GENERATION_TIMEOUT", default_value_t = 300)]
    generation_timeout: u64,

    /// Per-object download timeout in seconds.
    #[arg(long, env = "SOPGEN_DOWNLOAD_TIMEOUT", default_value_t = 60)]
    download_timeout: u64,

    /// Public URL prefix for screenshot links. Default: the bucket's public URL.
    #[arg(long, env = "SOPGEN_IMAGE_BASE_URL")]
    image_base_url: Option<String>,

    /// Keep raw model JSON and rendered Markdown here.
    #[arg(long, env = "SOPGEN_DEBUG_DIR")]
    debug_dir: Option<PathBuf>,

    /// Fail when the model output contradicts the schema.
    #[arg(long)]
    strict_schema: bool,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "SOPGEN_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Disable progress bar.
    #[arg(long, env = "SOPGEN_NO_PROGRESS")]
    no_progress: bool,

    /// Run against in-memory stores seeded from local files.
    #[arg(long, requires_all = ["screenshots", "event_log", "template_json"])]
    dry_run: bool,

    /// Dry run: directory of screenshots.
    #[arg(long)]
    screenshots: Option<PathBuf>,

    /// Dry run: event log file.
    #[arg(long)]
    event_log: Option<PathBuf>,

    /// Dry run: template schema (JSON).
    #[arg(long)]
    template_json: Option<PathBuf>,

    /// Dry run: canned engine reply (JSON). Default: `{}`.
    #[arg(long)]
    reply: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    job_id: String,

    /// Keep polling until the job is terminal.
    #[arg(short, long)]
    follow: bool,

    /// Poll interval in seconds for --follow.
    #[arg(long, default_value_t = 2)]
    interval: u64,
}

#[derive(Args, Debug)]
struct RephraseArgs {
    /// How the section should change.
    #[arg(long)]
    query: String,

    /// Markdown document containing the section.
    #[arg(long)]
    document: PathBuf,

    /// Section text, verbatim as it appears in the document.
    #[arg(long, conflicts_with = "section_file", required_unless_present = "section_file")]
    section: Option<String>,

    /// File holding the section text.
    #[arg(long)]
    section_file: Option<PathBuf>,

    /// Write the document with the section replaced instead of printing the section.
    #[arg(long)]
    in_place: bool,

    /// Generate call timeout in seconds.
    #[arg(long, env = "SOPGEN_GENERATION_TIMEOUT", default_value_t = 300)]
    generation_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar covers INFO-level feedback; keep library logs quiet
    // unless asked for.
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Run(ref args) => run(args, cli.quiet).await,
        Command::Status(ref args) => status(args).await,
        Command::Rephrase(ref args) => rephrase(args, cli.quiet).await,
    }
}

async fn run(args: &RunArgs, quiet: bool) -> Result<()> {
    let progress = if quiet || args.no_progress {
        None
    } else {
        let cb: ProgressCallback = CliProgressCallback::new();
        Some(cb)
    };

    let (clients, default_image_base) = if args.dry_run {
        dry_run_clients(args).await?
    } else {
        live_clients()?
    };
    let config = build_config(args, default_image_base, progress).await?;
    let records = Arc::clone(&clients.records);
    let docs_table = config.docs_table.clone();
    let manager = JobManager::new(clients, config).context("Invalid pipeline configuration")?;

    let mut request = JobRequest::new(&args.job_id, &args.owner, &args.query, &args.template, &args.integration);
    if let Some(ref path) = args.file {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        request = request.with_file(SupplementaryFile::new(name, bytes));
    }

    let ack = manager.submit(request).await.context("Submission failed")?;
    let status = manager.wait(&ack.job_id).await?;
    if status != JobStatus::Success {
        bail!("Job {} finished as {}", ack.job_id, status);
    }

    let row = records
        .select(&docs_table, &[("id", ack.job_id.as_str())])
        .await
        .context("Cannot read the finished job record")?
        .context("Finished job record is missing")?;
    let content = row.get("content").and_then(|v| v.as_str()).unwrap_or_default();

    match args.output {
        Some(ref path) => {
            std::fs::write(path, content).with_context(|| format!("Cannot write {}", path.display()))?;
            if !quiet {
                eprintln!("{} Wrote {}", green("✔"), path.display());
            }
        }
        None => {
            let mut out = io::stdout().lock();
            out.write_all(content.as_bytes())?;
            out.flush()?;
        }
    }
    Ok(())
}

async fn status(args: &StatusArgs) -> Result<()> {
    let (clients, image_base) = live_clients()?;
    let config = PipelineConfig::builder().image_base_url(image_base).build()?;
    let manager = JobManager::new(clients, config)?;

    if !args.follow {
        let report = manager.status(&args.job_id).await?;
        println!("{}", report.status);
        return Ok(());
    }
    let mut updates = status_stream(manager, args.job_id.clone(), Duration::from_secs(args.interval.max(1)));
    while let Some(update) = updates.next().await {
        let report = update?;
        println!("{}", report.status);
    }
    Ok(())
}

async fn rephrase(args: &RephraseArgs, quiet: bool) -> Result<()> {
    let document = tokio::fs::read_to_string(&args.document)
        .await
        .with_context(|| format!("Cannot read {}", args.document.display()))?;
    let section = match (&args.section, &args.section_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?,
        (None, None) => bail!("--section or --section-file is required"),
    };
    // Files usually end with a newline the document does not repeat.
    let section = section.trim_end_matches(['\r', '\n']);

    let gemini = GeminiClient::from_env().context("Gemini is not configured")?;
    let config = PipelineConfig::builder()
        .generation_timeout_secs(args.generation_timeout)
        .build()?;
    let rewritten = Rephraser::new(Arc::new(gemini), &config)
        .rephrase(&args.query, &document, section)
        .await?;

    if args.in_place {
        let updated = document.replacen(section, &rewritten, 1);
        std::fs::write(&args.document, updated)
            .with_context(|| format!("Cannot write {}", args.document.display()))?;
        if !quiet {
            eprintln!("{} Updated {}", green("✔"), args.document.display());
        }
    } else {
        let mut out = io::stdout().lock();
        writeln!(out, "{rewritten}")?;
        out.flush()?;
    }
    Ok(())
}

fn live_clients() -> Result<(Clients, String)> {
    let supabase = SupabaseClient::from_env().context("Supabase is not configured")?;
    let gemini = GeminiClient::from_env().context("Gemini is not configured")?;
    let search = VectorSearch::new(supabase.clone(), Arc::new(gemini.clone()));
    let image_base = supabase.public_object_base();
    let supabase = Arc::new(supabase);
    Ok((
        Clients::new(supabase.clone(), supabase, Arc::new(gemini), Arc::new(search)),
        image_base,
    ))
}

/// Seed in-memory stores with local files laid out as the pipeline expects.
async fn dry_run_clients(args: &RunArgs) -> Result<(Clients, String)> {
    let (Some(shots), Some(log), Some(template)) = (&args.screenshots, &args.event_log, &args.template_json) else {
        bail!("--dry-run needs --screenshots, --event-log and --template-json");
    };
    let reply = match args.reply {
        Some(ref path) => std::fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?,
        None => "{}".to_string(),
    };
    let backend = MemoryBackend::new(reply, MemorySimilarityService::new(vec![]));
    let prefix = format!("{}/{}", args.owner, args.job_id);

    let mut entries = tokio::fs::read_dir(shots)
        .await
        .with_context(|| format!("Cannot list {}", shots.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            let name = entry.file_name().to_string_lossy().into_owned();
            backend
                .objects
                .insert(format!("{prefix}/screenshots/{name}"), tokio::fs::read(entry.path()).await?);
        }
    }
    backend
        .objects
        .insert(format!("{prefix}/json/{}", file_name(log)), tokio::fs::read(log).await?);

    let schema: serde_json::Value = serde_json::from_slice(&tokio::fs::read(template).await?)
        .with_context(|| format!("{} is not JSON", template.display()))?;
    backend.records.insert(
        "templates",
        json!({ "id": args.template, "user_id": args.owner, "name": "SOP", "components": schema }),
    );
    Ok((backend.clients(), "http://localhost/dry-run".to_string()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "events.json".to_string())
}

async fn build_config(args: &RunArgs, default_image_base: String, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .download_concurrency(args.concurrency)
        .top_k(args.top_k)
        .generation_timeout_secs(args.generation_timeout)
        .download_timeout_secs(args.download_timeout)
        .image_base_url(args.image_base_url.clone().unwrap_or(default_image_base))
        .strict_schema(args.strict_schema);
    if let Some(ref dir) = args.debug_dir {
        builder = builder.debug_dir(dir);
    }
    if let Some(ref path) = args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read system prompt {}", path.display()))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    Ok(builder.build()?)
}
