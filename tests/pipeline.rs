//! End-to-end tests of the job pipeline against the in-memory collaborators.
//!
//! Every test drives a real `JobManager` through `submit` → `wait` and then
//! inspects what the doubles recorded: status writes, engine uploads,
//! downloads and the scratch directory.

use edgequake_sopgen::clients::memory::{MemoryBackend, MemorySimilarityService};
use edgequake_sopgen::{
    JobError, JobManager, JobProgressCallback, JobRequest, JobStatus, PipelineConfig, SimilarityMatch, Stage,
    SupplementaryFile,
};
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ── Test helpers ─────────────────────────────────────────────────────────────

const OWNER: &str = "user-1";
const TEMPLATE: &str = "tpl-1";
const DOCS: &str = "generated_docs";
const BASE: &str = "https://cdn.example.com/storage/v1/object/public/log_dataa";

fn png(w: u32, h: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(w, h, Rgb([40, 120, 200]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "docTitle": { "type": "string" },
            "title": { "type": "string" },
            "shortDescription": { "type": "string" },
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "step": { "type": "string" },
                        "explanation": { "type": "string" },
                        "screenshotRef": { "type": "string" }
                    }
                }
            }
        }
    })
}

fn reply() -> String {
    json!({
        "docTitle": "Adding a product",
        "title": "Adding a product to the catalogue",
        "shortDescription": "Create a product from the admin panel.",
        "steps": [
            { "step": "Open Products", "explanation": "Use the sidebar", "screenshotRef": "01.png" },
            { "step": "Click New", "screenshotRef": "02.png" }
        ]
    })
    .to_string()
}

/// A backend holding one owner template and a three-screenshot session for `job_id`.
fn seeded(job_id: &str, similarity: MemorySimilarityService) -> MemoryBackend {
    let backend = MemoryBackend::new(reply(), similarity);
    backend.records.insert(
        "templates",
        json!({ "id": TEMPLATE, "user_id": OWNER, "name": "Product SOP", "components": schema() }),
    );
    seed_session(&backend, job_id);
    backend
}

fn seed_session(backend: &MemoryBackend, job_id: &str) {
    for name in ["01.png", "02.png", "03.png"] {
        backend
            .objects
            .insert(format!("{OWNER}/{job_id}/screenshots/{name}"), png(64, 48));
    }
    backend
        .objects
        .insert(format!("{OWNER}/{job_id}/screenshots/.emptyFolderPlaceholder"), Vec::<u8>::new());
    backend.objects.insert(
        format!("{OWNER}/{job_id}/json/events.json"),
        br#"[{"type":"click","target":"Products"}]"#.to_vec(),
    );
}

fn config(scratch: &TempDir) -> PipelineConfig {
    PipelineConfig::builder()
        .image_base_url(BASE)
        .temp_dir(scratch.path())
        .download_timeout_secs(5)
        .generation_timeout_secs(5)
        .build()
        .unwrap()
}

fn request(job_id: &str) -> JobRequest {
    JobRequest::new(job_id, OWNER, "How do I add a product?", TEMPLATE, "jira")
}

fn statuses(backend: &MemoryBackend, job_id: &str) -> Vec<String> {
    backend
        .records
        .writes(DOCS)
        .into_iter()
        .filter(|w| w["id"] == job_id)
        .map(|w| w["status"].as_str().unwrap_or_default().to_string())
        .collect()
}

fn stored_row(backend: &MemoryBackend, job_id: &str) -> Value {
    backend
        .records
        .rows(DOCS)
        .into_iter()
        .find(|r| r["id"] == job_id)
        .expect("job row")
}

fn scratch_is_empty(scratch: &TempDir) -> bool {
    std::fs::read_dir(scratch.path()).unwrap().next().is_none()
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl JobProgressCallback for Recorder {
    fn on_job_start(&self, job_id: &str) {
        self.events.lock().unwrap().push(format!("start {job_id}"));
    }
    fn on_stage_complete(&self, _job_id: &str, stage: Stage) {
        self.events.lock().unwrap().push(format!("done {stage}"));
    }
    fn on_download_error(&self, _job_id: &str, key: &str, _error: &str) {
        self.events.lock().unwrap().push(format!("skip {key}"));
    }
    fn on_job_complete(&self, _job_id: &str, status: JobStatus, error: Option<&str>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("end {status} {}", error.unwrap_or("-")));
    }
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn successful_job_persists_rendered_document() {
    let scratch = tempfile::tempdir().unwrap();
    let similarity = MemorySimilarityService::new(vec![SimilarityMatch {
        id: "PRJ-7".into(),
        text: "Product creation flow".into(),
        score: 0.91,
    }]);
    let backend = seeded("job-1", similarity);
    let manager = JobManager::new(backend.clients(), config(&scratch)).unwrap();

    let ack = manager.submit(request("job-1")).await.unwrap();
    assert_eq!(ack.status, JobStatus::Queued);
    assert_eq!(ack.job_id, "job-1");
    assert_eq!(manager.wait("job-1").await.unwrap(), JobStatus::Success);

    assert_eq!(statuses(&backend, "job-1"), vec!["queued", "pending", "success"]);
    let row = stored_row(&backend, "job-1");
    assert_eq!(row["status"], "success");
    assert_eq!(row["title"], "Adding a product");
    assert_eq!(row["desc"], "Create a product from the admin panel.");
    assert_eq!(row["category"], "Product SOP");
    assert_eq!(row["user_id"], OWNER);
    let content = row["content"].as_str().unwrap();
    assert!(content.starts_with("# Adding a product to the catalogue\n"), "{content}");
    assert!(content.contains(&format!("![Use the sidebar]({BASE}/{OWNER}/job-1/screenshots/01.png)")));
    assert!(content.contains(&format!(
        "![Screenshot for Step 2]({BASE}/{OWNER}/job-1/screenshots/02.png)"
    )));

    // Placeholder skipped; three screenshots plus the event log downloaded.
    assert_eq!(backend.objects.download_count(), 4);
    assert_eq!(backend.engine.upload_count(), 1);
    assert_eq!(backend.engine.live_uploads(), 0);
    let pdf = backend.engine.last_upload().unwrap();
    assert!(pdf.starts_with(b"%PDF"));

    let prompt = backend.engine.last_prompt().unwrap();
    assert!(prompt.contains("How do I add a product?"));
    assert!(prompt.contains("Jira Item: PRJ-7"));
    assert!(prompt.contains(r#""target":"Products""#));
    assert_eq!(
        backend.similarity.searches(),
        vec![(OWNER.to_string(), "jira".to_string(), 5)]
    );

    assert!(scratch_is_empty(&scratch));
    assert!(manager.active_jobs().is_empty());
    assert_eq!(manager.status("job-1").await.unwrap().status, JobStatus::Success);
}

#[tokio::test]
async fn public_template_is_used_when_owner_has_none() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new(reply(), MemorySimilarityService::new(vec![]));
    backend.records.insert(
        "publictemplates",
        json!({ "id": TEMPLATE, "name": "Onboarding", "components": schema() }),
    );
    backend.records.insert(
        "templates",
        json!({ "id": TEMPLATE, "user_id": "someone-else", "name": "Theirs", "components": schema() }),
    );
    seed_session(&backend, "job-2");
    let manager = JobManager::new(backend.clients(), config(&scratch)).unwrap();

    manager.submit(request("job-2")).await.unwrap();
    assert_eq!(manager.wait("job-2").await.unwrap(), JobStatus::Success);
    assert_eq!(stored_row(&backend, "job-2")["category"], "Onboarding");
}

#[tokio::test]
async fn similarity_failure_does_not_fail_the_job() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-3", MemorySimilarityService::failing("vector index offline"));
    let manager = JobManager::new(backend.clients(), config(&scratch)).unwrap();

    manager.submit(request("job-3")).await.unwrap();
    assert_eq!(manager.wait("job-3").await.unwrap(), JobStatus::Success);
    let prompt = backend.engine.last_prompt().unwrap();
    assert!(prompt.contains("Jira context unavailable."), "{prompt}");
}

#[tokio::test]
async fn supplementary_text_reaches_the_prompt() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-4", MemorySimilarityService::new(vec![]));
    let manager = JobManager::new(backend.clients(), config(&scratch)).unwrap();

    let req = request("job-4").with_file(SupplementaryFile::new("pricing.csv", b"sku,price\nA1,10".to_vec()));
    manager.submit(req).await.unwrap();
    assert_eq!(manager.wait("job-4").await.unwrap(), JobStatus::Success);
    assert!(backend.engine.last_prompt().unwrap().contains("sku,price\nA1,10"));
}

#[tokio::test]
async fn partial_download_failure_is_reported_and_skipped() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-5", MemorySimilarityService::new(vec![]));
    let bad = format!("{OWNER}/job-5/screenshots/02.png");
    backend.objects.fail_download(bad.clone());
    let recorder = Arc::new(Recorder::default());
    let cfg = PipelineConfig::builder()
        .image_base_url(BASE)
        .temp_dir(scratch.path())
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let manager = JobManager::new(backend.clients(), cfg).unwrap();

    manager.submit(request("job-5")).await.unwrap();
    assert_eq!(manager.wait("job-5").await.unwrap(), JobStatus::Success);

    let events = recorder.events();
    assert_eq!(
        events,
        vec![
            "start job-5".to_string(),
            "done resolve-schema".into(),
            format!("skip {bad}"),
            "done fetch-resources".into(),
            "done assemble-artifact".into(),
            "done build-context".into(),
            "done generate".into(),
            "done render".into(),
            "done persist".into(),
            "end success -".into(),
        ]
    );
    assert!(scratch_is_empty(&scratch));
}

// ── Failure paths ────────────────────────────────────────────────────────────

#[tokio::test]
async fn non_json_reply_fails_and_cleans_up() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-6", MemorySimilarityService::new(vec![]));
    backend.engine.set_reply("I could not find any steps in these screenshots.");
    let recorder = Arc::new(Recorder::default());
    let cfg = PipelineConfig::builder()
        .image_base_url(BASE)
        .temp_dir(scratch.path())
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let manager = JobManager::new(backend.clients(), cfg).unwrap();

    manager.submit(request("job-6")).await.unwrap();
    assert_eq!(manager.wait("job-6").await.unwrap(), JobStatus::Failed);

    assert_eq!(statuses(&backend, "job-6"), vec!["queued", "pending", "failed"]);
    let row = stored_row(&backend, "job-6");
    assert!(row.get("content").is_none());
    assert_eq!(backend.engine.upload_count(), 1);
    assert_eq!(backend.engine.live_uploads(), 0);
    assert!(scratch_is_empty(&scratch));

    let last = recorder.events().pop().unwrap();
    assert!(last.starts_with("end failed Validation failed"), "{last}");
}

#[tokio::test]
async fn missing_template_fails_before_any_download() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new(reply(), MemorySimilarityService::new(vec![]));
    seed_session(&backend, "job-7");
    let manager = JobManager::new(backend.clients(), config(&scratch)).unwrap();

    manager.submit(request("job-7")).await.unwrap();
    assert_eq!(manager.wait("job-7").await.unwrap(), JobStatus::Failed);
    assert_eq!(backend.objects.download_count(), 0);
    assert_eq!(backend.engine.upload_count(), 0);
    assert_eq!(statuses(&backend, "job-7"), vec!["queued", "pending", "failed"]);
}

#[tokio::test]
async fn all_downloads_failing_is_empty_input() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-8", MemorySimilarityService::new(vec![]));
    for name in ["01.png", "02.png", "03.png"] {
        backend.objects.fail_download(format!("{OWNER}/job-8/screenshots/{name}"));
    }
    let recorder = Arc::new(Recorder::default());
    let cfg = PipelineConfig::builder()
        .image_base_url(BASE)
        .temp_dir(scratch.path())
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let manager = JobManager::new(backend.clients(), cfg).unwrap();

    manager.submit(request("job-8")).await.unwrap();
    assert_eq!(manager.wait("job-8").await.unwrap(), JobStatus::Failed);
    assert_eq!(backend.engine.upload_count(), 0);
    let last = recorder.events().pop().unwrap();
    assert!(last.contains("No usable input"), "{last}");
    assert!(scratch_is_empty(&scratch));
}

#[tokio::test]
async fn failed_success_write_is_recorded_as_failed() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-9", MemorySimilarityService::new(vec![]));
    backend.records.fail_upsert_when("status", "success");
    let manager = JobManager::new(backend.clients(), config(&scratch)).unwrap();

    manager.submit(request("job-9")).await.unwrap();
    assert_eq!(manager.wait("job-9").await.unwrap(), JobStatus::Failed);
    assert_eq!(statuses(&backend, "job-9"), vec!["queued", "pending", "failed"]);
    assert_eq!(stored_row(&backend, "job-9")["status"], "failed");
}

#[tokio::test]
async fn engine_timeout_fails_the_job() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-10", MemorySimilarityService::new(vec![]));
    backend.engine.set_latency(Duration::from_secs(3));
    let cfg = PipelineConfig::builder()
        .image_base_url(BASE)
        .temp_dir(scratch.path())
        .generation_timeout_secs(1)
        .build()
        .unwrap();
    let manager = JobManager::new(backend.clients(), cfg).unwrap();

    manager.submit(request("job-10")).await.unwrap();
    assert_eq!(manager.wait("job-10").await.unwrap(), JobStatus::Failed);
    assert_eq!(backend.engine.live_uploads(), 0);
}

#[tokio::test]
async fn panicking_engine_is_recorded_as_failed() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-20", MemorySimilarityService::new(vec![]));
    backend.engine.panic_on_generate();
    let recorder = Arc::new(Recorder::default());
    let cfg = PipelineConfig::builder()
        .image_base_url(BASE)
        .temp_dir(scratch.path())
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let manager = JobManager::new(backend.clients(), cfg).unwrap();

    manager.submit(request("job-20")).await.unwrap();
    assert_eq!(manager.wait("job-20").await.unwrap(), JobStatus::Failed);
    assert_eq!(statuses(&backend, "job-20"), vec!["queued", "pending", "failed"]);
    assert!(manager.active_jobs().is_empty());
    assert!(scratch_is_empty(&scratch));
    let last = recorder.events().pop().unwrap();
    assert!(last.contains("panicked"), "{last}");

    // The unwound upload guard deletes in the background.
    for _ in 0..100 {
        if backend.engine.live_uploads() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(backend.engine.live_uploads(), 0);
}

#[tokio::test]
async fn failed_pending_write_goes_straight_to_failed() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-21", MemorySimilarityService::new(vec![]));
    backend.records.fail_upsert_when("status", "pending");
    let manager = JobManager::new(backend.clients(), config(&scratch)).unwrap();

    manager.submit(request("job-21")).await.unwrap();
    assert_eq!(manager.wait("job-21").await.unwrap(), JobStatus::Failed);
    assert_eq!(statuses(&backend, "job-21"), vec!["queued", "failed"]);
    assert_eq!(stored_row(&backend, "job-21")["status"], "failed");
    assert!(manager.active_jobs().is_empty());
    assert!(scratch_is_empty(&scratch));
    assert_eq!(backend.objects.download_count(), 0);
}

// ── Concurrency & status reads ──────────────────────────────────────────────

#[tokio::test]
async fn duplicate_submission_conflicts_while_running() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-11", MemorySimilarityService::new(vec![]));
    backend.engine.set_latency(Duration::from_millis(300));
    let manager = JobManager::new(backend.clients(), config(&scratch)).unwrap();

    manager.submit(request("job-11")).await.unwrap();
    let err = manager.submit(request("job-11")).await.unwrap_err();
    assert!(matches!(err, JobError::Conflict { .. }), "{err}");
    assert_eq!(manager.active_jobs(), vec!["job-11".to_string()]);

    assert_eq!(manager.wait("job-11").await.unwrap(), JobStatus::Success);
    backend.engine.set_latency(Duration::ZERO);
    manager.submit(request("job-11")).await.unwrap();
    assert_eq!(manager.wait("job-11").await.unwrap(), JobStatus::Success);
}

#[tokio::test]
async fn status_is_readable_while_running() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-12", MemorySimilarityService::new(vec![]));
    backend.engine.set_latency(Duration::from_millis(300));
    let manager = JobManager::new(backend.clients(), config(&scratch)).unwrap();

    manager.submit(request("job-12")).await.unwrap();
    let mut seen_pending = false;
    for _ in 0..100 {
        let status = manager.status("job-12").await.unwrap().status;
        assert!(!status.is_terminal() || status == JobStatus::Success);
        if status == JobStatus::Pending {
            seen_pending = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(seen_pending);
    assert_eq!(manager.wait("job-12").await.unwrap(), JobStatus::Success);
}

#[tokio::test]
async fn concurrent_jobs_do_not_share_state() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = seeded("job-a", MemorySimilarityService::new(vec![]));
    seed_session(&backend, "job-b");
    let manager = JobManager::new(backend.clients(), config(&scratch)).unwrap();

    manager.submit(request("job-a")).await.unwrap();
    manager.submit(request("job-b")).await.unwrap();
    let (a, b) = tokio::join!(manager.wait("job-a"), manager.wait("job-b"));
    assert_eq!(a.unwrap(), JobStatus::Success);
    assert_eq!(b.unwrap(), JobStatus::Success);

    let a = stored_row(&backend, "job-a")["content"].as_str().unwrap().to_string();
    let b = stored_row(&backend, "job-b")["content"].as_str().unwrap().to_string();
    assert!(a.contains("/job-a/screenshots/01.png"));
    assert!(b.contains("/job-b/screenshots/01.png"));
    assert_eq!(backend.engine.live_uploads(), 0);
    assert!(scratch_is_empty(&scratch));
}

#[test]
fn unknown_job_status_is_not_found() {
    let backend = MemoryBackend::new("{}", MemorySimilarityService::new(vec![]));
    let manager = JobManager::new(backend.clients(), PipelineConfig::default()).unwrap();
    let result = tokio_test::block_on(manager.status("never-submitted"));
    assert!(matches!(result, Err(JobError::NotFound { .. })));
}

#[tokio::test]
async fn debug_output_is_written_when_configured() {
    let scratch = tempfile::tempdir().unwrap();
    let debug = tempfile::tempdir().unwrap();
    let backend = seeded("job-13", MemorySimilarityService::new(vec![]));
    let cfg = PipelineConfig::builder()
        .image_base_url(BASE)
        .temp_dir(scratch.path())
        .debug_dir(debug.path())
        .build()
        .unwrap();
    let manager = JobManager::new(backend.clients(), cfg).unwrap();

    manager.submit(request("job-13")).await.unwrap();
    assert_eq!(manager.wait("job-13").await.unwrap(), JobStatus::Success);

    let mut names: Vec<String> = std::fs::read_dir(debug.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names.len(), 2);
    assert!(names[0].starts_with("job_job-13_") && names[0].ends_with("_model_output.json"));
    assert!(names[1].ends_with("_output.md"));
}
