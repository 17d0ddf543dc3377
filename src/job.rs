//! Job identity, status state machine, and the persisted record layout.
//!
//! A job moves through `queued → pending → success | failed`. `queued` is
//! written synchronously at submission; `pending` when the background run
//! starts; exactly one terminal status when it ends. A submission that
//! cannot even start may go straight from `queued` to `failed`. Terminal
//! states accept no further transition.

use crate::error::JobError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Status of a job as stored in the `generated_docs` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Pending,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Pending => "pending",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Pending)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Success)
                | (JobStatus::Pending, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "pending" => Ok(JobStatus::Pending),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(JobError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// An optional file attached to a submission (spreadsheet export, notes…).
#[derive(Debug, Clone)]
pub struct SupplementaryFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Extensions whose bytes are passed to the prompt as text.
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "csv", "tsv", "json", "log", "xml", "yaml", "yml"];

impl SupplementaryFile {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    /// Best-effort text view of the file.
    ///
    /// Text-like files are decoded as UTF-8 (lossy) and PDFs through their
    /// text layer. Binary office formats have no reader here and yield `None`.
    pub fn text(&self) -> Option<String> {
        let ext = Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            None => Some(String::from_utf8_lossy(&self.bytes).into_owned()),
            Some(e) if TEXT_EXTENSIONS.contains(&e) => {
                Some(String::from_utf8_lossy(&self.bytes).into_owned())
            }
            Some("pdf") => pdf_text(&self.filename, &self.bytes),
            Some(_) => None,
        }
    }
}

/// Text layer of every page, or `None` for a scanned or unreadable PDF.
fn pdf_text(filename: &str, bytes: &[u8]) -> Option<String> {
    let doc = match lopdf::Document::load_mem(bytes) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("Could not open {} as PDF: {}", filename, e);
            return None;
        }
    };
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    match doc.extract_text(&pages) {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => None,
        Err(e) => {
            warn!("Could not extract text from {}: {}", filename, e);
            None
        }
    }
}

/// Everything a caller supplies when submitting a job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: String,
    pub owner_id: String,
    pub query: String,
    pub template_id: String,
    pub integration_type: String,
    pub file: Option<SupplementaryFile>,
}

impl JobRequest {
    pub fn new(
        job_id: impl Into<String>,
        owner_id: impl Into<String>,
        query: impl Into<String>,
        template_id: impl Into<String>,
        integration_type: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            owner_id: owner_id.into(),
            query: query.into(),
            template_id: template_id.into(),
            integration_type: integration_type.into(),
            file: None,
        }
    }

    pub fn with_file(mut self, file: SupplementaryFile) -> Self {
        self.file = Some(file);
        self
    }

    /// Reject requests that cannot address storage paths.
    pub fn validate(&self) -> Result<(), JobError> {
        for (field, value) in [
            ("job_id", &self.job_id),
            ("owner_id", &self.owner_id),
            ("template_id", &self.template_id),
        ] {
            if value.trim().is_empty() {
                return Err(JobError::InvalidConfig(format!("{field} must not be empty")));
            }
            if value.contains('/') {
                return Err(JobError::InvalidConfig(format!(
                    "{field} must not contain '/', got '{value}'"
                )));
            }
        }
        Ok(())
    }
}

/// Returned by `submit` before any pipeline work happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub status: JobStatus,
    pub job_id: String,
}

/// Returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_id: String,
    pub status: JobStatus,
}

/// Row layout of the `generated_docs` table.
///
/// Payload columns are skipped when `None`, so a status-only upsert leaves
/// previously written payload untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub user_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl JobRecord {
    pub fn to_value(&self) -> Result<Value, JobError> {
        serde_json::to_value(self).map_err(|e| JobError::Internal(format!("record encoding: {e}")))
    }
}

/// In-memory view of one job invocation, mutated only by the Lifecycle Manager.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub owner_id: String,
    pub query: String,
    pub category: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub description: Option<String>,
    status: JobStatus,
    created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(request: &JobRequest) -> Self {
        Self {
            job_id: request.job_id.clone(),
            owner_id: request.owner_id.clone(),
            query: request.query.clone(),
            category: None,
            title: None,
            content: None,
            description: None,
            status: JobStatus::Queued,
            created_at: Utc::now(),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The row written at submission time.
    pub fn initial_record(&self) -> JobRecord {
        JobRecord {
            id: self.job_id.clone(),
            user_id: self.owner_id.clone(),
            status: JobStatus::Queued,
            title: None,
            content: None,
            desc: None,
            category: None,
            created_at: Some(self.created_at_rfc3339()),
        }
    }

    /// The row to write for a move to `next`, refusing illegal transitions.
    ///
    /// Only a `success` row carries the terminal payload; `pending` and
    /// `failed` rows touch the status column alone.
    pub fn record_for(&self, next: JobStatus) -> Result<JobRecord, JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let mut record = JobRecord {
            id: self.job_id.clone(),
            user_id: self.owner_id.clone(),
            status: next,
            title: None,
            content: None,
            desc: None,
            category: None,
            created_at: None,
        };
        if next == JobStatus::Success {
            record.title = self.title.clone();
            record.content = self.content.clone();
            record.desc = self.description.clone();
            record.category = self.category.clone();
            record.created_at = Some(self.created_at_rfc3339());
        }
        Ok(record)
    }

    /// Record that the row for `next` has been durably written.
    pub fn commit(&mut self, next: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn set_payload(
        &mut self,
        title: impl Into<String>,
        content: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
    ) {
        self.title = Some(title.into());
        self.content = Some(content.into());
        self.description = Some(description.into());
        self.category = Some(category.into());
    }

    fn created_at_rfc3339(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> JobRequest {
        JobRequest::new("j1", "u1", "How do I add a product?", "t1", "jira")
    }

    #[test]
    fn transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Pending));
        assert!(Queued.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Success));
        assert!(Pending.can_transition_to(Failed));

        assert!(!Queued.can_transition_to(Success));
        assert!(!Pending.can_transition_to(Queued));
        for terminal in [Success, Failed] {
            for next in [Queued, Pending, Success, Failed] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [JobStatus::Queued, JobStatus::Pending, JobStatus::Success, JobStatus::Failed] {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("done".parse::<JobStatus>().is_err());
        assert_eq!(" FAILED ".parse::<JobStatus>().unwrap(), JobStatus::Failed);
    }

    #[test]
    fn failed_job_refuses_success() {
        let mut job = Job::new(&request());
        job.commit(JobStatus::Pending).unwrap();
        job.commit(JobStatus::Failed).unwrap();
        let err = job.record_for(JobStatus::Success).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert!(job.commit(JobStatus::Success).is_err());
        assert_eq!(job.status(), JobStatus::Failed);
    }

    #[test]
    fn status_only_record_omits_payload_columns() {
        let job = Job::new(&request());
        let value = job.record_for(JobStatus::Pending).unwrap().to_value().unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj["status"], "pending");
        assert_eq!(obj["id"], "j1");
        assert_eq!(obj["user_id"], "u1");
        assert!(!obj.contains_key("content"));
        assert!(!obj.contains_key("title"));
    }

    #[test]
    fn success_record_carries_payload() {
        let mut job = Job::new(&request());
        job.commit(JobStatus::Pending).unwrap();
        job.set_payload("Adding products", "# Adding products\n", "short", "SOP");
        let record = job.record_for(JobStatus::Success).unwrap();
        assert_eq!(record.title.as_deref(), Some("Adding products"));
        assert_eq!(record.desc.as_deref(), Some("short"));
        assert_eq!(record.category.as_deref(), Some("SOP"));
        assert!(record.created_at.is_some());
    }

    #[test]
    fn request_validation_rejects_path_separators() {
        assert!(request().validate().is_ok());
        let mut bad = request();
        bad.owner_id = "u1/../u2".into();
        assert!(matches!(bad.validate(), Err(JobError::InvalidConfig(_))));
        let mut empty = request();
        empty.job_id = "  ".into();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn supplementary_text_only_for_text_formats() {
        let csv = SupplementaryFile::new("notes.csv", b"a,b\n1,2".to_vec());
        assert_eq!(csv.text().as_deref(), Some("a,b\n1,2"));
        let xlsx = SupplementaryFile::new("sheet.xlsx", vec![0x50, 0x4b, 0x03, 0x04]);
        assert_eq!(xlsx.text(), None);
        let bare = SupplementaryFile::new("README", b"hello".to_vec());
        assert_eq!(bare.text().as_deref(), Some("hello"));
    }

    fn one_page_pdf(line: &str) -> Vec<u8> {
        use lopdf::{dictionary, Document, Object, Stream};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let content = format!("BT\n/F1 12 Tf\n72 720 Td\n({line}) Tj\nET\n");
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            "Contents" => content_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn supplementary_pdf_uses_text_layer() {
        let pdf = SupplementaryFile::new("Release Notes.PDF", one_page_pdf("Open Products first"));
        let text = pdf.text().unwrap();
        assert!(text.contains("Open Products first"), "{text:?}");

        let broken = SupplementaryFile::new("broken.pdf", b"not a pdf".to_vec());
        assert_eq!(broken.text(), None);
    }
}
