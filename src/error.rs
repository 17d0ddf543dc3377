//! Error types for the edgequake-sopgen library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`JobError`]: **Fatal**: the job cannot finish (template missing, no
//!   usable screenshots, the generation engine refused or returned garbage).
//!   Every `JobError` raised inside a background run ends in exactly one
//!   `failed` status write.
//!
//! * [`FetchError`]: **Non-fatal**: a single object could not be
//!   downloaded. The Resource Fetcher logs it and excludes the object; the
//!   Lifecycle Manager decides whether the surviving set is still usable.
//!
//! * [`ClientError`]: what a collaborator (object store, relational store,
//!   generation engine, similarity service) reports. Pipeline stages wrap it
//!   into a `JobError::UpstreamFailure` naming the call that failed.

use crate::job::JobStatus;
use thiserror::Error;

/// All fatal errors surfaced by the job pipeline.
#[derive(Debug, Error)]
pub enum JobError {
    // ── Lookup errors ─────────────────────────────────────────────────────
    /// A template, job record, or required source file does not exist.
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Inputs were expected but none of them is usable.
    #[error("No usable input: {detail}")]
    EmptyInput { detail: String },

    // ── Upstream errors ───────────────────────────────────────────────────
    /// A store, engine, or embedding call failed.
    #[error("{service} call failed: {detail}")]
    UpstreamFailure { service: String, detail: String },

    /// A network call exceeded its configured bound.
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    // ── Output errors ─────────────────────────────────────────────────────
    /// The generation engine returned something that is not a usable JSON
    /// object, or a stored schema / record is malformed.
    #[error("Validation failed: {detail}")]
    ValidationFailure { detail: String },

    // ── Lifecycle errors ──────────────────────────────────────────────────
    /// The same job id is already running in this manager.
    #[error("Job '{job_id}' is already running")]
    Conflict { job_id: String },

    /// A status change that the job state machine forbids.
    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or request validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (local I/O, task panic).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn not_found(what: impl Into<String>) -> Self {
        JobError::NotFound { what: what.into() }
    }

    pub fn upstream(service: impl Into<String>, detail: impl ToString) -> Self {
        JobError::UpstreamFailure {
            service: service.into(),
            detail: detail.to_string(),
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        JobError::ValidationFailure {
            detail: detail.into(),
        }
    }

    /// Short machine-friendly label used in log lines and progress events.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::NotFound { .. } => "not_found",
            JobError::EmptyInput { .. } => "empty_input",
            JobError::UpstreamFailure { .. } => "upstream_failure",
            JobError::Timeout { .. } => "timeout",
            JobError::ValidationFailure { .. } => "validation_failure",
            JobError::Conflict { .. } => "conflict",
            JobError::InvalidTransition { .. } => "invalid_transition",
            JobError::InvalidConfig(_) => "invalid_config",
            JobError::Internal(_) => "internal",
        }
    }
}

/// A non-fatal error for a single remote object.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum FetchError {
    /// The object store refused or failed the download.
    #[error("Download of '{key}' failed: {detail}")]
    Download { key: String, detail: String },

    /// The download did not finish in time.
    #[error("Download of '{key}' timed out after {secs}s")]
    Timeout { key: String, secs: u64 },

    /// Bytes arrived but could not be written to local scratch space.
    #[error("Could not store '{key}' locally: {detail}")]
    Write { key: String, detail: String },
}

impl FetchError {
    pub fn key(&self) -> &str {
        match self {
            FetchError::Download { key, .. }
            | FetchError::Timeout { key, .. }
            | FetchError::Write { key, .. } => key,
        }
    }
}

/// Error reported by a collaborator client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The remote answered with a non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never produced a response (DNS, TLS, connection reset…).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response arrived but did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// The requested object does not exist.
    #[error("no such object: {0}")]
    Missing(String),

    /// Client-side setup problem (missing credentials, bad base URL).
    #[error("client misconfigured: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_display_names_service() {
        let e = JobError::upstream("generation engine", "HTTP 503: overloaded");
        let msg = e.to_string();
        assert!(msg.contains("generation engine"), "got: {msg}");
        assert!(msg.contains("503"), "got: {msg}");
        assert_eq!(e.kind(), "upstream_failure");
    }

    #[test]
    fn timeout_display() {
        let e = JobError::Timeout {
            operation: "template lookup".into(),
            secs: 15,
        };
        assert!(e.to_string().contains("15s"));
        assert!(e.to_string().contains("template lookup"));
    }

    #[test]
    fn invalid_transition_display() {
        let e = JobError::InvalidTransition {
            from: JobStatus::Failed,
            to: JobStatus::Success,
        };
        assert_eq!(e.to_string(), "Illegal status transition failed -> success");
    }

    #[test]
    fn fetch_error_exposes_key() {
        let e = FetchError::Timeout {
            key: "u1/j1/screenshots/a.png".into(),
            secs: 60,
        };
        assert_eq!(e.key(), "u1/j1/screenshots/a.png");
        assert!(e.to_string().contains("60s"));
    }

    #[test]
    fn client_error_display() {
        let e = ClientError::Http {
            status: 404,
            body: "Object not found".into(),
        };
        assert_eq!(e.to_string(), "HTTP 404: Object not found");
    }
}
