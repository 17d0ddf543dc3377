//! Gemini adapter: Files API upload/delete, schema-constrained
//! `generateContent`, and `embedContent`.
//!
//! ## Why the Files API?
//!
//! A session PDF with dozens of full-resolution screenshots easily exceeds
//! the inline request size limit. Uploading once and referencing the file
//! URI keeps the generate request small, at the cost of an explicit delete
//! that the pipeline guarantees on every path.

use super::{Embedder, GenerationEngine, UploadHandle};
use crate::error::ClientError;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";

/// Polls of an uploaded file that is still `PROCESSING`.
const MAX_STATE_POLLS: usize = 60;
const STATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
    embedding_model: String,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ClientError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ClientError::Config("missing Gemini API key".into()));
        }
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.trim().to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
        })
    }

    /// Reads `GOOGLE_API_KEY` (or `GEMINI_API_KEY`), and optionally
    /// `GEMINI_MODEL` and `GEMINI_EMBEDDING_MODEL`.
    pub fn from_env() -> Result<Self, ClientError> {
        let key = std::env::var("GOOGLE_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .map_err(|_| ClientError::Config("GOOGLE_API_KEY is not set".into()))?;
        let mut client = Self::new(key)?;
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            client = client.with_model(model);
        }
        if let Ok(model) = std::env::var("GEMINI_EMBEDDING_MODEL") {
            client = client.with_embedding_model(model);
        }
        Ok(client)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn file_state(&self, name: &str) -> Result<Option<String>, ClientError> {
        let resp = self
            .http
            .get(format!("{}/v1beta/{}", self.base_url, name))
            .query(&[("key", &self.api_key)])
            .send()
            .await?;
        let file: FileResource = ensure_success(resp).await?.json().await?;
        Ok(file.state)
    }
}

async fn ensure_success(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(ClientError::Http {
        status: status.as_u16(),
        body: body.chars().take(512).collect(),
    })
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: FileResource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    name: String,
    uri: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// Concatenated text parts of the first candidate.
fn response_text(resp: GenerateResponse) -> Result<String, ClientError> {
    let Some(candidate) = resp.candidates.into_iter().next() else {
        let reason = resp
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates".to_string());
        return Err(ClientError::Decode(format!("engine returned no output: {reason}")));
    };
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "empty response".to_string());
        return Err(ClientError::Decode(format!("engine returned no text: {reason}")));
    }
    Ok(text)
}

fn generate_body(prompt: &str, schema: &Value, upload: &UploadHandle) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": prompt },
                { "file_data": { "file_uri": upload.uri, "mime_type": upload.mime_type } }
            ]
        }],
        "generationConfig": {
            "temperature": 0,
            "responseMimeType": "application/json",
            "responseSchema": schema
        }
    })
}

fn text_body(prompt: &str) -> Value {
    json!({
        "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        "generationConfig": { "temperature": 0 }
    })
}

// ── Trait impls ──────────────────────────────────────────────────────────

#[async_trait]
impl GenerationEngine for GeminiClient {
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str, display_name: &str) -> Result<UploadHandle, ClientError> {
        let start = self
            .http
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .query(&[("key", &self.api_key)])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .await?;
        let start = ensure_success(start).await?;
        let session = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ClientError::Decode("upload session URL missing".into()))?;

        let size = bytes.len();
        let resp = self
            .http
            .post(session)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(bytes)
            .send()
            .await?;
        let uploaded: UploadResponse = ensure_success(resp).await?.json().await?;
        debug!("Uploaded {} ({} bytes) as {}", display_name, size, uploaded.file.name);

        let file = uploaded.file;
        Ok(UploadHandle {
            mime_type: file.mime_type.unwrap_or_else(|| mime_type.to_string()),
            name: file.name,
            uri: file.uri,
        })
    }

    async fn generate(&self, prompt: &str, schema: &Value, upload: &UploadHandle) -> Result<String, ClientError> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let resp = self
            .http
            .post(url)
            .query(&[("key", &self.api_key)])
            .json(&generate_body(prompt, schema, upload))
            .send()
            .await?;
        let parsed: GenerateResponse = ensure_success(resp).await?.json().await?;
        response_text(parsed)
    }

    async fn wait_until_active(&self, upload: &UploadHandle) -> Result<(), ClientError> {
        for poll in 0..MAX_STATE_POLLS {
            if poll > 0 {
                tokio::time::sleep(STATE_POLL_INTERVAL).await;
            }
            match self.file_state(&upload.name).await?.as_deref() {
                Some("ACTIVE") | None => return Ok(()),
                Some("FAILED") => {
                    return Err(ClientError::Decode(format!("engine could not process {}", upload.name)))
                }
                Some(state) => debug!("{} is {}, polling again", upload.name, state),
            }
        }
        Err(ClientError::Decode(format!("{} never became active", upload.name)))
    }

    async fn complete(&self, prompt: &str) -> Result<String, ClientError> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let resp = self
            .http
            .post(url)
            .query(&[("key", &self.api_key)])
            .json(&text_body(prompt))
            .send()
            .await?;
        let parsed: GenerateResponse = ensure_success(resp).await?.json().await?;
        response_text(parsed)
    }

    async fn delete(&self, upload: &UploadHandle) -> Result<(), ClientError> {
        let resp = self
            .http
            .delete(format!("{}/v1beta/{}", self.base_url, upload.name))
            .query(&[("key", &self.api_key)])
            .send()
            .await?;
        ensure_success(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ClientError> {
        let url = format!(
            "{}/v1beta/models/{}:embedContent",
            self.base_url, self.embedding_model
        );
        let body = json!({
            "model": format!("models/{}", self.embedding_model),
            "content": { "parts": [{ "text": text }] }
        });
        let resp = self
            .http
            .post(url)
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await?;
        let parsed: EmbedResponse = ensure_success(resp).await?.json().await?;
        Ok(parsed.embedding.values)
    }
}
