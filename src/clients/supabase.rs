//! Supabase adapter: Storage for screenshots and event logs, PostgREST for
//! templates and job records, and an RPC-backed similarity search.
//!
//! All requests carry the service-role key both as `apikey` and as a bearer
//! token, the way the Supabase gateway expects for server-side callers.
//! Timeouts are not set here; the pipeline bounds every call itself.

use super::{Embedder, ObjectEntry, ObjectStore, RelationalStore, SimilarityMatch, SimilarityService};
use crate::error::ClientError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Bucket the recorder uploads sessions into.
pub const DEFAULT_BUCKET: &str = "log_dataa";

/// Similarity RPC installed alongside the vector table.
pub const DEFAULT_MATCH_FUNCTION: &str = "match_jira_vectors";

/// Longest error body kept in a [`ClientError::Http`].
const MAX_ERROR_BODY: usize = 512;

/// Storage + PostgREST client for one Supabase project.
#[derive(Clone)]
pub struct SupabaseClient {
    http: Client,
    base_url: String,
    bucket: String,
}

impl std::fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl SupabaseClient {
    pub fn new(base_url: &str, service_key: &str, bucket: impl Into<String>) -> Result<Self, ClientError> {
        if base_url.trim().is_empty() {
            return Err(ClientError::Config("missing Supabase URL".into()));
        }
        if service_key.trim().is_empty() {
            return Err(ClientError::Config("missing Supabase service key".into()));
        }
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(service_key.trim())
            .map_err(|_| ClientError::Config("invalid Supabase service key".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", service_key.trim()))
            .map_err(|_| ClientError::Config("invalid Supabase service key".into()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        let http = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
        })
    }

    /// Reads `SUPABASE_URL`, `SUPABASE_SERVICE_ROLE_KEY` and optionally
    /// `SUPABASE_BUCKET`.
    pub fn from_env() -> Result<Self, ClientError> {
        let url = std::env::var("SUPABASE_URL")
            .map_err(|_| ClientError::Config("SUPABASE_URL is not set".into()))?;
        let key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| ClientError::Config("SUPABASE_SERVICE_ROLE_KEY is not set".into()))?;
        let bucket = std::env::var("SUPABASE_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.to_string());
        Self::new(&url, &key, bucket)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Public URL prefix for objects in this client's bucket.
    pub fn public_object_base(&self) -> String {
        format!("{}/storage/v1/object/public/{}", self.base_url, self.bucket)
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path)
    }

    /// Call a PostgREST function and return its decoded JSON result.
    pub async fn rpc(&self, function: &str, args: &Value) -> Result<Value, ClientError> {
        let resp = self
            .http
            .post(self.rest_url(&format!("rpc/{function}")))
            .json(args)
            .send()
            .await?;
        Ok(ensure_success(resp).await?.json().await?)
    }
}

/// Turn a non-2xx response into [`ClientError::Http`].
async fn ensure_success(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let mut body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(ClientError::Http {
        status: status.as_u16(),
        body,
    })
}

#[derive(Deserialize)]
struct StorageEntry {
    name: String,
}

#[async_trait]
impl ObjectStore for SupabaseClient {
    async fn list(&self, dir: &str) -> Result<Vec<ObjectEntry>, ClientError> {
        let url = format!("{}/storage/v1/object/list/{}", self.base_url, self.bucket);
        let body = json!({
            "prefix": dir.trim_end_matches('/'),
            "limit": 1000,
            "offset": 0,
            "sortBy": { "column": "name", "order": "asc" },
        });
        let resp = self.http.post(url).json(&body).send().await?;
        let entries: Vec<StorageEntry> = ensure_success(resp).await?.json().await?;
        debug!("Listed {} entries under {}", entries.len(), dir);
        Ok(entries
            .into_iter()
            .map(|e| ObjectEntry { name: e.name })
            .collect())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path);
        let resp = self.http.get(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::Missing(path.to_string()));
        }
        let bytes = ensure_success(resp).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl RelationalStore for SupabaseClient {
    async fn upsert(&self, table: &str, record: Value, conflict_key: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(self.rest_url(table))
            .query(&[("on_conflict", conflict_key)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&record)
            .send()
            .await?;
        ensure_success(resp).await?;
        Ok(())
    }

    async fn select(&self, table: &str, filters: &[(&str, &str)]) -> Result<Option<Value>, ClientError> {
        let mut query: Vec<(String, String)> = vec![("select".into(), "*".into())];
        query.extend(
            filters
                .iter()
                .map(|(col, val)| (col.to_string(), format!("eq.{val}"))),
        );
        query.push(("limit".into(), "1".into()));
        let resp = self.http.get(self.rest_url(table)).query(&query).send().await?;
        let rows: Vec<Value> = ensure_success(resp).await?.json().await?;
        Ok(rows.into_iter().next())
    }
}

// ── Similarity search ────────────────────────────────────────────────────

/// Similarity service backed by a PostgREST RPC over a vector table.
#[derive(Clone)]
pub struct VectorSearch {
    client: SupabaseClient,
    embedder: Arc<dyn Embedder>,
    function: String,
}

impl VectorSearch {
    pub fn new(client: SupabaseClient, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            client,
            embedder,
            function: DEFAULT_MATCH_FUNCTION.to_string(),
        }
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = function.into();
        self
    }
}

#[derive(Deserialize)]
struct MatchRow {
    issue_id: Value,
    #[serde(default)]
    text_data: Option<String>,
    #[serde(default)]
    score: Option<f32>,
}

fn parse_matches(rows: Value) -> Result<Vec<SimilarityMatch>, ClientError> {
    let rows: Vec<MatchRow> =
        serde_json::from_value(rows).map_err(|e| ClientError::Decode(format!("similarity rows: {e}")))?;
    Ok(rows
        .into_iter()
        .map(|row| SimilarityMatch {
            id: match row.issue_id {
                Value::String(s) => s,
                other => other.to_string(),
            },
            text: row.text_data.unwrap_or_default(),
            score: row.score.unwrap_or(0.0),
        })
        .collect())
}

#[async_trait]
impl SimilarityService for VectorSearch {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ClientError> {
        self.embedder.embed(text).await
    }

    async fn search(
        &self,
        vector: &[f32],
        owner_id: &str,
        integration_type: &str,
        top_k: usize,
    ) -> Result<Vec<SimilarityMatch>, ClientError> {
        let args = json!({
            "query_embedding": vector,
            "user_id": owner_id,
            "integration_type": integration_type,
            "top_k": top_k,
        });
        let rows = self.client.rpc(&self.function, &args).await?;
        parse_matches(rows)
    }
}
