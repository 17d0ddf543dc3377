//! In-memory collaborators.
//!
//! Used by the test suites and by `sopgen run --dry-run`. Each double keeps
//! enough bookkeeping (peak concurrency, upload/delete counts, write log) to
//! assert the pipeline's resource guarantees from the outside.

use super::{
    Clients, GenerationEngine, ObjectEntry, ObjectStore, RelationalStore, SimilarityMatch,
    SimilarityService, UploadHandle,
};
use crate::error::ClientError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Object store ─────────────────────────────────────────────────────────

/// Flat key → bytes map with per-key failure injection.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    latency: Mutex<Duration>,
    list_fails: AtomicBool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    downloads: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        lock(&self.objects).insert(key.into(), bytes.into());
    }

    /// Make every download of `key` fail. The key still shows up in listings.
    pub fn fail_download(&self, key: impl Into<String>) {
        let key = key.into();
        lock(&self.objects).entry(key.clone()).or_default();
        lock(&self.failing).insert(key);
    }

    pub fn fail_listing(&self) {
        self.list_fails.store(true, Ordering::SeqCst);
    }

    /// Delay applied to every download, to make overlap observable.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Highest number of downloads that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, dir: &str) -> Result<Vec<ObjectEntry>, ClientError> {
        if self.list_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Http {
                status: 500,
                body: "listing unavailable".into(),
            });
        }
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let entries = lock(&self.objects)
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(|name| ObjectEntry {
                name: name.to_string(),
            })
            .collect();
        Ok(entries)
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.downloads.fetch_add(1, Ordering::SeqCst);

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if lock(&self.failing).contains(path) {
            return Err(ClientError::Http {
                status: 500,
                body: format!("injected failure for {path}"),
            });
        }
        lock(&self.objects)
            .get(path)
            .cloned()
            .ok_or_else(|| ClientError::Missing(path.to_string()))
    }
}

// ── Relational store ─────────────────────────────────────────────────────

/// Tables of JSON rows with merge-on-conflict upserts.
#[derive(Default)]
pub struct MemoryRelationalStore {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    writes: Mutex<Vec<(String, Value)>>,
    fail_when: Mutex<Vec<(String, String)>>,
    read_fails: AtomicBool,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row without going through `upsert`.
    pub fn insert(&self, table: impl Into<String>, row: Value) {
        lock(&self.tables).entry(table.into()).or_default().push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    /// Every upserted record for `table`, in write order.
    pub fn writes(&self, table: &str) -> Vec<Value> {
        lock(&self.writes)
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Reject any upsert whose `column` equals `value`.
    pub fn fail_upsert_when(&self, column: impl Into<String>, value: impl Into<String>) {
        lock(&self.fail_when).push((column.into(), value.into()));
    }

    pub fn fail_reads(&self) {
        self.read_fails.store(true, Ordering::SeqCst);
    }
}

fn column_matches(row: &Value, column: &str, expected: &str) -> bool {
    match row.get(column) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Null) | None => false,
        Some(other) => other.to_string() == expected,
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn upsert(&self, table: &str, record: Value, conflict_key: &str) -> Result<(), ClientError> {
        let incoming = record
            .as_object()
            .cloned()
            .ok_or_else(|| ClientError::Decode("upsert record must be an object".into()))?;
        if lock(&self.fail_when)
            .iter()
            .any(|(col, val)| column_matches(&record, col, val))
        {
            return Err(ClientError::Http {
                status: 503,
                body: "injected write failure".into(),
            });
        }
        let key = incoming
            .get(conflict_key)
            .cloned()
            .ok_or_else(|| ClientError::Decode(format!("record lacks conflict key '{conflict_key}'")))?;

        lock(&self.writes).push((table.to_string(), record.clone()));
        let mut tables = lock(&self.tables);
        let rows = tables.entry(table.to_string()).or_default();
        match rows
            .iter_mut()
            .find(|row| row.get(conflict_key) == Some(&key))
            .and_then(Value::as_object_mut)
        {
            Some(existing) => existing.extend(incoming),
            None => rows.push(Value::Object(incoming)),
        }
        Ok(())
    }

    async fn select(&self, table: &str, filters: &[(&str, &str)]) -> Result<Option<Value>, ClientError> {
        if self.read_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("connection refused".into()));
        }
        Ok(lock(&self.tables).get(table).and_then(|rows| {
            rows.iter()
                .find(|row| filters.iter().all(|(c, v)| column_matches(row, c, v)))
                .cloned()
        }))
    }
}

// ── Generation engine ────────────────────────────────────────────────────

/// Engine that answers every generate call with a fixed reply.
pub struct MemoryGenerationEngine {
    reply: Mutex<String>,
    latency: Mutex<Duration>,
    generate_error: Mutex<Option<String>>,
    upload_fails: AtomicBool,
    activation_delay: Mutex<Duration>,
    activation_fails: AtomicBool,
    generate_panics: AtomicBool,
    text_reply: Mutex<String>,
    live: Mutex<HashMap<String, Vec<u8>>>,
    next_id: AtomicUsize,
    deleted: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
    last_upload: Mutex<Option<Vec<u8>>>,
}

impl MemoryGenerationEngine {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: Mutex::new(reply.into()),
            latency: Mutex::new(Duration::ZERO),
            generate_error: Mutex::new(None),
            upload_fails: AtomicBool::new(false),
            activation_delay: Mutex::new(Duration::ZERO),
            activation_fails: AtomicBool::new(false),
            generate_panics: AtomicBool::new(false),
            text_reply: Mutex::new(String::new()),
            live: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
            last_upload: Mutex::new(None),
        }
    }

    pub fn set_reply(&self, reply: impl Into<String>) {
        *lock(&self.reply) = reply.into();
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn fail_generation(&self, detail: impl Into<String>) {
        *lock(&self.generate_error) = Some(detail.into());
    }

    pub fn fail_uploads(&self) {
        self.upload_fails.store(true, Ordering::SeqCst);
    }

    /// Uploads succeed but take `delay` to become usable.
    pub fn set_activation_delay(&self, delay: Duration) {
        *lock(&self.activation_delay) = delay;
    }

    /// Uploads succeed but never become usable.
    pub fn fail_activation(&self) {
        self.activation_fails.store(true, Ordering::SeqCst);
    }

    /// The next generate calls panic instead of replying.
    pub fn panic_on_generate(&self) {
        self.generate_panics.store(true, Ordering::SeqCst);
    }

    /// Reply for text-only completions.
    pub fn set_text_reply(&self, reply: impl Into<String>) {
        *lock(&self.text_reply) = reply.into();
    }

    /// Uploads that were never deleted.
    pub fn live_uploads(&self) -> usize {
        lock(&self.live).len()
    }

    pub fn upload_count(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        lock(&self.last_prompt).clone()
    }

    pub fn last_upload(&self) -> Option<Vec<u8>> {
        lock(&self.last_upload).clone()
    }
}

#[async_trait]
impl GenerationEngine for MemoryGenerationEngine {
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str, display_name: &str) -> Result<UploadHandle, ClientError> {
        if self.upload_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Http {
                status: 413,
                body: "upload rejected".into(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("files/{display_name}-{id}");
        *lock(&self.last_upload) = Some(bytes.clone());
        lock(&self.live).insert(name.clone(), bytes);
        Ok(UploadHandle {
            uri: format!("memory://{name}"),
            name,
            mime_type: mime_type.to_string(),
        })
    }

    async fn wait_until_active(&self, upload: &UploadHandle) -> Result<(), ClientError> {
        let delay = *lock(&self.activation_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.activation_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Decode(format!("engine could not process {}", upload.name)));
        }
        Ok(())
    }

    async fn generate(&self, prompt: &str, _schema: &Value, upload: &UploadHandle) -> Result<String, ClientError> {
        *lock(&self.last_prompt) = Some(prompt.to_string());
        if self.generate_panics.load(Ordering::SeqCst) {
            panic!("generation engine double asked to panic");
        }
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !lock(&self.live).contains_key(&upload.name) {
            return Err(ClientError::Missing(upload.name.clone()));
        }
        if let Some(detail) = lock(&self.generate_error).clone() {
            return Err(ClientError::Http {
                status: 500,
                body: detail,
            });
        }
        Ok(lock(&self.reply).clone())
    }

    async fn complete(&self, prompt: &str) -> Result<String, ClientError> {
        *lock(&self.last_prompt) = Some(prompt.to_string());
        if let Some(detail) = lock(&self.generate_error).clone() {
            return Err(ClientError::Http {
                status: 500,
                body: detail,
            });
        }
        Ok(lock(&self.text_reply).clone())
    }

    async fn delete(&self, upload: &UploadHandle) -> Result<(), ClientError> {
        match lock(&self.live).remove(&upload.name) {
            Some(_) => {
                self.deleted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ClientError::Missing(upload.name.clone())),
        }
    }
}

// ── Similarity service ───────────────────────────────────────────────────

/// Returns a fixed match list, or fails every call.
#[derive(Default)]
pub struct MemorySimilarityService {
    matches: Vec<SimilarityMatch>,
    failure: Option<String>,
    searches: Mutex<Vec<(String, String, usize)>>,
}

impl MemorySimilarityService {
    pub fn new(matches: Vec<SimilarityMatch>) -> Self {
        Self {
            matches,
            ..Self::default()
        }
    }

    pub fn failing(detail: impl Into<String>) -> Self {
        Self {
            failure: Some(detail.into()),
            ..Self::default()
        }
    }

    /// `(owner, integration_type, top_k)` of every search, in call order.
    pub fn searches(&self) -> Vec<(String, String, usize)> {
        lock(&self.searches).clone()
    }
}

#[async_trait]
impl SimilarityService for MemorySimilarityService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ClientError> {
        if let Some(detail) = &self.failure {
            return Err(ClientError::Transport(detail.clone()));
        }
        Ok(vec![text.len() as f32, 1.0, 0.0])
    }

    async fn search(
        &self,
        _vector: &[f32],
        owner_id: &str,
        integration_type: &str,
        top_k: usize,
    ) -> Result<Vec<SimilarityMatch>, ClientError> {
        lock(&self.searches).push((owner_id.to_string(), integration_type.to_string(), top_k));
        if let Some(detail) = &self.failure {
            return Err(ClientError::Transport(detail.clone()));
        }
        Ok(self.matches.iter().take(top_k).cloned().collect())
    }
}

// ── Bundle ───────────────────────────────────────────────────────────────

/// All four doubles, with typed handles kept for assertions.
#[derive(Clone)]
pub struct MemoryBackend {
    pub objects: Arc<MemoryObjectStore>,
    pub records: Arc<MemoryRelationalStore>,
    pub engine: Arc<MemoryGenerationEngine>,
    pub similarity: Arc<MemorySimilarityService>,
}

impl MemoryBackend {
    pub fn new(reply: impl Into<String>, similarity: MemorySimilarityService) -> Self {
        Self {
            objects: Arc::new(MemoryObjectStore::new()),
            records: Arc::new(MemoryRelationalStore::new()),
            engine: Arc::new(MemoryGenerationEngine::new(reply)),
            similarity: Arc::new(similarity),
        }
    }

    pub fn clients(&self) -> Clients {
        Clients::new(
            self.objects.clone(),
            self.records.clone(),
            self.engine.clone(),
            self.similarity.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn listing_returns_direct_children_only() {
        let store = MemoryObjectStore::new();
        store.insert("u1/j1/screenshots/a.png", b"a".to_vec());
        store.insert("u1/j1/screenshots/b.png", b"b".to_vec());
        store.insert("u1/j1/screenshots/nested/c.png", b"c".to_vec());
        store.insert("u1/j1/json/events.json", b"[]".to_vec());
        let names: Vec<String> = store
            .list("u1/j1/screenshots")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
    }

    #[tokio::test]
    async fn upsert_merges_on_conflict_key() {
        let store = MemoryRelationalStore::new();
        store
            .upsert("docs", json!({"id": "j1", "status": "queued", "created_at": "t0"}), "id")
            .await
            .unwrap();
        store
            .upsert("docs", json!({"id": "j1", "status": "pending"}), "id")
            .await
            .unwrap();
        let rows = store.rows("docs");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "pending");
        assert_eq!(rows[0]["created_at"], "t0");
        assert_eq!(store.writes("docs").len(), 2);
    }

    #[tokio::test]
    async fn select_requires_every_filter() {
        let store = MemoryRelationalStore::new();
        store.insert("templates", json!({"id": "t1", "user_id": "u1"}));
        assert!(store
            .select("templates", &[("id", "t1"), ("user_id", "u1")])
            .await
            .unwrap()
            .is_some());
        assert!(store
            .select("templates", &[("id", "t1"), ("user_id", "u2")])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn engine_tracks_live_uploads() {
        let engine = MemoryGenerationEngine::new("{}");
        let h = engine.upload(b"%PDF".to_vec(), "application/pdf", "doc").await.unwrap();
        assert_eq!(engine.live_uploads(), 1);
        assert_eq!(engine.generate("p", &json!({}), &h).await.unwrap(), "{}");
        engine.delete(&h).await.unwrap();
        assert_eq!(engine.live_uploads(), 0);
        assert!(engine.delete(&h).await.is_err());
        assert_eq!(engine.deleted_count(), 1);
    }
}
