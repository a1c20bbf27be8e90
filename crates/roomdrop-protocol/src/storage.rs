//! Storage backend contract and adapters.
//!
//! The content-addressed store is an external collaborator. The coordinator
//! only sees [`StorageBackend`]: upload bytes and get a content identifier
//! back, download bytes by identifier. Upload progress is pushed through a
//! [`ProgressSink`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::integrity::sha256_content_id;

/// Errors surfaced by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("no content with id {0}")]
    NotFound(String),

    #[error("upload response carried no content identifier")]
    MissingContentId,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Upload progress channel. Only increasing percentages are forwarded.
#[derive(Debug)]
pub struct ProgressSink {
    tx: watch::Sender<u8>,
}

impl ProgressSink {
    /// A sink and the receiver observing it. Starts at 0.
    pub fn channel() -> (Self, watch::Receiver<u8>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx }, rx)
    }

    /// Report a percentage. Values above 100 are clamped; values not above
    /// the current one are ignored.
    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        self.tx.send_if_modified(|current| {
            if percent > *current {
                *current = percent;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> u8 {
        *self.tx.borrow()
    }
}

/// Content-addressed object store.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `data` and return its content identifier.
    async fn upload(&self, data: Vec<u8>, progress: &ProgressSink) -> Result<String, StorageError>;

    /// Fetch the bytes stored under `content_id`.
    async fn download(&self, content_id: &str) -> Result<Vec<u8>, StorageError>;
}

// ── Timeout wrapper ───────────────────────────────────────────────────

/// Bounds every call on the wrapped backend.
pub struct TimeoutStorage {
    inner: Arc<dyn StorageBackend>,
    timeout: Duration,
}

impl TimeoutStorage {
    pub fn new(inner: Arc<dyn StorageBackend>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait::async_trait]
impl StorageBackend for TimeoutStorage {
    async fn upload(&self, data: Vec<u8>, progress: &ProgressSink) -> Result<String, StorageError> {
        tokio::time::timeout(self.timeout, self.inner.upload(data, progress))
            .await
            .map_err(|_| StorageError::Timeout(self.timeout))?
    }

    async fn download(&self, content_id: &str) -> Result<Vec<u8>, StorageError> {
        tokio::time::timeout(self.timeout, self.inner.download(content_id))
            .await
            .map_err(|_| StorageError::Timeout(self.timeout))?
    }
}

// ── In-memory backend ─────────────────────────────────────────────────

/// Content-addressed in-process store. Identifiers are `sha256-<hex>`.
///
/// Shared between peers in tests and the simulator to stand in for a
/// public content network.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing_uploads: AtomicUsize,
    blank_ids: AtomicBool,
    stall: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` uploads fail.
    pub fn fail_next_uploads(&self, n: usize) {
        self.failing_uploads.store(n, Ordering::SeqCst);
    }

    /// Return an empty identifier from uploads, like a gateway whose
    /// response could not be parsed.
    pub fn set_blank_ids(&self, blank: bool) {
        self.blank_ids.store(blank, Ordering::SeqCst);
    }

    /// Make every call hang until the caller gives up.
    pub fn set_stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn content_id(data: &[u8]) -> String {
        sha256_content_id(data)
    }

    /// Replace the bytes stored under `content_id`, keeping the identifier.
    /// Stands in for a gateway serving corrupted content.
    pub fn overwrite(&self, content_id: &str, data: Vec<u8>) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(content_id.to_string(), data);
        }
    }

    fn take_failure(&self) -> bool {
        self.failing_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn maybe_stall(&self) {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryStorage {
    async fn upload(&self, data: Vec<u8>, progress: &ProgressSink) -> Result<String, StorageError> {
        self.maybe_stall().await;
        if self.take_failure() {
            return Err(StorageError::Backend("injected upload failure".into()));
        }

        for step in [25, 50, 75] {
            progress.report(step);
            tokio::task::yield_now().await;
        }

        let id = Self::content_id(&data);
        self.objects
            .lock()
            .map_err(|_| StorageError::Backend("object map poisoned".into()))?
            .insert(id.clone(), data);
        progress.report(100);

        if self.blank_ids.load(Ordering::SeqCst) {
            return Ok(String::new());
        }
        Ok(id)
    }

    async fn download(&self, content_id: &str) -> Result<Vec<u8>, StorageError> {
        self.maybe_stall().await;
        self.objects
            .lock()
            .map_err(|_| StorageError::Backend("object map poisoned".into()))?
            .get(content_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(content_id.to_string()))
    }
}

// ── HTTP gateway backend ──────────────────────────────────────────────

/// Adapter for an HTTP upload/gateway service.
///
/// `POST <base>/upload` with the raw body answers JSON carrying the content
/// identifier; `GET <base>/ipfs/<id>` serves the bytes.
#[derive(Debug, Clone)]
pub struct HttpStorage {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStorage {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Backend(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

/// Pull a content identifier out of an upload response.
///
/// Accepts `{"cid": ".."}`, `{"cid": {"/": ".."}}`, `{"Hash": ".."}` and
/// `{"data": {"cid": ".."}}`. Empty strings do not count.
pub fn parse_content_id(body: &serde_json::Value) -> Option<String> {
    let candidates = [
        body.get("cid"),
        body.get("cid").and_then(|c| c.get("/")),
        body.get("Hash"),
        body.get("data").and_then(|d| d.get("cid")),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait::async_trait]
impl StorageBackend for HttpStorage {
    async fn upload(&self, data: Vec<u8>, progress: &ProgressSink) -> Result<String, StorageError> {
        let url = format!("{}/upload", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Backend(format!("upload rejected: {status}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StorageError::Backend(format!("unreadable upload response: {e}")))?;
        let id = parse_content_id(&body).ok_or(StorageError::MissingContentId)?;
        progress.report(100);
        Ok(id)
    }

    async fn download(&self, content_id: &str) -> Result<Vec<u8>, StorageError> {
        let url = format!("{}/ipfs/{}", self.base_url, content_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        match response.status() {
            s if s.is_success() => {}
            reqwest::StatusCode::NOT_FOUND => {
                return Err(StorageError::NotFound(content_id.to_string()))
            }
            s => return Err(StorageError::Backend(format!("download rejected: {s}"))),
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_sink_is_monotonic() {
        let (sink, rx) = ProgressSink::channel();
        sink.report(40);
        sink.report(20);
        sink.report(250);
        assert_eq!(sink.current(), 100);
        assert_eq!(*rx.borrow(), 100);
    }

    #[tokio::test]
    async fn memory_roundtrip_and_progress() {
        let storage = MemoryStorage::new();
        let (sink, rx) = ProgressSink::channel();

        let id = storage.upload(b"hello".to_vec(), &sink).await.unwrap();
        assert_eq!(id, MemoryStorage::content_id(b"hello"));
        assert_eq!(*rx.borrow(), 100);
        assert_eq!(storage.download(&id).await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn memory_injected_failures_are_consumed() {
        let storage = MemoryStorage::new();
        storage.fail_next_uploads(1);
        let (sink, _rx) = ProgressSink::channel();

        assert!(storage.upload(b"a".to_vec(), &sink).await.is_err());
        assert!(storage.upload(b"b".to_vec(), &sink).await.is_ok());
    }

    #[tokio::test]
    async fn memory_unknown_id() {
        let storage = MemoryStorage::new();
        assert_eq!(
            storage.download("sha256-00").await,
            Err(StorageError::NotFound("sha256-00".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_wrapper_bounds_stalled_backend() {
        let inner = Arc::new(MemoryStorage::new());
        inner.set_stall(true);
        let storage = TimeoutStorage::new(inner, Duration::from_secs(15));

        let err = storage.download("sha256-00").await.unwrap_err();
        assert_eq!(err, StorageError::Timeout(Duration::from_secs(15)));
    }

    #[test]
    fn content_id_shapes() {
        let cases = [
            (serde_json::json!({"cid": "bafy1"}), Some("bafy1")),
            (serde_json::json!({"cid": {"/": "bafy2"}}), Some("bafy2")),
            (serde_json::json!({"Hash": "Qm3"}), Some("Qm3")),
            (serde_json::json!({"data": {"cid": "bafy4"}}), Some("bafy4")),
            (serde_json::json!({"cid": ""}), None),
            (serde_json::json!({"ok": true}), None),
        ];
        for (body, expected) in cases {
            assert_eq!(parse_content_id(&body).as_deref(), expected, "{body}");
        }
    }
}
