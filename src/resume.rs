//! Resumable transfer tracker: persisted per-item chunk state.
//!
//! Each tracked item gets a `ResumableState` record keyed by item identity,
//! holding the chunk plan and per-chunk completion flags. Records persist
//! through the key-value store as JSON upserts; without a store (or when the
//! store fails) the tracker degrades to in-memory-only operation.

use crate::chunk::{plan_chunks, ChunkSpec};
use crate::hashing::sha256_bytes;
use crate::item::unix_timestamp;
use crate::store::{BoxFuture, KeyValueStore};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

const KEY_PREFIX: &str = "resume/";

/// Metadata key that, when present on both sides, strengthens the resume
/// match beyond declared name + size.
pub const EXTERNAL_ID_KEY: &str = "external_id";

/// One chunk's persisted state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkState {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub uploaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl ChunkState {
    fn from_spec(spec: ChunkSpec) -> Self {
        Self {
            index: spec.index,
            start: spec.start,
            end: spec.end,
            uploaded: false,
            hash: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Persisted resume record for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumableState {
    pub item_key: String,
    pub file_name: String,
    pub file_size: u64,
    pub uploaded_bytes: u64,
    pub chunks: Vec<ChunkState>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ResumableState {
    pub fn is_complete(&self) -> bool {
        self.uploaded_bytes >= self.file_size
    }

    pub fn pending_chunks(&self) -> Vec<ChunkState> {
        self.chunks.iter().filter(|c| !c.uploaded).cloned().collect()
    }

    fn recompute_uploaded_bytes(&mut self) {
        self.uploaded_bytes = self
            .chunks
            .iter()
            .filter(|c| c.uploaded)
            .map(ChunkState::len)
            .sum();
    }
}

/// Uploads one chunk of an item; implemented by the host over its transport.
///
/// Returns the bytes that were sent when available so the tracker can hash
/// them for integrity verification.
pub trait ChunkUploader: Send + Sync + 'static {
    fn upload(
        &self,
        state: &ResumableState,
        chunk: ChunkState,
    ) -> BoxFuture<'static, Result<Option<Vec<u8>>>>;
}

/// Tracks and persists resumable transfer state.
pub struct ResumeTracker {
    chunk_size: u64,
    verify_chunks: bool,
    store: Option<Arc<dyn KeyValueStore>>,
    cache: Mutex<HashMap<String, ResumableState>>,
}

impl ResumeTracker {
    pub fn new(chunk_size: u64, verify_chunks: bool, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            chunk_size,
            verify_chunks,
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn storage_key(item_key: &str) -> String {
        format!("{}{}", KEY_PREFIX, item_key)
    }

    /// Start tracking an item: plan its chunks and persist the fresh record.
    pub async fn begin(
        &self,
        item_key: &str,
        file_name: &str,
        file_size: u64,
        metadata: HashMap<String, String>,
    ) -> ResumableState {
        let now = unix_timestamp();
        let state = ResumableState {
            item_key: item_key.to_string(),
            file_name: file_name.to_string(),
            file_size,
            uploaded_bytes: 0,
            chunks: plan_chunks(file_size, self.chunk_size)
                .into_iter()
                .map(ChunkState::from_spec)
                .collect(),
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.cache
            .lock()
            .unwrap()
            .insert(item_key.to_string(), state.clone());
        self.persist(&state).await;
        state
    }

    pub async fn get(&self, item_key: &str) -> Option<ResumableState> {
        if let Some(state) = self.cache.lock().unwrap().get(item_key).cloned() {
            return Some(state);
        }
        self.load_from_store(&Self::storage_key(item_key)).await
    }

    /// Find an incomplete record matching the declared name and size.
    ///
    /// Name + size alone can false-positive across distinct files; when both
    /// the caller and the stored record carry an `external_id`, it must also
    /// match. Callers wanting a strong identity always supply one.
    pub async fn can_resume(
        &self,
        file_name: &str,
        file_size: u64,
        external_id: Option<&str>,
    ) -> Option<ResumableState> {
        let matches = |s: &ResumableState| {
            if s.file_name != file_name || s.file_size != file_size || s.is_complete() {
                return false;
            }
            match (external_id, s.metadata.get(EXTERNAL_ID_KEY)) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        };

        if let Some(found) = self
            .cache
            .lock()
            .unwrap()
            .values()
            .find(|s| matches(s))
            .cloned()
        {
            return Some(found);
        }

        let store = self.store.as_ref()?;
        let keys = match store.keys(KEY_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("resume state scan failed: {}", e);
                return None;
            }
        };
        for key in keys {
            if let Some(state) = self.load_from_store(&key).await {
                if matches(&state) {
                    return Some(state);
                }
            }
        }
        None
    }

    /// Mark a chunk uploaded. Idempotent: re-marking an uploaded chunk is a
    /// no-op. Removes the record once all bytes are accounted for.
    pub async fn mark_uploaded(
        &self,
        item_key: &str,
        index: usize,
        hash: Option<String>,
    ) -> Result<ResumableState> {
        let mut state = self
            .get(item_key)
            .await
            .ok_or_else(|| anyhow!("no resume state for {}", item_key))?;
        let chunk = state
            .chunks
            .get_mut(index)
            .ok_or_else(|| anyhow!("chunk {} out of range for {}", index, item_key))?;
        if !chunk.uploaded {
            chunk.uploaded = true;
            chunk.hash = hash;
            state.recompute_uploaded_bytes();
            state.updated_at = unix_timestamp();
            if state.is_complete() {
                self.remove(item_key).await;
            } else {
                self.cache
                    .lock()
                    .unwrap()
                    .insert(item_key.to_string(), state.clone());
                self.persist(&state).await;
            }
        }
        Ok(state)
    }

    pub async fn remove(&self, item_key: &str) {
        self.cache.lock().unwrap().remove(item_key);
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&Self::storage_key(item_key)).await {
                tracing::warn!("resume state delete failed for {}: {}", item_key, e);
            }
        }
    }

    /// Drive every pending chunk through `uploader` with at most
    /// `parallelism` chunk uploads in flight. Chunk uploads are independent
    /// and idempotent; already-uploaded chunks are skipped. Hashes are
    /// recorded when verification is enabled and the uploader returns the
    /// sent bytes.
    pub async fn upload_chunks(
        &self,
        item_key: &str,
        uploader: Arc<dyn ChunkUploader>,
        parallelism: usize,
    ) -> Result<ResumableState> {
        let state = self
            .get(item_key)
            .await
            .ok_or_else(|| anyhow!("no resume state for {}", item_key))?;
        let parallelism = parallelism.max(1);
        let verify = self.verify_chunks;
        let mut pending = state.pending_chunks().into_iter();
        let mut join_set: JoinSet<(usize, Result<Option<String>>)> = JoinSet::new();
        let mut first_error: Option<anyhow::Error> = None;
        let mut latest = state.clone();

        loop {
            while first_error.is_none() && join_set.len() < parallelism {
                let Some(chunk) = pending.next() else { break };
                let index = chunk.index;
                let fut = uploader.upload(&state, chunk);
                join_set.spawn(async move {
                    let result = fut.await.map(|bytes| {
                        bytes.filter(|_| verify).map(|b| sha256_bytes(&b))
                    });
                    (index, result)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (index, result) = joined.map_err(|e| anyhow!("chunk task join: {}", e))?;
            match result {
                Ok(hash) => {
                    latest = self.mark_uploaded(item_key, index, hash).await?;
                }
                Err(e) => {
                    tracing::warn!("chunk {} of {} failed: {}", index, item_key, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(latest),
        }
    }

    async fn persist(&self, state: &ResumableState) {
        let Some(store) = &self.store else { return };
        let key = Self::storage_key(&state.item_key);
        match serde_json::to_string(state) {
            Ok(json) => {
                if let Err(e) = store.put(&key, &json).await {
                    tracing::warn!("resume state persist failed for {}: {}", state.item_key, e);
                }
            }
            Err(e) => tracing::warn!("resume state encode failed: {}", e),
        }
    }

    async fn load_from_store(&self, storage_key: &str) -> Option<ResumableState> {
        let store = self.store.as_ref()?;
        match store.get(storage_key).await {
            Ok(Some(json)) => match serde_json::from_str::<ResumableState>(&json) {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::warn!("resume state decode failed for {}: {}", storage_key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("resume state read failed for {}: {}", storage_key, e);
                None
            }
        }
    }
}
