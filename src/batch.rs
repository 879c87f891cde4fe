//! Memory-bounded batch loader for very large submissions.
//!
//! Submissions above `BATCH_THRESHOLD` files are sharded into fixed-size
//! batches held (and optionally persisted) here instead of flooding the
//! queue. The engine pulls one unprocessed batch at a time. Persistence
//! writes use bounded retry with backoff and disable themselves after
//! repeated failure instead of crashing.

use crate::item::TransferItem;
use crate::store::KeyValueStore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Submissions larger than this go through the loader.
pub const BATCH_THRESHOLD: usize = 100;

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BASE_DELAY: Duration = Duration::from_millis(50);
/// Consecutive failed persists before persistence turns itself off.
const PERSIST_FAILURE_LIMIT: u32 = 3;

struct LoaderState {
    batches: VecDeque<(u64, Vec<TransferItem>)>,
    next_seq: u64,
    pending_files: usize,
    pending_bytes: u64,
    consecutive_failures: u32,
    persistence_disabled: bool,
}

/// Shards large item sets into batches and tracks pending aggregates
/// separately from the main queue.
pub struct BatchLoader {
    batch_size: usize,
    store: Option<Arc<dyn KeyValueStore>>,
    state: Mutex<LoaderState>,
}

impl BatchLoader {
    pub fn new(batch_size: usize, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            store,
            state: Mutex::new(LoaderState {
                batches: VecDeque::new(),
                next_seq: 0,
                pending_files: 0,
                pending_bytes: 0,
                consecutive_failures: 0,
                persistence_disabled: false,
            }),
        }
    }

    pub fn pending_files(&self) -> usize {
        self.state.lock().unwrap().pending_files
    }

    pub fn pending_bytes(&self) -> u64 {
        self.state.lock().unwrap().pending_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().batches.is_empty()
    }

    /// Shard `items` into batches. Returns the number of batches created.
    pub async fn load(&self, items: Vec<TransferItem>) -> usize {
        if items.is_empty() {
            return 0;
        }
        let mut created = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.pending_files += items.len();
            state.pending_bytes += items.iter().map(|i| i.total_bytes).sum::<u64>();
            let mut items = items;
            while !items.is_empty() {
                let rest = items.split_off(items.len().min(self.batch_size));
                let seq = state.next_seq;
                state.next_seq += 1;
                state.batches.push_back((seq, items));
                created.push(seq);
                items = rest;
            }
        }
        for seq in &created {
            self.persist_batch(*seq).await;
        }
        created.len()
    }

    /// Pop the next unprocessed batch and drop its persisted record.
    pub async fn next_batch(&self) -> Option<Vec<TransferItem>> {
        let (seq, batch) = {
            let mut state = self.state.lock().unwrap();
            let (seq, batch) = state.batches.pop_front()?;
            state.pending_files = state.pending_files.saturating_sub(batch.len());
            let bytes: u64 = batch.iter().map(|i| i.total_bytes).sum();
            state.pending_bytes = state.pending_bytes.saturating_sub(bytes);
            (seq, batch)
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&Self::batch_key(seq)).await {
                tracing::warn!("batch record delete failed: {}", e);
            }
        }
        Some(batch)
    }

    fn batch_key(seq: u64) -> String {
        format!("batch/{}", seq)
    }

    /// Persist one batch with bounded retry. After repeated failures the
    /// loader keeps working in memory and stops trying to persist.
    async fn persist_batch(&self, seq: u64) {
        let Some(store) = &self.store else { return };
        if self.state.lock().unwrap().persistence_disabled {
            return;
        }
        let Some(json) = ({
            let state = self.state.lock().unwrap();
            state
                .batches
                .iter()
                .find(|(s, _)| *s == seq)
                .and_then(|(_, batch)| serde_json::to_string(batch).ok())
        }) else {
            return;
        };

        let key = Self::batch_key(seq);
        let mut attempt = 0u32;
        loop {
            match store.put(&key, &json).await {
                Ok(()) => {
                    self.state.lock().unwrap().consecutive_failures = 0;
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= PERSIST_ATTEMPTS {
                        tracing::warn!("batch persist failed after {} attempts: {}", attempt, e);
                        let mut state = self.state.lock().unwrap();
                        state.consecutive_failures += 1;
                        if state.consecutive_failures >= PERSIST_FAILURE_LIMIT {
                            state.persistence_disabled = true;
                            tracing::warn!("batch persistence disabled, continuing in memory");
                        }
                        return;
                    }
                    let delay = PERSIST_BASE_DELAY * (1 << (attempt - 1).min(8));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
