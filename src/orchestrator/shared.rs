//! Engine internals: the state shared by the public handle and every
//! background task (admission loop, connectivity watcher, periodic timers,
//! per-transfer drivers).
//!
//! Background tasks hold `Weak<Shared>` so dropping the last engine handle
//! tears everything down. The state mutex is never held across an await.

use super::order;
use super::state::{ActiveTransfer, DelayedRetry, EngineEvent, EngineState, EngineStats};
use crate::batch::BatchLoader;
use crate::config::EngineConfig;
use crate::error::{TransferError, TransferErrorKind};
use crate::health::{self, HealthSnapshot};
use crate::item::{unix_timestamp, ItemId, TransferItem, TransferStatus};
use crate::network::NetworkMonitor;
use crate::plugin::{HookKind, PluginBus, PluginEvent};
use crate::resume::ResumeTracker;
use crate::store::KeyValueStore;
use crate::throttle::BandwidthThrottle;
use crate::timer::TimerArena;
use crate::transport::{HandleCommand, HandleControl, TransferEvent, Transport};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;

/// How often the admission loop re-checks when nothing woke it. Covers
/// conditions with no wakeup of their own (throttle headroom opening up).
const ADMIT_POLL: Duration = Duration::from_millis(500);
const STUCK_SCAN_PERIOD: Duration = Duration::from_secs(60);
const ADAPT_PERIOD: Duration = Duration::from_secs(5);
const HEALTH_LOG_PERIOD: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 256;

pub(super) struct Shared {
    pub cfg: EngineConfig,
    pub transport: Arc<dyn Transport>,
    pub monitor: Arc<NetworkMonitor>,
    pub throttle: Arc<BandwidthThrottle>,
    pub tracker: Arc<ResumeTracker>,
    pub plugins: Arc<PluginBus>,
    pub loader: BatchLoader,
    pub state: Mutex<EngineState>,
    pub admit: Notify,
    pub events_tx: broadcast::Sender<EngineEvent>,
    pub timers: TimerArena,
    pub next_id: AtomicU64,
    pub stuck: Mutex<Vec<ItemId>>,
    pub closed: AtomicBool,
}

impl Shared {
    /// Build the shared core and spawn its background tasks. Must run
    /// inside a Tokio runtime.
    pub fn spawn(
        cfg: EngineConfig,
        transport: Arc<dyn Transport>,
        monitor: Arc<NetworkMonitor>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Arc<Self> {
        let throttle = Arc::new(BandwidthThrottle::new(
            cfg.bandwidth_limit,
            cfg.adaptive_bandwidth,
        ));
        let tracker = Arc::new(ResumeTracker::new(
            cfg.chunk_size,
            cfg.verify_chunks,
            store.clone(),
        ));
        let loader = BatchLoader::new(cfg.memory_batch_size, store);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Self {
            cfg,
            transport,
            monitor,
            throttle,
            tracker,
            plugins: Arc::new(PluginBus::new()),
            loader,
            state: Mutex::new(EngineState::new()),
            admit: Notify::new(),
            events_tx,
            timers: TimerArena::new(),
            next_id: AtomicU64::new(1),
            stuck: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        Self::spawn_admission(&shared);
        Self::spawn_connectivity_watch(&shared);
        shared.spawn_timers();
        shared
    }

    pub fn allocate_id(&self) -> ItemId {
        ItemId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn emit_event(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Publish a status change to observers and to plugins declaring the
    /// status-change hook.
    async fn emit_status(&self, id: ItemId, status: TransferStatus) {
        self.emit_event(EngineEvent::StatusChanged { id, status });
        self.plugins
            .emit(PluginEvent::new(HookKind::StatusChange).detail(json!({
                "id": id.to_string(),
                "status": status.as_str(),
            })))
            .await;
    }

    async fn emit_state_change(&self) {
        let (processing, paused) = {
            let st = self.state.lock().unwrap();
            (st.processing, st.paused)
        };
        self.emit_event(EngineEvent::StateChanged { processing, paused });
        self.plugins
            .emit(PluginEvent::new(HookKind::ManagerStateChange).detail(json!({
                "processing": processing,
                "paused": paused,
            })))
            .await;
    }

    // --- background tasks ---

    fn spawn_admission(shared: &Arc<Self>) {
        let weak = Arc::downgrade(shared);
        tokio::spawn(async move {
            loop {
                let Some(shared) = weak.upgrade() else { break };
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                let started = shared.admit_ready().await;
                if started == 0 {
                    tokio::select! {
                        _ = shared.admit.notified() => {}
                        _ = tokio::time::sleep(ADMIT_POLL) => {}
                    }
                }
            }
        });
    }

    fn spawn_connectivity_watch(shared: &Arc<Self>) {
        let weak = Arc::downgrade(shared);
        let mut rx = shared.monitor.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow();
                let Some(shared) = weak.upgrade() else { break };
                if online {
                    tracing::info!("back online, resuming transfers");
                    shared.set_paused(false).await;
                } else {
                    tracing::warn!("offline, pausing transfers");
                    shared.set_paused(true).await;
                }
            }
        });
    }

    fn spawn_timers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.timers
            .spawn_periodic("stuck-scan", STUCK_SCAN_PERIOD, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.scan_stuck();
                }
            });
        if self.cfg.adaptive_bandwidth {
            let weak = Arc::downgrade(self);
            self.timers
                .spawn_periodic("throttle-adapt", ADAPT_PERIOD, move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.throttle.maybe_adapt();
                    }
                });
        }
        let weak = Arc::downgrade(self);
        self.timers
            .spawn_periodic("health-log", HEALTH_LOG_PERIOD, move || {
                if let Some(shared) = weak.upgrade() {
                    let snap = shared.health();
                    if !snap.healthy() {
                        tracing::warn!(issues = ?snap.issues, "engine unhealthy");
                    }
                }
            });
    }

    fn scan_stuck(&self) {
        let threshold = self.cfg.stuck_threshold.as_secs() as i64;
        let now = unix_timestamp();
        let stuck: Vec<ItemId> = {
            let st = self.state.lock().unwrap();
            st.active
                .values()
                .filter(|e| {
                    !e.paused && e.item.started_at.map_or(false, |t| now - t > threshold)
                })
                .map(|e| e.item.id)
                .collect()
        };
        // Flag only; a stuck transfer is never cancelled automatically.
        if !stuck.is_empty() {
            tracing::warn!(count = stuck.len(), "transfers exceeded the stuck threshold");
        }
        *self.stuck.lock().unwrap() = stuck;
    }

    pub fn health(&self) -> HealthSnapshot {
        let stuck = self.stuck.lock().unwrap().clone();
        health::snapshot(&self.monitor, &self.throttle, &stuck)
    }

    // --- admission ---

    async fn admit_ready(self: &Arc<Self>) -> usize {
        {
            let mut st = self.state.lock().unwrap();
            // Delayed retries whose delay elapsed re-enter at the queue front.
            let now = Instant::now();
            let mut i = 0;
            while i < st.delayed.len() {
                if st.delayed[i].ready_at <= now {
                    let d = st.delayed.remove(i);
                    st.queue.push_front(d.item);
                } else {
                    i += 1;
                }
            }
            if !st.processing || st.paused {
                return 0;
            }
        }
        if !self.monitor.is_online() {
            return 0;
        }
        // Refill from the batch loader once the queue drains.
        if self.state.lock().unwrap().queue.is_empty() && !self.loader.is_empty() {
            if let Some(batch) = self.loader.next_batch().await {
                tracing::debug!(files = batch.len(), "pulled next batch into the queue");
                self.state.lock().unwrap().queue.extend(batch);
            }
        }
        if !self.throttle.is_within_limits() {
            return 0;
        }
        let (queued, slots) = {
            let st = self.state.lock().unwrap();
            if !st.processing || st.paused {
                return 0;
            }
            let slots = self.cfg.max_concurrent_uploads.saturating_sub(st.active.len());
            if slots == 0 || st.queue.is_empty() {
                return 0;
            }
            (st.queue.len(), slots)
        };
        self.plugins
            .emit(
                PluginEvent::new(HookKind::QueuePreProcess)
                    .detail(json!({ "queued": queued, "slots": slots })),
            )
            .await;
        // Selection, handle creation and the active-set insert happen under
        // one lock: an item is never outside every collection, and a stop()
        // or pause() landing during the hook dispatch above is honored here.
        // Transport::begin must be cheap, per its contract.
        let (admitted, refused) = {
            let mut st = self.state.lock().unwrap();
            if !st.processing || st.paused {
                return 0;
            }
            let slots = self.cfg.max_concurrent_uploads.saturating_sub(st.active.len());
            if slots == 0 {
                return 0;
            }
            let selected = order::select_next(&mut st.queue, slots, self.cfg.smart_scheduling);
            let mut admitted = Vec::new();
            let mut refused = Vec::new();
            for mut item in selected {
                item.status = TransferStatus::Uploading;
                item.started_at = Some(unix_timestamp());
                match self.transport.begin(&item) {
                    Ok(handle) => {
                        let (control, events) = handle.split();
                        st.active.insert(
                            item.id,
                            ActiveTransfer {
                                item: item.clone(),
                                control,
                                paused: false,
                                cancelled: false,
                            },
                        );
                        admitted.push((item, events));
                    }
                    Err(e) => refused.push((item, e)),
                }
            }
            (admitted, refused)
        };
        let started = admitted.len();
        for (item, events) in admitted {
            if item.total_bytes > 0 {
                let key = item.id.to_string();
                if self.tracker.get(&key).await.is_none() {
                    self.tracker
                        .begin(&key, &item.file_name, item.total_bytes, item.metadata.clone())
                        .await;
                }
            }
            let id = item.id;
            self.emit_status(id, TransferStatus::Uploading).await;
            self.plugins
                .emit(PluginEvent::with_item(HookKind::UploadStart, item))
                .await;
            let weak = Arc::downgrade(self);
            tokio::spawn(drive(weak, id, events));
        }
        for (item, e) in refused {
            tracing::warn!(id = %item.id, "transport refused transfer: {}", e);
            let error = TransferError::new(TransferErrorKind::Internal, e.to_string());
            self.fail_or_retry(item, error).await;
        }
        if started > 0 {
            self.plugins
                .emit(
                    PluginEvent::new(HookKind::QueuePostProcess)
                        .detail(json!({ "admitted": started })),
                )
                .await;
        }
        started
    }

    // --- transfer event handlers ---

    async fn on_progress(self: &Arc<Self>, id: ItemId, bytes: u64) {
        let (prev, next, item) = {
            let mut st = self.state.lock().unwrap();
            let Some(entry) = st.active.get_mut(&id) else { return };
            if entry.cancelled {
                return;
            }
            let prev = entry.item.bytes_transferred;
            // Progress never regresses, even from an out-of-order transport.
            let next = bytes.max(prev);
            entry.item.bytes_transferred = next;
            (prev, next, entry.item.clone())
        };
        let delta = next - prev;
        if delta == 0 {
            return;
        }
        self.throttle.record(delta);
        self.record_chunk_progress(&item, prev, next).await;
        self.emit_event(EngineEvent::Progress {
            id,
            bytes_transferred: next,
            total_bytes: item.total_bytes,
        });
        self.plugins
            .emit(
                PluginEvent::with_item(HookKind::UploadProgress, item)
                    .detail(json!({ "bytes_transferred": next })),
            )
            .await;
    }

    /// Mark chunks fully covered by the new byte count in the resume ledger.
    async fn record_chunk_progress(&self, item: &TransferItem, prev: u64, next: u64) {
        if item.total_bytes == 0 {
            return;
        }
        let chunk = self.cfg.chunk_size;
        let covered = |bytes: u64| -> u64 {
            if bytes >= item.total_bytes {
                item.total_bytes.div_ceil(chunk)
            } else {
                bytes / chunk
            }
        };
        let key = item.id.to_string();
        for index in covered(prev)..covered(next) {
            if let Err(e) = self.tracker.mark_uploaded(&key, index as usize, None).await {
                tracing::debug!(id = %item.id, "chunk ledger update skipped: {}", e);
                break;
            }
        }
    }

    async fn on_completed(self: &Arc<Self>, id: ItemId, location: String) {
        let item = {
            let mut st = self.state.lock().unwrap();
            let Some(entry) = st.active.remove(&id) else { return };
            if entry.cancelled {
                return;
            }
            let mut item = entry.item;
            item.status = TransferStatus::Completed;
            item.bytes_transferred = item.total_bytes;
            item.completed_at = Some(unix_timestamp());
            item.location = Some(location.clone());
            item.last_error = None;
            st.succeeded_files += 1;
            st.completed.push(item.clone());
            item
        };
        tracing::info!(id = %id, file = %item.file_name, "transfer completed");
        self.tracker.remove(&id.to_string()).await;
        self.emit_event(EngineEvent::Completed { id, location });
        self.plugins
            .emit(PluginEvent::with_item(HookKind::UploadComplete, item))
            .await;
        self.admit.notify_one();
    }

    async fn on_failed(self: &Arc<Self>, id: ItemId, error: TransferError) {
        let item = {
            let mut st = self.state.lock().unwrap();
            let Some(entry) = st.active.remove(&id) else { return };
            if entry.cancelled {
                return;
            }
            entry.item
        };
        self.fail_or_retry(item, error).await;
        self.admit.notify_one();
    }

    pub async fn fail_or_retry(self: &Arc<Self>, mut item: TransferItem, error: TransferError) {
        item.attempts += 1;
        item.last_error = Some(error.to_string());
        if self.monitor.should_retry(item.attempts, error.kind) {
            let delay = self.monitor.retry_delay(item.attempts);
            tracing::info!(
                id = %item.id,
                attempt = item.attempts,
                delay_ms = delay.as_millis() as u64,
                "transfer failed, retry scheduled: {}",
                error
            );
            let id = item.id;
            let attempt = item.attempts;
            item.status = TransferStatus::Queued;
            self.state
                .lock()
                .unwrap()
                .delayed
                .push(DelayedRetry {
                    ready_at: Instant::now() + delay,
                    item,
                });
            self.emit_event(EngineEvent::RetryScheduled { id, attempt, delay });
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(shared) = weak.upgrade() {
                    shared.admit.notify_one();
                }
            });
        } else {
            tracing::warn!(
                id = %item.id,
                attempts = item.attempts,
                "transfer failed permanently: {}",
                error
            );
            item.status = TransferStatus::Failed;
            {
                let mut st = self.state.lock().unwrap();
                st.failed_files += 1;
                st.failed.push(item.clone());
            }
            self.emit_event(EngineEvent::Failed {
                id: item.id,
                error: error.clone(),
            });
            self.plugins
                .emit(
                    PluginEvent::with_item(HookKind::UploadError, item).detail(json!({
                        "kind": error.kind.as_str(),
                        "message": error.message,
                    })),
                )
                .await;
        }
    }

    // --- control operations ---

    pub async fn set_processing(&self, processing: bool) -> bool {
        let changed = {
            let mut st = self.state.lock().unwrap();
            if st.processing == processing {
                false
            } else {
                st.processing = processing;
                true
            }
        };
        if changed {
            self.emit_state_change().await;
        }
        if processing {
            self.admit.notify_one();
        }
        changed
    }

    pub async fn set_paused(&self, paused: bool) {
        let (changed, signals, status_changes) = {
            let mut st = self.state.lock().unwrap();
            if st.paused == paused {
                (false, Vec::new(), Vec::new())
            } else {
                st.paused = paused;
                let mut signals = Vec::new();
                let mut status_changes = Vec::new();
                for entry in st.active.values_mut() {
                    if entry.cancelled {
                        continue;
                    }
                    if paused && !entry.paused {
                        entry.paused = true;
                        if entry.item.status.can_transition(TransferStatus::Paused) {
                            entry.item.status = TransferStatus::Paused;
                            status_changes.push((entry.item.id, TransferStatus::Paused));
                        }
                        signals.push((entry.control.clone(), HandleCommand::Pause));
                    } else if !paused && entry.paused {
                        entry.paused = false;
                        if entry.item.status.can_transition(TransferStatus::Uploading) {
                            entry.item.status = TransferStatus::Uploading;
                            status_changes.push((entry.item.id, TransferStatus::Uploading));
                        }
                        signals.push((entry.control.clone(), HandleCommand::Resume));
                    }
                }
                (true, signals, status_changes)
            }
        };
        if !changed {
            return;
        }
        for (control, cmd) in signals {
            control.send(cmd);
        }
        for (id, status) in status_changes {
            self.emit_status(id, status).await;
        }
        self.emit_state_change().await;
        if !paused {
            self.admit.notify_one();
        }
    }

    /// Stop processing: cancel every active handle exactly once and requeue
    /// the active items. The queue itself is kept.
    pub async fn halt(&self) {
        let mut cancels = Vec::new();
        let changed;
        {
            let mut st = self.state.lock().unwrap();
            changed = st.processing || st.paused || !st.active.is_empty();
            st.processing = false;
            st.paused = false;
            let drained: Vec<ActiveTransfer> = st.active.drain().map(|(_, e)| e).collect();
            let mut requeue = Vec::new();
            for mut entry in drained {
                if !entry.cancelled {
                    entry.cancelled = true;
                    cancels.push(entry.control.clone());
                }
                let mut item = entry.item;
                if item.status.can_transition(TransferStatus::Queued) {
                    item.status = TransferStatus::Queued;
                }
                requeue.push(item);
            }
            for item in requeue.into_iter().rev() {
                st.queue.push_front(item);
            }
        }
        for control in &cancels {
            control.cancel();
        }
        if changed {
            tracing::info!(cancelled = cancels.len(), "queue processing stopped");
            self.emit_state_change().await;
        }
    }

    pub async fn retry_failed(&self) -> usize {
        let (n, ids) = {
            let mut st = self.state.lock().unwrap();
            let drained: Vec<TransferItem> = st.failed.drain(..).collect();
            let n = drained.len();
            st.failed_files = st.failed_files.saturating_sub(n as u64);
            let mut ids = Vec::with_capacity(n);
            for mut item in drained {
                item.status = TransferStatus::Queued;
                item.attempts = 0;
                item.last_error = None;
                item.bytes_transferred = 0;
                item.started_at = None;
                ids.push(item.id);
                st.queue.push_back(item);
            }
            (n, ids)
        };
        if n > 0 {
            tracing::info!(count = n, "failed transfers requeued");
            for id in ids {
                self.emit_status(id, TransferStatus::Queued).await;
            }
            self.admit.notify_one();
        }
        n
    }

    /// Remove an item wherever it currently lives. Never fails: remote
    /// cleanup problems are logged and the record still goes away.
    pub async fn remove(&self, id: ItemId) -> bool {
        let mut cancel: Option<HandleControl> = None;
        let mut stored_location: Option<String> = None;
        let found = {
            let mut st = self.state.lock().unwrap();
            if let Some(pos) = st.queue.iter().position(|i| i.id == id) {
                st.queue.remove(pos);
                true
            } else if let Some(pos) = st.delayed.iter().position(|d| d.item.id == id) {
                st.delayed.remove(pos);
                true
            } else if let Some(mut entry) = st.active.remove(&id) {
                if !entry.cancelled {
                    entry.cancelled = true;
                    cancel = Some(entry.control.clone());
                }
                true
            } else if let Some(pos) = st.completed.iter().position(|i| i.id == id) {
                stored_location = st.completed.remove(pos).location;
                true
            } else if let Some(pos) = st.failed.iter().position(|i| i.id == id) {
                st.failed.remove(pos);
                true
            } else {
                false
            }
        };
        if !found {
            return false;
        }
        if let Some(control) = cancel {
            control.cancel();
            self.admit.notify_one();
        }
        if let Some(location) = stored_location {
            if let Err(e) = self.transport.delete(&location) {
                tracing::warn!(id = %id, "stored artifact delete failed: {}", e);
            }
        }
        self.tracker.remove(&id.to_string()).await;
        tracing::debug!(id = %id, "item removed");
        true
    }

    // --- reporting ---

    pub fn stats(&self) -> EngineStats {
        let st = self.state.lock().unwrap();
        let bytes_transferred = st
            .queue
            .iter()
            .chain(st.delayed.iter().map(|d| &d.item))
            .chain(st.active.values().map(|a| &a.item))
            .chain(st.completed.iter())
            .chain(st.failed.iter())
            .map(|i| i.bytes_transferred)
            .sum();
        EngineStats {
            total_files: st.total_files,
            total_bytes: st.total_bytes,
            queued: st.queue.len() + st.delayed.len(),
            active: st.active.len(),
            completed: st.completed.len(),
            failed: st.failed.len(),
            batched: self.loader.pending_files(),
            succeeded_files: st.succeeded_files,
            failed_files: st.failed_files,
            bytes_transferred,
            processing: st.processing,
            paused: st.paused,
        }
    }

    pub fn items(&self) -> Vec<TransferItem> {
        let st = self.state.lock().unwrap();
        st.queue
            .iter()
            .cloned()
            .chain(st.delayed.iter().map(|d| d.item.clone()))
            .chain(st.active.values().map(|a| a.item.clone()))
            .chain(st.completed.iter().cloned())
            .chain(st.failed.iter().cloned())
            .collect()
    }

    pub fn find(&self, id: ItemId) -> Option<TransferItem> {
        let st = self.state.lock().unwrap();
        st.active
            .get(&id)
            .map(|a| a.item.clone())
            .or_else(|| st.queue.iter().find(|i| i.id == id).cloned())
            .or_else(|| {
                st.delayed
                    .iter()
                    .map(|d| &d.item)
                    .find(|i| i.id == id)
                    .cloned()
            })
            .or_else(|| st.completed.iter().find(|i| i.id == id).cloned())
            .or_else(|| st.failed.iter().find(|i| i.id == id).cloned())
    }

    pub fn is_idle(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.queue.is_empty() && st.delayed.is_empty() && st.active.is_empty() && self.loader.is_empty()
    }
}

/// Consumes one transfer's event stream and feeds the shared handlers.
/// Ends on a terminal event or when the transport drops its sender.
async fn drive(
    weak: Weak<Shared>,
    id: ItemId,
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else { return };
        match event {
            TransferEvent::Progress {
                bytes_transferred, ..
            } => {
                shared.on_progress(id, bytes_transferred).await;
            }
            TransferEvent::Completed { location } => {
                shared.on_completed(id, location).await;
                return;
            }
            TransferEvent::Failed { error } => {
                shared.on_failed(id, error).await;
                return;
            }
        }
    }
    // Channel closed without a terminal event. If the item is still active
    // this counts as an aborted transfer; after a cancel it is a no-op.
    if let Some(shared) = weak.upgrade() {
        let error = TransferError::new(
            TransferErrorKind::Aborted,
            "transport closed the event channel",
        );
        shared.on_failed(id, error).await;
    }
}
