//! The upload engine: queue admission, concurrency control, retries and
//! lifecycle operations.
//!
//! `UploadEngine` is a cheap-to-clone handle over a shared core. A single
//! admission loop owns queue-to-active promotion, so the concurrency cap
//! can never be oversubscribed; per-transfer driver tasks consume handle
//! events and feed the shared handlers. Submissions above the batch
//! threshold are staged through the batch loader instead of flooding the
//! queue.

mod order;
mod shared;
mod state;

pub use order::QUICK_WIN_THRESHOLD;
pub use state::{EngineEvent, EngineStats};

use crate::batch::BATCH_THRESHOLD;
use crate::config::EngineConfig;
use crate::error::{TransferError, TransferErrorKind};
use crate::health::HealthSnapshot;
use crate::item::{ItemId, TransferItem, UploadRequest};
use crate::network::{NetworkMonitor, RetryTuning};
use crate::plugin::{HookKind, PluginBus, PluginEvent};
use crate::resume::ResumeTracker;
use crate::store::KeyValueStore;
use crate::throttle::BandwidthThrottle;
use crate::transport::Transport;
use crate::validate::{dedup_first, FileCandidate, ValidationPolicy};
use anyhow::Result;
use serde_json::json;
use shared::Shared;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Validate candidates before queueing; rejected files are dropped and
    /// reported through the validation hook.
    pub validation: Option<ValidationPolicy>,
    /// With validation on, keep only the first file of each duplicate
    /// content group.
    pub drop_duplicates: bool,
}

/// Handle to the upload engine. Clones share one engine.
#[derive(Clone)]
pub struct UploadEngine {
    shared: Arc<Shared>,
}

impl UploadEngine {
    /// Build an engine with a retry policy derived from `config`.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        let tuning = RetryTuning {
            max_attempts: config.max_retries,
            base_delay: config.base_retry_delay,
            max_delay: config.max_retry_delay,
            ..RetryTuning::default()
        };
        Self::with_monitor(config, transport, Arc::new(NetworkMonitor::new(tuning)), store)
    }

    /// Build an engine around a caller-owned network monitor.
    pub fn with_monitor(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        monitor: Arc<NetworkMonitor>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        Self {
            shared: Shared::spawn(config, transport, monitor, store),
        }
    }

    /// Queue upload requests. Returns the ids of the accepted items in
    /// request order.
    ///
    /// A request with an empty source reference fails the whole submission.
    /// With validation enabled, rejected candidates are skipped (not
    /// queued, not failed) and reported via the validation hook.
    pub async fn submit(
        &self,
        requests: Vec<UploadRequest>,
        opts: SubmitOptions,
    ) -> Result<Vec<ItemId>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        for req in &requests {
            if req.source.reference.is_empty() {
                return Err(TransferError::new(
                    TransferErrorKind::InvalidArgument,
                    format!("{:?} has an empty source reference", req.file_name),
                )
                .into());
            }
        }

        let shared = &self.shared;
        let accepted = match &opts.validation {
            None => requests,
            Some(policy) => {
                let candidates = requests
                    .iter()
                    .map(|r| FileCandidate {
                        name: r.file_name.clone(),
                        size: r.source.size,
                        declared_type: r.declared_type.clone().unwrap_or_default(),
                        head: r.head.clone(),
                    })
                    .collect();
                let reports = policy.validate_all(candidates).await;
                let keep: HashSet<usize> = if opts.drop_duplicates {
                    dedup_first(&reports).into_iter().collect()
                } else {
                    (0..reports.len()).collect()
                };
                let mut kept = Vec::new();
                for (i, (req, report)) in requests.into_iter().zip(&reports).enumerate() {
                    if !report.ok() {
                        tracing::warn!(
                            file = %report.name,
                            "rejected by validation: {}",
                            report.errors.join("; ")
                        );
                        shared
                            .plugins
                            .emit(PluginEvent::new(HookKind::Validation).detail(json!({
                                "file": report.name,
                                "errors": report.errors,
                                "warnings": report.warnings,
                            })))
                            .await;
                        continue;
                    }
                    if !keep.contains(&i) {
                        tracing::debug!(file = %report.name, "dropped duplicate content");
                        continue;
                    }
                    for w in &report.warnings {
                        tracing::warn!(file = %report.name, "{}", w);
                    }
                    kept.push(req);
                }
                kept
            }
        };

        let items: Vec<TransferItem> = accepted
            .into_iter()
            .map(|req| TransferItem::from_request(shared.allocate_id(), req))
            .collect();
        let ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
        {
            let mut st = shared.state.lock().unwrap();
            st.total_files += items.len() as u64;
            st.total_bytes += items.iter().map(|i| i.total_bytes).sum::<u64>();
        }
        for item in &items {
            shared
                .plugins
                .emit(PluginEvent::with_item(HookKind::FileAdded, item.clone()))
                .await;
            shared.emit_event(EngineEvent::Queued { id: item.id });
        }
        if items.len() > BATCH_THRESHOLD {
            let batches = shared.loader.load(items).await;
            tracing::info!(batches, "large submission staged through the batch loader");
        } else {
            let mut st = shared.state.lock().unwrap();
            st.queue.extend(items);
        }
        if shared.cfg.auto_start {
            self.start().await;
        } else {
            shared.admit.notify_one();
        }
        Ok(ids)
    }

    /// Begin (or keep) processing the queue. Idempotent.
    pub async fn start(&self) {
        if self.shared.set_processing(true).await {
            tracing::info!("queue processing started");
        }
    }

    /// Pause all active transfers and stop admitting new ones.
    pub async fn pause(&self) {
        self.shared.set_paused(true).await;
    }

    /// Resume paused transfers and admission.
    pub async fn resume(&self) {
        self.shared.set_paused(false).await;
    }

    /// Stop processing. Every active handle is cancelled exactly once and
    /// its item returns to the queue; queued items stay queued.
    pub async fn stop(&self) {
        self.shared.halt().await;
    }

    /// Requeue every failed item with a fresh attempt budget. Returns how
    /// many were requeued.
    pub async fn retry_failed(&self) -> usize {
        self.shared.retry_failed().await
    }

    /// Remove an item from whichever collection holds it, cancelling it if
    /// active and best-effort deleting the stored artifact if completed.
    pub async fn remove_file(&self, id: ItemId) -> bool {
        self.shared.remove(id).await
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.stats()
    }

    /// Every known item, in collection order: queued, delayed, active,
    /// completed, failed.
    pub fn items(&self) -> Vec<TransferItem> {
        self.shared.items()
    }

    pub fn item(&self, id: ItemId) -> Option<TransferItem> {
        self.shared.find(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn plugins(&self) -> &PluginBus {
        &self.shared.plugins
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.shared.monitor
    }

    pub fn throttle(&self) -> &Arc<BandwidthThrottle> {
        &self.shared.throttle
    }

    pub fn tracker(&self) -> &Arc<ResumeTracker> {
        &self.shared.tracker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.cfg
    }

    pub fn health(&self) -> HealthSnapshot {
        self.shared.health()
    }

    /// True when nothing is queued, delayed, active or batched.
    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }

    /// Wait until the engine is idle, up to `max_wait`.
    pub async fn wait_idle(&self, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.shared.is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop processing and cancel every background task. The engine accepts
    /// no further work after this.
    pub async fn shutdown(&self) {
        self.shared.halt().await;
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.admit.notify_one();
        self.shared.timers.shutdown();
        tracing::info!("engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::TransferStatus;
    use crate::plugin::{PluginOptions, UploadPlugin};
    use crate::transport::TransferHandle;
    use std::sync::Mutex;

    /// Transport whose handles never report anything.
    struct InertTransport;

    impl Transport for InertTransport {
        fn begin(&self, _item: &TransferItem) -> Result<TransferHandle> {
            let (handle, driver) = TransferHandle::channel();
            tokio::spawn(async move {
                let mut driver = driver;
                while driver.commands.recv().await.is_some() {}
            });
            Ok(handle)
        }

        fn delete(&self, _location: &str) -> Result<()> {
            Ok(())
        }
    }

    fn manual_config() -> EngineConfig {
        EngineConfig {
            auto_start: false,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn submit_assigns_sequential_ids_and_tallies() {
        let engine = UploadEngine::new(manual_config(), Arc::new(InertTransport), None);
        let ids = engine
            .submit(
                vec![
                    UploadRequest::new("a", "ref://a", 100, "d/a"),
                    UploadRequest::new("b", "ref://b", 200, "d/b"),
                ],
                SubmitOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(ids, vec![ItemId(1), ItemId(2)]);
        let stats = engine.stats();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_bytes, 300);
        assert_eq!(stats.queued, 2);
        assert!(!stats.processing);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn empty_source_reference_rejects_the_submission() {
        let engine = UploadEngine::new(manual_config(), Arc::new(InertTransport), None);
        let err = engine
            .submit(
                vec![UploadRequest::new("a", "", 100, "d/a")],
                SubmitOptions::default(),
            )
            .await
            .unwrap_err();
        let err = err.downcast::<TransferError>().unwrap();
        assert_eq!(err.kind, TransferErrorKind::InvalidArgument);
        assert_eq!(engine.stats().total_files, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn validation_skips_rejected_candidates() {
        let engine = UploadEngine::new(manual_config(), Arc::new(InertTransport), None);
        let policy = ValidationPolicy {
            max_file_size: 150,
            ..ValidationPolicy::default()
        };
        let ids = engine
            .submit(
                vec![
                    UploadRequest::new("small", "ref://s", 100, "d/s"),
                    UploadRequest::new("huge", "ref://h", 10_000, "d/h"),
                ],
                SubmitOptions {
                    validation: Some(policy),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(engine.item(ids[0]).unwrap().file_name, "small");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn large_submissions_stage_through_the_loader() {
        let engine = UploadEngine::new(manual_config(), Arc::new(InertTransport), None);
        let requests: Vec<_> = (0..150)
            .map(|i| UploadRequest::new(format!("f{}", i), format!("ref://{}", i), 1, "d"))
            .collect();
        let ids = engine.submit(requests, SubmitOptions::default()).await.unwrap();
        assert_eq!(ids.len(), 150);
        let stats = engine.stats();
        assert_eq!(stats.batched, 150);
        assert_eq!(stats.queued, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn items_admitted_up_to_the_concurrency_cap() {
        let config = EngineConfig {
            max_concurrent_uploads: 2,
            ..EngineConfig::default()
        };
        let engine = UploadEngine::new(config, Arc::new(InertTransport), None);
        let requests: Vec<_> = (0..5)
            .map(|i| UploadRequest::new(format!("f{}", i), format!("ref://{}", i), 10, "d"))
            .collect();
        engine.submit(requests, SubmitOptions::default()).await.unwrap();
        // auto_start is on; give the admission loop a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = engine.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.queued, 3);
        for item in engine.items() {
            assert_ne!(item.status, TransferStatus::Failed);
        }
        engine.shutdown().await;
    }

    struct StatusSpy {
        seen: Mutex<Vec<String>>,
    }

    impl UploadPlugin for StatusSpy {
        fn name(&self) -> &str {
            "status-spy"
        }

        fn capabilities(&self) -> &[HookKind] {
            &[HookKind::StatusChange]
        }

        fn handle(&self, event: &PluginEvent) -> Result<()> {
            if let Some(status) = event.detail.get("status").and_then(|v| v.as_str()) {
                self.seen.lock().unwrap().push(status.to_string());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn status_changes_reach_subscribed_plugins() {
        let spy = Arc::new(StatusSpy {
            seen: Mutex::new(Vec::new()),
        });
        let engine = UploadEngine::new(manual_config(), Arc::new(InertTransport), None);
        engine
            .plugins()
            .register(spy.clone(), PluginOptions::default())
            .unwrap();
        engine
            .submit(
                vec![UploadRequest::new("a", "ref://a", 100, "d/a")],
                SubmitOptions::default(),
            )
            .await
            .unwrap();
        engine.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(spy.seen.lock().unwrap().contains(&"uploading".to_string()));

        engine.pause().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(spy.seen.lock().unwrap().contains(&"paused".to_string()));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn remove_file_covers_queued_and_unknown_items() {
        let engine = UploadEngine::new(manual_config(), Arc::new(InertTransport), None);
        let ids = engine
            .submit(
                vec![UploadRequest::new("a", "ref://a", 100, "d/a")],
                SubmitOptions::default(),
            )
            .await
            .unwrap();
        assert!(engine.remove_file(ids[0]).await);
        assert!(engine.item(ids[0]).is_none());
        assert!(!engine.remove_file(ItemId(999)).await);
        engine.shutdown().await;
    }
}
