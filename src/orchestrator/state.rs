//! Engine bookkeeping: queue, active set, delayed retries, tallies.
//!
//! Every item lives in exactly one collection at a time: queue, delayed,
//! active, completed or failed. Items awaiting a retry delay sit in
//! `delayed` and count as queued for reporting purposes.

use crate::error::TransferError;
use crate::item::{ItemId, TransferItem, TransferStatus};
use crate::transport::HandleControl;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// One in-flight transfer: the item plus the command side of its handle.
pub(crate) struct ActiveTransfer {
    pub item: TransferItem,
    pub control: HandleControl,
    pub paused: bool,
    /// Set when a cancel has been sent; guarantees at most one cancel per
    /// handle and drops late events from the old driver.
    pub cancelled: bool,
}

/// An item parked until its retry delay elapses.
pub(crate) struct DelayedRetry {
    pub ready_at: Instant,
    pub item: TransferItem,
}

pub(crate) struct EngineState {
    pub queue: VecDeque<TransferItem>,
    pub delayed: Vec<DelayedRetry>,
    pub active: HashMap<ItemId, ActiveTransfer>,
    pub completed: Vec<TransferItem>,
    pub failed: Vec<TransferItem>,
    pub processing: bool,
    pub paused: bool,
    pub total_files: u64,
    pub total_bytes: u64,
    pub succeeded_files: u64,
    pub failed_files: u64,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            delayed: Vec::new(),
            active: HashMap::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            processing: false,
            paused: false,
            total_files: 0,
            total_bytes: 0,
            succeeded_files: 0,
            failed_files: 0,
        }
    }
}

/// Aggregate counters reported by `UploadEngine::stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub total_files: u64,
    pub total_bytes: u64,
    /// Queue plus delayed-retry items.
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    /// Files still held by the batch loader, not yet in the queue.
    pub batched: usize,
    pub succeeded_files: u64,
    pub failed_files: u64,
    pub bytes_transferred: u64,
    pub processing: bool,
    pub paused: bool,
}

/// Events published to engine subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Queued {
        id: ItemId,
    },
    StatusChanged {
        id: ItemId,
        status: TransferStatus,
    },
    Progress {
        id: ItemId,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    Completed {
        id: ItemId,
        location: String,
    },
    Failed {
        id: ItemId,
        error: TransferError,
    },
    RetryScheduled {
        id: ItemId,
        attempt: u32,
        delay: Duration,
    },
    StateChanged {
        processing: bool,
        paused: bool,
    },
}
