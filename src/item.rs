//! Transfer items: one file's upload lifecycle record.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable identifier for a transfer item, assigned by the engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ItemId(pub u64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "item-{}", self.0)
    }
}

/// Per-item state machine.
///
/// queued → uploading → {completed | failed}; uploading ⇄ paused;
/// failed → queued on retry; uploading → queued on requeue (retry delay,
/// stop-with-requeue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Queued,
    Uploading,
    Paused,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Queued => "queued",
            TransferStatus::Uploading => "uploading",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "queued" => TransferStatus::Queued,
            "uploading" => TransferStatus::Uploading,
            "paused" => TransferStatus::Paused,
            "completed" => TransferStatus::Completed,
            _ => TransferStatus::Failed,
        }
    }

    /// Whether a transition to `to` is legal.
    pub fn can_transition(self, to: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, to),
            (Queued, Uploading)
                | (Uploading, Paused)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Uploading, Queued)
                | (Paused, Uploading)
                | (Paused, Failed)
                | (Paused, Queued)
                // Pause is best-effort; a handle without pause support can
                // still run to completion.
                | (Paused, Completed)
                | (Failed, Queued)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == TransferStatus::Completed
    }
}

/// Opaque reference to source content with a known size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    /// Host-meaningful reference (path, object key, handle id). Opaque here.
    pub reference: String,
    pub size: u64,
}

/// A unit of work submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    pub source: SourceRef,
    pub destination: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Higher runs sooner.
    #[serde(default)]
    pub priority: i32,
    /// Declared MIME type, if the host knows it (used by validation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<String>,
    /// Leading content bytes for signature sniffing and duplicate hashing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub head: Vec<u8>,
}

impl UploadRequest {
    pub fn new(
        file_name: impl Into<String>,
        reference: impl Into<String>,
        size: u64,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            source: SourceRef {
                reference: reference.into(),
                size,
            },
            destination: destination.into(),
            metadata: HashMap::new(),
            priority: 0,
            declared_type: None,
            head: Vec::new(),
        }
    }
}

/// Current time as Unix seconds (DB/record timestamps).
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// One file's transfer lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    pub id: ItemId,
    pub file_name: String,
    pub source: SourceRef,
    pub destination: String,
    pub metadata: HashMap<String, String>,
    pub priority: i32,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// Location of the stored artifact after completion.
    pub location: Option<String>,
}

impl TransferItem {
    pub fn from_request(id: ItemId, req: UploadRequest) -> Self {
        let total = req.source.size;
        Self {
            id,
            file_name: req.file_name,
            source: req.source,
            destination: req.destination,
            metadata: req.metadata,
            priority: req.priority,
            status: TransferStatus::Queued,
            bytes_transferred: 0,
            total_bytes: total,
            last_error: None,
            attempts: 0,
            created_at: unix_timestamp(),
            started_at: None,
            completed_at: None,
            location: None,
        }
    }

    /// Progress fraction in [0, 100].
    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.status == TransferStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for s in [
            TransferStatus::Queued,
            TransferStatus::Uploading,
            TransferStatus::Paused,
            TransferStatus::Completed,
            TransferStatus::Failed,
        ] {
            assert_eq!(TransferStatus::from_str(s.as_str()), s);
        }
    }

    #[test]
    fn legal_transitions() {
        use TransferStatus::*;
        assert!(Queued.can_transition(Uploading));
        assert!(Uploading.can_transition(Paused));
        assert!(Paused.can_transition(Uploading));
        assert!(Uploading.can_transition(Completed));
        assert!(Uploading.can_transition(Failed));
        assert!(Failed.can_transition(Queued));
        assert!(Uploading.can_transition(Queued));
    }

    #[test]
    fn illegal_transitions() {
        use TransferStatus::*;
        assert!(!Completed.can_transition(Uploading));
        assert!(!Completed.can_transition(Queued));
        assert!(!Queued.can_transition(Completed));
        assert!(!Queued.can_transition(Paused));
        assert!(!Failed.can_transition(Uploading));
    }

    #[test]
    fn progress_percent_bounds() {
        let mut item = TransferItem::from_request(
            ItemId(1),
            UploadRequest::new("a.bin", "ref://a", 200, "bucket/a.bin"),
        );
        assert_eq!(item.progress_percent(), 0.0);
        item.bytes_transferred = 100;
        assert_eq!(item.progress_percent(), 50.0);
        item.bytes_transferred = 200;
        assert_eq!(item.progress_percent(), 100.0);
    }

    #[test]
    fn zero_byte_item_progress() {
        let mut item = TransferItem::from_request(
            ItemId(2),
            UploadRequest::new("empty", "ref://e", 0, "bucket/empty"),
        );
        assert_eq!(item.progress_percent(), 0.0);
        item.status = TransferStatus::Uploading;
        item.status = TransferStatus::Completed;
        assert_eq!(item.progress_percent(), 100.0);
    }
}
