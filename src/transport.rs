//! External transport capability: opaque resumable transfer handles.
//!
//! The engine never speaks a wire protocol. A `Transport` hands out
//! `TransferHandle`s; control flows to the handle over a command channel
//! (pause/resume/cancel) and progress/terminal events flow back over an
//! event channel the engine's driver task awaits. Message passing instead
//! of nested callbacks keeps the orchestrator's control flow sequential.

use crate::error::TransferError;
use crate::item::TransferItem;
use anyhow::Result;
use tokio::sync::mpsc;

/// Control messages sent to a transfer handle. Best-effort: a transport
/// without pause support may ignore `Pause`/`Resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleCommand {
    Pause,
    Resume,
    Cancel,
}

/// Events reported by a transfer handle.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress {
        bytes_transferred: u64,
        total_bytes: u64,
    },
    Completed {
        /// Retrievable location of the stored artifact.
        location: String,
    },
    Failed {
        error: TransferError,
    },
}

/// Command side of a handle, retained by the engine while the item is active.
#[derive(Debug, Clone)]
pub struct HandleControl {
    commands: mpsc::UnboundedSender<HandleCommand>,
}

impl HandleControl {
    /// Best-effort send; a closed channel means the transfer already ended.
    pub fn send(&self, cmd: HandleCommand) {
        let _ = self.commands.send(cmd);
    }

    pub fn pause(&self) {
        self.send(HandleCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(HandleCommand::Resume);
    }

    pub fn cancel(&self) {
        self.send(HandleCommand::Cancel);
    }
}

/// An in-flight transfer as returned by `Transport::begin`.
///
/// The engine splits this into the command side (kept in the active set)
/// and the event receiver (moved into the item's driver task).
#[derive(Debug)]
pub struct TransferHandle {
    pub control: HandleControl,
    pub events: mpsc::UnboundedReceiver<TransferEvent>,
}

impl TransferHandle {
    /// Builds a connected handle/driver pair. The transport keeps the
    /// `HandleDriver` side and feeds it from its own transfer task.
    pub fn channel() -> (TransferHandle, HandleDriver) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (
            TransferHandle {
                control: HandleControl { commands: cmd_tx },
                events: ev_rx,
            },
            HandleDriver {
                commands: cmd_rx,
                events: ev_tx,
            },
        )
    }

    pub fn split(
        self,
    ) -> (HandleControl, mpsc::UnboundedReceiver<TransferEvent>) {
        (self.control, self.events)
    }
}

/// Transport-side ends of a handle's channels.
#[derive(Debug)]
pub struct HandleDriver {
    pub commands: mpsc::UnboundedReceiver<HandleCommand>,
    pub events: mpsc::UnboundedSender<TransferEvent>,
}

impl HandleDriver {
    pub fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

/// The external transfer capability the engine drives.
///
/// `begin` must be cheap: transports that need slow setup spawn their own
/// task and report failures through the handle's event channel.
pub trait Transport: Send + Sync + 'static {
    /// Start a transfer for `item` and return its handle.
    fn begin(&self, item: &TransferItem) -> Result<TransferHandle>;

    /// Best-effort removal of a previously stored artifact.
    fn delete(&self, location: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_pair_carries_commands_and_events() {
        let (handle, mut driver) = TransferHandle::channel();
        let (control, mut events) = handle.split();

        control.pause();
        control.cancel();
        assert_eq!(driver.commands.recv().await, Some(HandleCommand::Pause));
        assert_eq!(driver.commands.recv().await, Some(HandleCommand::Cancel));

        driver.emit(TransferEvent::Progress {
            bytes_transferred: 10,
            total_bytes: 100,
        });
        match events.recv().await {
            Some(TransferEvent::Progress {
                bytes_transferred, ..
            }) => assert_eq!(bytes_transferred, 10),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn control_send_after_driver_drop_is_silent() {
        let (handle, driver) = TransferHandle::channel();
        drop(driver);
        // Must not panic: the transfer already ended.
        handle.control.cancel();
    }
}
