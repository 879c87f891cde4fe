//! Scripted in-memory transport for engine integration tests.
//!
//! Behavior is keyed by file name so a single transport can drive mixed
//! scenarios. Every received command is counted, which lets tests assert
//! exact pause/cancel delivery.

use anyhow::Result;
use blobup::error::{TransferError, TransferErrorKind};
use blobup::item::TransferItem;
use blobup::transport::{HandleCommand, HandleDriver, TransferEvent, TransferHandle, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Behavior of one scripted transfer.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Report progress, then complete after `delay`.
    Succeed { delay: Duration },
    /// Fail with `kind` after `delay`.
    Fail {
        kind: TransferErrorKind,
        delay: Duration,
    },
    /// Fail `failures` times across begin calls, then succeed.
    FailThenSucceed {
        kind: TransferErrorKind,
        failures: u32,
    },
    /// Emit nothing; only reacts to commands.
    Hang,
}

#[derive(Default)]
pub struct Counters {
    pub begun: u32,
    pub pauses: HashMap<String, u32>,
    pub resumes: HashMap<String, u32>,
    pub cancels: HashMap<String, u32>,
    pub attempts: HashMap<String, u32>,
    pub deleted: Vec<String>,
}

pub struct MockTransport {
    default: Script,
    scripts: Mutex<HashMap<String, Script>>,
    pub counters: Arc<Mutex<Counters>>,
}

impl MockTransport {
    pub fn new(default: Script) -> Arc<Self> {
        Arc::new(Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            counters: Arc::new(Mutex::new(Counters::default())),
        })
    }

    /// Override the script for one file name.
    pub fn script(&self, file_name: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(file_name.to_string(), script);
    }

    pub fn pauses(&self, file_name: &str) -> u32 {
        self.counters
            .lock()
            .unwrap()
            .pauses
            .get(file_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn resumes(&self, file_name: &str) -> u32 {
        self.counters
            .lock()
            .unwrap()
            .resumes
            .get(file_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn cancels(&self, file_name: &str) -> u32 {
        self.counters
            .lock()
            .unwrap()
            .cancels
            .get(file_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn begun(&self) -> u32 {
        self.counters.lock().unwrap().begun
    }

    pub fn deleted(&self) -> Vec<String> {
        self.counters.lock().unwrap().deleted.clone()
    }
}

impl Transport for MockTransport {
    fn begin(&self, item: &TransferItem) -> Result<TransferHandle> {
        let name = item.file_name.clone();
        let total = item.total_bytes;
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&name)
            .copied()
            .unwrap_or(self.default);
        let script = {
            let mut counters = self.counters.lock().unwrap();
            counters.begun += 1;
            let attempt = counters.attempts.entry(name.clone()).or_insert(0);
            *attempt += 1;
            match script {
                Script::FailThenSucceed { kind, failures } if *attempt <= failures => {
                    Script::Fail {
                        kind,
                        delay: Duration::from_millis(10),
                    }
                }
                Script::FailThenSucceed { .. } => Script::Succeed {
                    delay: Duration::from_millis(10),
                },
                other => other,
            }
        };
        let (handle, driver) = TransferHandle::channel();
        tokio::spawn(run_script(
            name,
            total,
            script,
            driver,
            Arc::clone(&self.counters),
        ));
        Ok(handle)
    }

    fn delete(&self, location: &str) -> Result<()> {
        self.counters
            .lock()
            .unwrap()
            .deleted
            .push(location.to_string());
        Ok(())
    }
}

async fn run_script(
    name: String,
    total: u64,
    script: Script,
    driver: HandleDriver,
    counters: Arc<Mutex<Counters>>,
) {
    let HandleDriver {
        mut commands,
        events,
    } = driver;
    let location = format!("stored/{}", name);
    let work = async {
        match script {
            Script::Succeed { delay } => {
                let _ = events.send(TransferEvent::Progress {
                    bytes_transferred: total / 2,
                    total_bytes: total,
                });
                tokio::time::sleep(delay).await;
                let _ = events.send(TransferEvent::Progress {
                    bytes_transferred: total,
                    total_bytes: total,
                });
                let _ = events.send(TransferEvent::Completed { location });
            }
            Script::Fail { kind, delay } => {
                tokio::time::sleep(delay).await;
                let _ = events.send(TransferEvent::Failed {
                    error: TransferError::new(kind, "scripted failure"),
                });
            }
            Script::FailThenSucceed { .. } => unreachable!("resolved in begin"),
            Script::Hang => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(work);
    loop {
        tokio::select! {
            _ = &mut work => break,
            cmd = commands.recv() => match cmd {
                Some(HandleCommand::Pause) => {
                    *counters.lock().unwrap().pauses.entry(name.clone()).or_insert(0) += 1;
                }
                Some(HandleCommand::Resume) => {
                    *counters.lock().unwrap().resumes.entry(name.clone()).or_insert(0) += 1;
                }
                Some(HandleCommand::Cancel) => {
                    *counters.lock().unwrap().cancels.entry(name.clone()).or_insert(0) += 1;
                    // Stay on the channel so a duplicate cancel would be
                    // counted rather than silently dropped.
                    while let Some(cmd) = commands.recv().await {
                        if matches!(cmd, HandleCommand::Cancel) {
                            *counters.lock().unwrap().cancels.entry(name.clone()).or_insert(0) += 1;
                        }
                    }
                    break;
                }
                None => break,
            }
        }
    }
}
