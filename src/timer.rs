//! Arena of periodic tasks.
//!
//! Every recurring engine activity (health check, stuck-transfer scan,
//! throttle adaptation) registers here and all of them are cancelled as a
//! group on shutdown. Leaking a timer past teardown is a defect.

use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Owns the engine's periodic tasks; aborts them all on shutdown or drop.
#[derive(Default)]
pub struct TimerArena {
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TimerArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a periodic task. `tick` runs every `period` until shutdown.
    pub fn spawn_periodic<F>(&self, name: &str, period: Duration, mut tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so `tick` runs on
            // the period, not at registration.
            interval.tick().await;
            loop {
                interval.tick().await;
                tick();
            }
        });
        self.handles
            .lock()
            .unwrap()
            .push((name.to_string(), handle));
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().unwrap().is_empty()
    }

    /// Abort every registered task.
    pub fn shutdown(&self) {
        let mut handles = self.handles.lock().unwrap();
        for (name, handle) in handles.drain(..) {
            tracing::debug!(timer = %name, "timer cancelled");
            handle.abort();
        }
    }
}

impl Drop for TimerArena {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn periodic_task_fires_on_the_period() {
        let arena = TimerArena::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        arena.spawn_periodic("test", Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(350)).await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!((3..=4).contains(&seen), "got {} ticks", seen);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_all_timers() {
        let arena = TimerArena::new();
        let ticks = Arc::new(AtomicU32::new(0));
        for i in 0..3 {
            let counter = ticks.clone();
            arena.spawn_periodic(&format!("t{}", i), Duration::from_millis(50), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(arena.len(), 3);
        arena.shutdown();
        assert!(arena.is_empty());
        let before = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), before, "no ticks after shutdown");
    }
}
