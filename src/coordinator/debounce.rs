// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-player progress debouncing.
//!
//! Each player with unsettled progress gets one worker task. Further
//! updates send `Reschedule` down the worker's channel, pushing its
//! deadline out; they never start a second timer. When the deadline
//! passes (or `FlushNow` arrives) the worker deregisters itself and then
//! fires, so the write always sees state at least as new as the last
//! signal it received.
//!
//! ```text
//! schedule ──► [worker p1] ──(quiet for delay)──► DebounceTarget::fire("p1")
//! schedule ──►     │  Reschedule resets the deadline
//! cancel   ──►     └─ Cancel exits without firing
//! ```

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

#[async_trait]
pub(crate) trait DebounceTarget: Send + Sync {
    async fn fire(&self, player_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebounceSignal {
    Reschedule,
    FlushNow,
    Cancel,
}

struct Worker {
    tx: mpsc::UnboundedSender<DebounceSignal>,
    generation: u64,
    handle: JoinHandle<()>,
}

type Workers = Arc<DashMap<String, Worker>>;

pub(crate) struct ProgressDebouncer {
    workers: Workers,
    delay_ms: Arc<AtomicU64>,
    target: Arc<dyn DebounceTarget>,
    next_generation: AtomicU64,
}

impl ProgressDebouncer {
    pub fn new(delay: Duration, target: Arc<dyn DebounceTarget>) -> Self {
        Self {
            workers: Arc::new(DashMap::new()),
            delay_ms: Arc::new(AtomicU64::new(delay.as_millis() as u64)),
            target,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Applies to deadlines set after the call.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Start or push back the player's timer.
    pub fn schedule(&self, player_id: &str) {
        self.signal_or_spawn(player_id, DebounceSignal::Reschedule);
    }

    /// Fire the player's pending write now, if one is pending.
    pub fn flush_now(&self, player_id: &str) -> bool {
        match self.workers.get(player_id) {
            Some(worker) => worker.tx.send(DebounceSignal::FlushNow).is_ok(),
            None => false,
        }
    }

    /// Drop the player's timer without firing.
    pub fn cancel(&self, player_id: &str) -> bool {
        match self.workers.remove(player_id) {
            Some((_, worker)) => {
                let _ = worker.tx.send(DebounceSignal::Cancel);
                true
            }
            None => false,
        }
    }

    /// Cancel every timer and wait for the workers to exit.
    pub async fn cancel_all(&self) -> usize {
        let players: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        let mut handles = Vec::with_capacity(players.len());
        for player_id in players {
            if let Some((_, worker)) = self.workers.remove(&player_id) {
                let _ = worker.tx.send(DebounceSignal::Cancel);
                handles.push(worker.handle);
            }
        }
        let cancelled = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Debounce worker panicked");
            }
        }
        cancelled
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.workers.len()
    }

    fn signal_or_spawn(&self, player_id: &str, signal: DebounceSignal) {
        match self.workers.entry(player_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().tx.send(signal).is_ok() {
                    return;
                }
                // Worker already gone; replace it
                entry.insert(self.spawn_worker(player_id));
            }
            Entry::Vacant(entry) => {
                entry.insert(self.spawn_worker(player_id));
            }
        }
    }

    fn spawn_worker(&self, player_id: &str) -> Worker {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(run_worker(
            player_id.to_string(),
            generation,
            rx,
            self.delay_ms.clone(),
            self.workers.clone(),
            self.target.clone(),
        ));
        debug!(player_id, generation, "Debounce worker started");
        Worker { tx, generation, handle }
    }
}

async fn run_worker(
    player_id: String,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<DebounceSignal>,
    delay_ms: Arc<AtomicU64>,
    workers: Workers,
    target: Arc<dyn DebounceTarget>,
) {
    let delay = || Duration::from_millis(delay_ms.load(Ordering::Relaxed));
    let mut deadline = Instant::now() + delay();

    loop {
        tokio::select! {
            signal = rx.recv() => match signal {
                Some(DebounceSignal::Reschedule) => deadline = Instant::now() + delay(),
                Some(DebounceSignal::FlushNow) => break,
                Some(DebounceSignal::Cancel) | None => {
                    workers.remove_if(&player_id, |_, w| w.generation == generation);
                    return;
                }
            },
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }

    workers.remove_if(&player_id, |_, w| w.generation == generation);
    target.fire(&player_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTarget {
        fired: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DebounceTarget for RecordingTarget {
        async fn fire(&self, player_id: &str) {
            self.fired.lock().push(player_id.to_string());
        }
    }

    fn debouncer(ms: u64) -> (ProgressDebouncer, Arc<RecordingTarget>) {
        let target = Arc::new(RecordingTarget::default());
        (ProgressDebouncer::new(Duration::from_millis(ms), target.clone()), target)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_collapse_into_one_fire() {
        let (debouncer, target) = debouncer(100);
        debouncer.schedule("p1");
        tokio::time::sleep(Duration::from_millis(60)).await;
        debouncer.schedule("p1");
        tokio::time::sleep(Duration::from_millis(60)).await;
        debouncer.schedule("p1");
        assert_eq!(debouncer.pending(), 1);
        assert!(target.fired.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(*target.fired.lock(), vec!["p1".to_string()]);
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_players_are_independent() {
        let (debouncer, target) = debouncer(50);
        debouncer.schedule("p1");
        debouncer.schedule("p2");
        assert_eq!(debouncer.pending(), 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        settle().await;
        let mut fired = target.fired.lock().clone();
        fired.sort();
        assert_eq!(fired, vec!["p1", "p2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_never_fires() {
        let (debouncer, target) = debouncer(50);
        debouncer.schedule("p1");
        assert!(debouncer.cancel("p1"));
        assert!(!debouncer.cancel("p1"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;
        assert!(target.fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_fires_early() {
        let (debouncer, target) = debouncer(10_000);
        debouncer.schedule("p1");
        assert!(debouncer.flush_now("p1"));
        settle().await;
        assert_eq!(target.fired.lock().len(), 1);
        assert!(!debouncer.flush_now("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_waits_for_workers() {
        let (debouncer, target) = debouncer(1_000);
        for p in ["a", "b", "c"] {
            debouncer.schedule(p);
        }
        assert_eq!(debouncer.cancel_all().await, 3);
        assert_eq!(debouncer.pending(), 0);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert!(target.fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_after_fire_starts_new_worker() {
        let (debouncer, target) = debouncer(20);
        debouncer.schedule("p1");
        tokio::time::sleep(Duration::from_millis(40)).await;
        settle().await;
        debouncer.schedule("p1");
        tokio::time::sleep(Duration::from_millis(40)).await;
        settle().await;
        assert_eq!(target.fired.lock().len(), 2);
    }
}
