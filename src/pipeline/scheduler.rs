//! Timer-driven poll loop.
//!
//! A single task owns the interval timer and runs each cycle to completion
//! before waiting again, so cycles never overlap and ticks that fire while a
//! cycle runs are dropped. Shutdown is observed only at the wait point.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::pipeline::poller::Poller;

/// Where the poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Waiting for the next tick.
    Idle,
    /// A cycle is in progress.
    Running,
    /// The loop has exited.
    Stopped,
}

/// Handle to a spawned poll loop.
pub struct PollerHandle {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<PollerState>,
    cycles: Arc<AtomicU64>,
}

impl PollerHandle {
    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Signal shutdown and wait for the loop to exit. A cycle already in
    /// progress runs to completion first. Returns the number of cycles run.
    pub async fn stop(self) -> u64 {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!("Poller task panicked: {e}");
        }
        self.cycles.load(Ordering::SeqCst)
    }
}

/// Spawn the poll loop. Folders are bootstrapped and the first cycle runs
/// immediately; later cycles run every `interval`.
pub fn spawn_poller(poller: Arc<Poller>, interval: Duration) -> PollerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(PollerState::Idle);
    let cycles = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&cycles);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Poller started");
        poller.bootstrap_folders().await;

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = tick.tick() => {}
            }

            state_tx.send_replace(PollerState::Running);
            poller.run_cycle().await;
            counter.fetch_add(1, Ordering::SeqCst);
            state_tx.send_replace(PollerState::Idle);
        }

        state_tx.send_replace(PollerState::Stopped);
        info!("Poller shutting down");
    });

    PollerHandle {
        handle,
        shutdown: shutdown_tx,
        state: state_rx,
        cycles,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::error::MailError;
    use crate::mail::{
        DeleteBatches, Envelope, FolderScanResult, FullMessage, MailStore, MemoryMailStore, Uid,
    };
    use crate::store::LibSqlBackend;

    /// Memory store whose envelope fetches take a while and track overlap.
    #[derive(Default)]
    struct SlowMailStore {
        inner: MemoryMailStore,
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl MailStore for SlowMailStore {
        async fn list_folders(&self) -> Result<Vec<String>, MailError> {
            self.inner.list_folders().await
        }

        async fn ensure_folder(&self, name: &str) -> Result<(), MailError> {
            self.inner.ensure_folder(name).await
        }

        async fn fetch_envelopes(&self, folder: &str) -> Result<Vec<Envelope>, MailError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.inner.fetch_envelopes(folder).await
        }

        async fn fetch_full(&self, folder: &str, uids: &[Uid]) -> Result<Vec<FullMessage>, MailError> {
            self.inner.fetch_full(folder, uids).await
        }

        async fn scan_for_senders(
            &self,
            folders: &[String],
            senders: &HashSet<String>,
        ) -> Result<Vec<FolderScanResult>, MailError> {
            self.inner.scan_for_senders(folders, senders).await
        }

        async fn delete_by_uids(&self, folder: &str, uids: &[Uid]) -> Result<(), MailError> {
            self.inner.delete_by_uids(folder, uids).await
        }

        async fn delete_across_folders(&self, batches: &DeleteBatches) -> Result<(), MailError> {
            self.inner.delete_across_folders(batches).await
        }
    }

    async fn poller(mail: Arc<dyn MailStore>) -> Arc<Poller> {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Arc::new(Poller::new(mail, store))
    }

    async fn wait_for_cycles(handle: &PollerHandle, n: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.cycles_completed() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for poll cycles");
    }

    #[tokio::test]
    async fn first_cycle_runs_immediately() {
        let mail = Arc::new(MemoryMailStore::new());
        let handle = spawn_poller(poller(mail.clone()).await, Duration::from_secs(3600));

        wait_for_cycles(&handle, 1).await;
        assert!(mail.has_folder(crate::mail::FOLDER_BLOCK));
        assert_eq!(handle.stop().await, 1);
    }

    #[tokio::test]
    async fn runs_on_every_tick_until_stopped() {
        let mail = Arc::new(MemoryMailStore::new());
        let handle = spawn_poller(poller(mail).await, Duration::from_millis(10));

        wait_for_cycles(&handle, 3).await;
        let total = handle.stop().await;
        assert!(total >= 3);
    }

    #[tokio::test]
    async fn stop_lets_running_cycle_finish() {
        let mail = Arc::new(SlowMailStore {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let handle = spawn_poller(poller(mail).await, Duration::from_secs(3600));

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.state() != PollerState::Running {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("cycle never started");

        assert_eq!(handle.stop().await, 1);
    }

    #[tokio::test]
    async fn cycles_never_overlap() {
        let mail = Arc::new(SlowMailStore {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        // Ticks fire faster than a cycle completes.
        let handle = spawn_poller(poller(mail.clone()).await, Duration::from_millis(5));

        wait_for_cycles(&handle, 3).await;
        handle.stop().await;
        assert_eq!(mail.max_active.load(Ordering::SeqCst), 1);
    }
}
