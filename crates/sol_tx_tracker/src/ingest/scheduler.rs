//! Background sync service: runs fetch cycles on an interval, one at a time, and
//! merges their results into the dataset store.

use crate::chain::{BlockSource, Classifier, RpcError};
use crate::config::TrackerConfig;
use crate::ingest::fetcher::{BatchFetcher, CycleStats};
use crate::store::{DatasetStore, MergeSummary, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Fetching,
    Merging,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub batch_size: u64,
    pub poll_interval: Duration,
    pub classifier: Classifier,
}

impl SyncSettings {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            classifier: config.classifier(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CycleReport {
    pub stats: CycleStats,
    pub merge: MergeSummary,
}

pub struct SyncService<S> {
    fetcher: BatchFetcher<S>,
    store: Arc<DatasetStore>,
    batch_size: u64,
    poll_interval: Duration,
    state: watch::Sender<SyncState>,
    stop: watch::Receiver<bool>,
    /// Held for the duration of a cycle. Carries the backfill depth while the start
    /// cursor of a fresh dataset is still unresolved.
    in_flight: Mutex<Option<u64>>,
}

impl<S: BlockSource + 'static> SyncService<S> {
    pub fn new(
        source: S,
        store: Arc<DatasetStore>,
        settings: SyncSettings,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            fetcher: BatchFetcher::new(source, settings.classifier, stop.clone()),
            store,
            batch_size: settings.batch_size.max(1),
            poll_interval: settings.poll_interval,
            state,
            stop,
            in_flight: Mutex::new(None),
        }
    }

    /// Resolve the start of a fresh dataset on the first cycle instead of at startup:
    /// the cursor jumps to `backfill_slots` behind the chain tip once the tip is known.
    /// Until then every cycle retries the lookup.
    pub fn with_deferred_start(mut self, backfill_slots: u64) -> Self {
        self.in_flight = Mutex::new(Some(backfill_slots));
        self
    }

    pub fn store(&self) -> Arc<DatasetStore> {
        Arc::clone(&self.store)
    }

    pub fn source(&self) -> &S {
        self.fetcher.source()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Run a single cycle from the persisted cursor. `Ok(None)` when another cycle is
    /// already in flight; the call is skipped, not queued.
    pub async fn run_once(&self) -> Result<Option<CycleReport>, SyncError> {
        let Ok(mut pending) = self.in_flight.try_lock() else {
            info!("cycle already in flight, skipping trigger");
            return Ok(None);
        };
        self.state.send_replace(SyncState::Fetching);
        if let Some(backfill) = *pending {
            if let Err(e) = self.resolve_start(backfill).await {
                self.state.send_replace(SyncState::Idle);
                return Err(e);
            }
            *pending = None;
        }
        let cursor = self.store.snapshot().cursor();
        let outcome = match self.fetcher.run_cycle(cursor, self.batch_size).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state.send_replace(SyncState::Idle);
                return Err(e.into());
            }
        };

        self.state.send_replace(SyncState::Merging);
        let store = Arc::clone(&self.store);
        let next_cursor = outcome.next_cursor;
        let records = outcome.records;
        let merged =
            tokio::task::spawn_blocking(move || store.merge(records, next_cursor)).await;
        self.state.send_replace(SyncState::Idle);
        let merge = merged??;
        info!(
            from = cursor,
            cursor = merge.cursor,
            added = merge.added,
            duplicates = merge.duplicates,
            skipped = outcome.stats.skipped_not_found,
            malformed = outcome.stats.dropped_malformed,
            "cycle complete"
        );
        Ok(Some(CycleReport {
            stats: outcome.stats,
            merge,
        }))
    }

    async fn resolve_start(&self, backfill: u64) -> Result<(), SyncError> {
        let start = match self.fetcher.source().latest_slot().await {
            Ok(latest) => latest.saturating_sub(backfill),
            Err(RpcError::OfflineMiss) => {
                warn!("offline without start_slot, starting from slot 0");
                0
            }
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "chain tip unknown, start cursor deferred");
                return Err(e.into());
            }
        };
        let store = Arc::clone(&self.store);
        let merge =
            tokio::task::spawn_blocking(move || store.merge(Vec::new(), start)).await??;
        info!(cursor = merge.cursor, "start cursor resolved");
        Ok(())
    }

    /// Loop until the stop signal fires. Cycle failures are logged and never end the
    /// loop. Dropping the stop sender also ends it. Ticks that came due while a cycle
    /// was running are skipped.
    pub async fn run(self) {
        let mut stop = self.stop.clone();
        let mut idle_since = Instant::now();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = self.poll_interval.as_secs(),
            batch_size = self.batch_size,
            cursor = self.store.snapshot().cursor(),
            "sync service started"
        );
        loop {
            let due = tokio::select! {
                due = ticker.tick() => due,
                _ = stop.wait_for(|s| *s) => break,
            };
            if *stop.borrow() {
                break;
            }
            if due < idle_since {
                info!(
                    overdue_ms = (idle_since - due).as_millis() as u64,
                    "skipping trigger missed during cycle"
                );
                continue;
            }
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "cycle failed");
            }
            idle_since = Instant::now();
        }
        self.state.send_replace(SyncState::Stopped);
        info!(cursor = self.store.snapshot().cursor(), "sync service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockPayload;
    use serde_json::json;
    use std::future::Future;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Chain {
        tip: u64,
        /// `latest_slot` fails with a network error this many times first.
        tip_failures: AtomicU32,
        tip_delay: Duration,
        tip_calls: Arc<std::sync::Mutex<Vec<Instant>>>,
    }

    impl Chain {
        fn at(tip: u64) -> Self {
            Self {
                tip,
                ..Default::default()
            }
        }
    }

    impl BlockSource for Chain {
        fn latest_slot(&self) -> impl Future<Output = Result<u64, RpcError>> + Send {
            self.tip_calls.lock().unwrap().push(Instant::now());
            let fail = self
                .tip_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let (tip, delay) = (self.tip, self.tip_delay);
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if fail {
                    return Err(RpcError::Network("connection refused".into()));
                }
                Ok(tip)
            }
        }

        fn fetch_block(
            &self,
            slot: u64,
        ) -> impl Future<Output = Result<BlockPayload, RpcError>> + Send {
            async move {
                Ok(BlockPayload {
                    slot,
                    transactions: vec![json!({
                        "meta": { "err": null, "fee": 5000 },
                        "transaction": { "signatures": [format!("sig{slot}")] }
                    })],
                    ..Default::default()
                })
            }
        }
    }

    fn service_with(
        dir: &tempfile::TempDir,
        start: u64,
        chain: Chain,
    ) -> (SyncService<Chain>, watch::Sender<bool>) {
        let store = Arc::new(DatasetStore::load(dir.path().join("dataset.json"), start).unwrap());
        let (tx, rx) = watch::channel(false);
        let settings = SyncSettings {
            batch_size: 5,
            poll_interval: Duration::from_secs(20),
            classifier: Classifier::default(),
        };
        (SyncService::new(chain, store, settings, rx), tx)
    }

    fn service(
        dir: &tempfile::TempDir,
        start: u64,
        tip: u64,
    ) -> (SyncService<Chain>, watch::Sender<bool>) {
        service_with(dir, start, Chain::at(tip))
    }

    #[tokio::test]
    async fn run_once_merges_and_returns_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _tx) = service(&dir, 1000, 5000);
        let report = svc.run_once().await.unwrap().unwrap();
        assert_eq!(report.merge.added, 5);
        assert_eq!(report.merge.cursor, 1005);
        assert_eq!(svc.state(), SyncState::Idle);
        let report = svc.run_once().await.unwrap().unwrap();
        assert_eq!(report.merge.cursor, 1010);
        assert_eq!(svc.store().snapshot().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, tx) = service(&dir, 0, 1_000_000);
        let store = svc.store();
        let mut state = svc.subscribe_state();
        let handle = tokio::spawn(svc.run());
        state
            .wait_for(|s| *s == SyncState::Idle && store.snapshot().cursor() > 0)
            .await
            .unwrap();
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(*state.borrow(), SyncState::Stopped);
        assert!(store.snapshot().cursor() >= 5);
    }

    #[tokio::test]
    async fn stopped_before_start_runs_no_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, tx) = service(&dir, 7, 100);
        let store = svc.store();
        tx.send(true).unwrap();
        svc.run().await;
        assert_eq!(store.snapshot().cursor(), 7);
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_missed_during_a_slow_cycle_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let chain = Chain {
            tip: 1_000_000,
            tip_delay: Duration::from_secs(50),
            ..Default::default()
        };
        let calls = Arc::clone(&chain.tip_calls);
        let (svc, tx) = service_with(&dir, 0, chain);
        let t0 = Instant::now();
        let handle = tokio::spawn(svc.run());
        tokio::time::sleep(Duration::from_secs(130)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let starts: Vec<u64> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|t| (*t - t0).as_secs())
            .collect();
        assert_eq!(starts, [0, 60, 120]);
    }

    #[tokio::test]
    async fn deferred_start_waits_for_chain_tip() {
        let dir = tempfile::tempdir().unwrap();
        let chain = Chain {
            tip: 1000,
            tip_failures: AtomicU32::new(1),
            ..Default::default()
        };
        let (svc, _tx) = service_with(&dir, 0, chain);
        let svc = svc.with_deferred_start(25);

        let err = svc.run_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Rpc(RpcError::Network(_))));
        assert_eq!(svc.state(), SyncState::Idle);
        assert_eq!(svc.store().snapshot().cursor(), 0);

        let report = svc.run_once().await.unwrap().unwrap();
        assert_eq!(report.merge.previous_cursor, 975);
        assert_eq!(report.merge.cursor, 980);
        let report = svc.run_once().await.unwrap().unwrap();
        assert_eq!(report.merge.cursor, 985);

        let reloaded = DatasetStore::load(dir.path().join("dataset.json"), 0).unwrap();
        assert_eq!(reloaded.snapshot().cursor(), 985);
    }
}
