use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, Manager, SyncEvent, SyncPhase, SyncStatus,
};
use crate::orchestration::{CancellationToken, KeepAwakeGuard, ProgressEmitter};
use crate::persistence::{PackageStore, SyncStateStore};
use crate::providers::{CatalogBatch, CatalogProvider, FetchSummary, ProgressSink};

const COMMIT_BATCH_SIZE: usize = 1_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SyncOutcome {
    Completed {
        status: SyncStatus,
        records: u64,
        parse_failures: u64,
    },
    /// Freshness gate: the slice is within its age budget and `force` was
    /// not set.
    Fresh,
}

/// Outcome slot shared between the sync that actually runs and every
/// caller that coalesced onto it.
struct SharedSync {
    notify: Notify,
    outcome: Mutex<Option<CoreResult<SyncOutcome>>>,
}

impl SharedSync {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            outcome: Mutex::new(None),
        }
    }

    /// First publish wins; the drop-guard fallback is a no-op after the
    /// real outcome has landed.
    fn publish(&self, outcome: &CoreResult<SyncOutcome>) {
        {
            let mut slot = lock_or_recover(&self.outcome);
            if slot.is_none() {
                *slot = Some(outcome.clone());
            }
        }
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> CoreResult<SyncOutcome> {
        loop {
            // Arm the listener before checking the slot so a publish
            // between the two cannot be missed.
            let notified = self.notify.notified();
            if let Some(outcome) = lock_or_recover(&self.outcome).clone() {
                return outcome;
            }
            notified.await;
        }
    }
}

/// Drives providers into the cache: freshness gates, batched commits in
/// production order, keep-awake for the duration, cooperative cancellation
/// at batch boundaries. At most one sync per provider is in flight;
/// concurrent refresh requests for the same provider coalesce onto the
/// running sync and observe its outcome.
pub struct SyncOrchestrator {
    store: Arc<dyn PackageStore>,
    sync_state: Arc<dyn SyncStateStore>,
    providers: HashMap<Manager, Arc<dyn CatalogProvider>>,
    in_flight: Mutex<HashMap<Manager, Arc<SharedSync>>>,
    /// Bounded fan-out for `refresh_all`; 1 = strictly sequential.
    parallel_degree: usize,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn PackageStore>,
        sync_state: Arc<dyn SyncStateStore>,
        providers: Vec<Arc<dyn CatalogProvider>>,
        parallel_degree: usize,
    ) -> Self {
        Self {
            store,
            sync_state,
            providers: providers
                .into_iter()
                .map(|provider| (provider.manager(), provider))
                .collect(),
            in_flight: Mutex::new(HashMap::new()),
            parallel_degree: parallel_degree.max(1),
        }
    }

    pub fn provider(&self, manager: Manager) -> Option<Arc<dyn CatalogProvider>> {
        self.providers.get(&manager).cloned()
    }

    pub fn catalog_managers(&self) -> Vec<Manager> {
        let mut managers: Vec<Manager> = self.providers.keys().copied().collect();
        managers.sort_by_key(|manager| manager.as_str());
        managers
    }

    /// Refresh one provider's slice. When a sync for this provider is
    /// already running, the call coalesces onto it: it awaits the in-flight
    /// sync and returns that sync's outcome. A coalesced caller's `cancel`
    /// token has no effect on the sync it joined, and progress events keep
    /// flowing to the original subscriber.
    pub async fn refresh_one(
        &self,
        manager: Manager,
        force: bool,
        events: mpsc::UnboundedSender<SyncEvent>,
        cancel: CancellationToken,
    ) -> CoreResult<SyncOutcome> {
        let provider = self.providers.get(&manager).cloned().ok_or_else(|| {
            CoreError::for_manager(
                manager,
                CoreErrorKind::InvalidInput,
                format!("no catalog provider registered for '{manager}'"),
            )
        })?;

        if !force {
            let metadata = self.sync_state.sync_metadata(manager)?;
            let last_success = match metadata.last_sync_status {
                Some(SyncStatus::Success) | Some(SyncStatus::Partial) => {
                    metadata.last_sync_finished_at
                }
                _ => None,
            };
            if !provider.is_stale(last_success, now_unix()) {
                return Ok(SyncOutcome::Fresh);
            }
        }

        let (share, leads) = {
            let mut in_flight = lock_or_recover(&self.in_flight);
            match in_flight.get(&manager) {
                Some(running) => (running.clone(), false),
                None => {
                    let share = Arc::new(SharedSync::new());
                    in_flight.insert(manager, share.clone());
                    (share, true)
                }
            }
        };

        if !leads {
            debug!(%manager, "coalescing onto the in-flight sync");
            return share.wait().await;
        }

        // The guard unregisters the in-flight entry and, if this future is
        // dropped mid-sync, publishes an aborted outcome so coalesced
        // callers never hang.
        let _leader = LeaderGuard {
            in_flight: &self.in_flight,
            manager,
            share: share.clone(),
        };

        let outcome = self.run_sync(provider, manager, events, cancel).await;
        share.publish(&outcome);
        outcome
    }

    async fn run_sync(
        &self,
        provider: Arc<dyn CatalogProvider>,
        manager: Manager,
        events: mpsc::UnboundedSender<SyncEvent>,
        cancel: CancellationToken,
    ) -> CoreResult<SyncOutcome> {
        // Keep the machine awake for the whole refresh; restored on drop on
        // every exit path.
        let _awake = KeepAwakeGuard::acquire();

        let emitter = ProgressEmitter::new(manager, events);
        emitter.emit(SyncPhase::Starting, 0, None, "sync starting");

        let started_at = now_unix();
        self.store.refresh_started(manager, started_at)?;

        let (batch_tx, batch_rx) = mpsc::channel::<CatalogBatch>(4);
        let producer = provider.fetch_all(batch_tx, &emitter, &cancel);
        let consumer = consume_batches(self.store.as_ref(), manager, batch_rx, &emitter);

        let (fetch_result, write_result) = tokio::join!(producer, consumer);

        let written = match write_result {
            Ok(written) => written,
            Err(error) => {
                self.store.refresh_finished(
                    manager,
                    SyncStatus::Failed,
                    now_unix(),
                    Some(&error.message),
                )?;
                emitter.emit(SyncPhase::Failed, 0, None, &error.message);
                return Err(error);
            }
        };

        match fetch_result {
            Ok(FetchSummary {
                records,
                parse_failures,
            }) => {
                let status = if parse_failures > 0 {
                    SyncStatus::Partial
                } else {
                    SyncStatus::Success
                };
                self.store
                    .refresh_finished(manager, status, now_unix(), None)?;
                info!(%manager, records, parse_failures, "catalog sync complete");
                emitter.emit(
                    SyncPhase::Done,
                    records,
                    Some(records),
                    "sync complete",
                );
                Ok(SyncOutcome::Completed {
                    status,
                    records,
                    parse_failures,
                })
            }
            Err(error) if error.kind == CoreErrorKind::Cancelled => {
                // The batch in flight has committed; everything after it
                // stops here.
                self.store.refresh_finished(
                    manager,
                    SyncStatus::Failed,
                    now_unix(),
                    Some("sync cancelled"),
                )?;
                warn!(%manager, committed = written, "sync cancelled");
                emitter.emit(SyncPhase::Failed, written, None, "sync cancelled");
                Err(CoreError::for_manager(
                    manager,
                    CoreErrorKind::SyncAborted,
                    "sync cancelled",
                ))
            }
            Err(error) => {
                self.store.refresh_finished(
                    manager,
                    SyncStatus::Failed,
                    now_unix(),
                    Some(&error.message),
                )?;
                warn!(%manager, error = %error, "catalog sync failed");
                emitter.emit(SyncPhase::Failed, written, None, &error.message);
                Err(error)
            }
        }
    }

    /// Refresh every registered provider, sequentially by default or with
    /// a bounded degree of parallelism. Per-provider failures are reported
    /// in the result list, never aborting the others.
    pub async fn refresh_all(
        self: &Arc<Self>,
        force: bool,
        events: mpsc::UnboundedSender<SyncEvent>,
        cancel: CancellationToken,
    ) -> Vec<(Manager, CoreResult<SyncOutcome>)> {
        let managers = self.catalog_managers();
        let mut results = Vec::with_capacity(managers.len());

        if self.parallel_degree <= 1 {
            for manager in managers {
                if cancel.is_cancelled() {
                    results.push((
                        manager,
                        Err(CoreError::for_manager(
                            manager,
                            CoreErrorKind::SyncAborted,
                            "refresh_all cancelled",
                        )),
                    ));
                    continue;
                }
                let outcome = self
                    .refresh_one(manager, force, events.clone(), cancel.clone())
                    .await;
                results.push((manager, outcome));
            }
            return results;
        }

        let mut queue: std::collections::VecDeque<Manager> = managers.into_iter().collect();
        let mut join_set = tokio::task::JoinSet::new();
        let mut running = 0usize;

        loop {
            while running < self.parallel_degree {
                let Some(manager) = queue.pop_front() else {
                    break;
                };
                let this = Arc::clone(self);
                let events = events.clone();
                let cancel = cancel.clone();
                join_set.spawn(async move {
                    let outcome = this.refresh_one(manager, force, events, cancel).await;
                    (manager, outcome)
                });
                running += 1;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            running -= 1;
            match joined {
                Ok(entry) => results.push(entry),
                Err(join_error) => {
                    warn!(error = %join_error, "refresh task panicked");
                }
            }
        }

        results
    }
}

/// Commit incoming batches in production order, re-chunked to the commit
/// size. The provider-slice delete rides in the first commit.
async fn consume_batches(
    store: &dyn PackageStore,
    manager: Manager,
    mut rx: mpsc::Receiver<CatalogBatch>,
    progress: &dyn ProgressSink,
) -> CoreResult<u64> {
    let mut pending = CatalogBatch::default();
    let mut first_batch = true;
    let mut written = 0u64;

    while let Some(batch) = rx.recv().await {
        pending.records.extend(batch.records);
        pending.versions.extend(batch.versions);

        while pending.records.len() >= COMMIT_BATCH_SIZE {
            let spill = CatalogBatch {
                records: pending.records.split_off(COMMIT_BATCH_SIZE),
                versions: std::mem::take(&mut pending.versions),
            };
            // Version rows ride with the chunk that fills the commit;
            // correctness only needs them inside the same refresh.
            store.insert_batch(manager, &pending.records, &spill.versions, first_batch)?;
            written += pending.records.len() as u64;
            first_batch = false;
            progress.emit(SyncPhase::Writing, written, None, "writing to cache");
            pending = CatalogBatch {
                records: spill.records,
                versions: Vec::new(),
            };
        }
    }

    if !pending.is_empty() {
        store.insert_batch(manager, &pending.records, &pending.versions, first_batch)?;
        written += pending.records.len() as u64;
        progress.emit(SyncPhase::Writing, written, None, "writing to cache");
    }

    Ok(written)
}

struct LeaderGuard<'a> {
    in_flight: &'a Mutex<HashMap<Manager, Arc<SharedSync>>>,
    manager: Manager,
    share: Arc<SharedSync>,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        // No-op when the sync published normally; covers the dropped-task
        // path so coalesced callers wake up with an error instead of
        // waiting forever.
        self.share.publish(&Err(CoreError::for_manager(
            self.manager,
            CoreErrorKind::SyncAborted,
            "sync task went away before finishing",
        )));
        lock_or_recover(self.in_flight).remove(&self.manager);
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{SyncOrchestrator, SyncOutcome};
    use crate::models::{
        CoreError, CoreErrorKind, CoreResult, Manager, PackageRecord, SyncStatus,
    };
    use crate::orchestration::CancellationToken;
    use crate::persistence::{MigrationStore, PackageStore, SyncStateStore};
    use crate::providers::{
        CatalogBatch, CatalogProvider, FetchSummary, ProgressSink,
    };
    use crate::sqlite::SqliteStore;

    struct ScriptedProvider {
        manager: Manager,
        batches: Vec<Vec<PackageRecord>>,
        fail_after: Option<usize>,
        stale: bool,
        /// Pause before producing anything, to let a second refresh arrive
        /// while this one is still running.
        delay: Option<std::time::Duration>,
        fetch_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(manager: Manager, batches: Vec<Vec<PackageRecord>>) -> Self {
            Self {
                manager,
                batches,
                fail_after: None,
                stale: true,
                delay: None,
                fetch_calls: AtomicUsize::new(0),
            }
        }

        fn records(manager: Manager, ids: &[&str]) -> Vec<PackageRecord> {
            ids.iter()
                .map(|id| PackageRecord::new(manager, *id, *id, "1.0"))
                .collect()
        }
    }

    #[async_trait]
    impl CatalogProvider for ScriptedProvider {
        fn manager(&self) -> Manager {
            self.manager
        }

        async fn fetch_all(
            &self,
            sink: mpsc::Sender<CatalogBatch>,
            _progress: &dyn ProgressSink,
            cancel: &CancellationToken,
        ) -> CoreResult<FetchSummary> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut emitted = 0u64;
            for (index, batch) in self.batches.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(CoreError::for_manager(
                        self.manager,
                        CoreErrorKind::Cancelled,
                        "cancelled",
                    ));
                }
                if self.fail_after == Some(index) {
                    return Err(CoreError::for_manager(
                        self.manager,
                        CoreErrorKind::ProviderUnavailable,
                        "upstream died mid-sync",
                    ));
                }
                emitted += batch.len() as u64;
                let _ = sink
                    .send(CatalogBatch {
                        records: batch.clone(),
                        versions: Vec::new(),
                    })
                    .await;
            }
            Ok(FetchSummary {
                records: emitted,
                parse_failures: 0,
            })
        }

        async fn fetch_one(&self, _package_id: &str) -> CoreResult<Option<PackageRecord>> {
            Ok(None)
        }

        fn is_stale(&self, _last: Option<i64>, _now: i64) -> bool {
            self.stale
        }
    }

    fn harness(
        providers: Vec<Arc<dyn CatalogProvider>>,
    ) -> (tempfile::TempDir, Arc<SqliteStore>, Arc<SyncOrchestrator>) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(SqliteStore::new(dir.path().join("cache.db")));
        store.migrate_to_latest().expect("migrations");
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            store.clone(),
            providers,
            1,
        ));
        (dir, store, orchestrator)
    }

    #[tokio::test]
    async fn successful_sync_writes_records_and_metadata() {
        let provider = Arc::new(ScriptedProvider::new(
            Manager::Chocolatey,
            vec![
                ScriptedProvider::records(Manager::Chocolatey, &["python", "vlc"]),
                ScriptedProvider::records(Manager::Chocolatey, &["7zip"]),
            ],
        ));
        let (_dir, store, orchestrator) = harness(vec![provider]);

        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = orchestrator
            .refresh_one(Manager::Chocolatey, true, tx, CancellationToken::new())
            .await
            .expect("sync runs");

        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                status: SyncStatus::Success,
                records: 3,
                parse_failures: 0
            }
        );
        assert_eq!(store.package_count(Manager::Chocolatey).unwrap(), 3);
        let metadata = store.sync_metadata(Manager::Chocolatey).unwrap();
        assert_eq!(metadata.last_sync_status, Some(SyncStatus::Success));
        assert_eq!(metadata.package_count, 3);
    }

    #[tokio::test]
    async fn fresh_slice_short_circuits_without_force() {
        let provider = Arc::new(ScriptedProvider {
            stale: false,
            ..ScriptedProvider::new(
                Manager::Chocolatey,
                vec![ScriptedProvider::records(Manager::Chocolatey, &["python"])],
            )
        });
        let (_dir, _store, orchestrator) = harness(vec![provider.clone()]);

        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = orchestrator
            .refresh_one(Manager::Chocolatey, false, tx, CancellationToken::new())
            .await
            .expect("gate evaluates");
        assert_eq!(outcome, SyncOutcome::Fresh);
        assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provider_failure_before_any_batch_keeps_the_prior_slice() {
        let good = Arc::new(ScriptedProvider::new(
            Manager::Chocolatey,
            vec![ScriptedProvider::records(Manager::Chocolatey, &["python", "vlc"])],
        ));
        let (_dir, store, orchestrator) = harness(vec![good]);

        let (tx, _rx) = mpsc::unbounded_channel();
        orchestrator
            .refresh_one(Manager::Chocolatey, true, tx, CancellationToken::new())
            .await
            .expect("seed sync");
        assert_eq!(store.package_count(Manager::Chocolatey).unwrap(), 2);

        // Second orchestrator whose provider dies before producing anything.
        let dying = Arc::new(ScriptedProvider {
            fail_after: Some(0),
            ..ScriptedProvider::new(
                Manager::Chocolatey,
                vec![ScriptedProvider::records(Manager::Chocolatey, &["ignored"])],
            )
        });
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            store.clone(),
            vec![dying as Arc<dyn CatalogProvider>],
            1,
        ));

        let (tx, _rx) = mpsc::unbounded_channel();
        let error = orchestrator
            .refresh_one(Manager::Chocolatey, true, tx, CancellationToken::new())
            .await
            .expect_err("provider dies");
        assert_eq!(error.kind, CoreErrorKind::ProviderUnavailable);

        // Prior slice untouched, failure recorded.
        assert_eq!(store.package_count(Manager::Chocolatey).unwrap(), 2);
        let metadata = store.sync_metadata(Manager::Chocolatey).unwrap();
        assert_eq!(metadata.last_sync_status, Some(SyncStatus::Failed));
    }

    #[tokio::test]
    async fn cancellation_keeps_committed_batches_and_marks_failed() {
        let provider = Arc::new(ScriptedProvider::new(
            Manager::Chocolatey,
            vec![ScriptedProvider::records(Manager::Chocolatey, &["python"])],
        ));
        let (_dir, store, orchestrator) = harness(vec![provider]);

        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        // Cancel before the provider starts its (single) batch loop check
        // happens per batch; cancel after creation means the provider errors
        // on its first check.
        cancel.cancel();
        let error = orchestrator
            .refresh_one(Manager::Chocolatey, true, tx, cancel)
            .await
            .expect_err("cancelled");
        assert_eq!(error.kind, CoreErrorKind::SyncAborted);

        let metadata = store.sync_metadata(Manager::Chocolatey).unwrap();
        assert_eq!(metadata.last_sync_status, Some(SyncStatus::Failed));

        // A later forced refresh recovers fully.
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = orchestrator
            .refresh_one(Manager::Chocolatey, true, tx, CancellationToken::new())
            .await
            .expect("recovery sync");
        assert!(matches!(outcome, SyncOutcome::Completed { records: 1, .. }));
        assert_eq!(store.package_count(Manager::Chocolatey).unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce_onto_one_sync() {
        let provider = Arc::new(ScriptedProvider {
            delay: Some(std::time::Duration::from_millis(100)),
            ..ScriptedProvider::new(
                Manager::Chocolatey,
                vec![ScriptedProvider::records(Manager::Chocolatey, &["python"])],
            )
        });
        let (_dir, store, orchestrator) = harness(vec![provider.clone()]);

        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let (first, second) = tokio::join!(
            orchestrator.refresh_one(Manager::Chocolatey, true, tx_a, CancellationToken::new()),
            orchestrator.refresh_one(Manager::Chocolatey, true, tx_b, CancellationToken::new()),
        );

        // Both callers observe the one sync's outcome; the provider was
        // fetched exactly once and the slice was written exactly once.
        let first = first.expect("leading sync completes");
        let second = second.expect("coalesced caller completes");
        assert_eq!(first, second);
        assert_eq!(
            first,
            SyncOutcome::Completed {
                status: SyncStatus::Success,
                records: 1,
                parse_failures: 0
            }
        );
        assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.package_count(Manager::Chocolatey).unwrap(), 1);

        // With the first sync finished, a new refresh runs on its own.
        let (tx, _rx) = mpsc::unbounded_channel();
        orchestrator
            .refresh_one(Manager::Chocolatey, true, tx, CancellationToken::new())
            .await
            .expect("fresh sync after the shared one finished");
        assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn coalesced_callers_see_the_leading_syncs_failure() {
        let dying = Arc::new(ScriptedProvider {
            delay: Some(std::time::Duration::from_millis(100)),
            fail_after: Some(0),
            ..ScriptedProvider::new(
                Manager::Chocolatey,
                vec![ScriptedProvider::records(Manager::Chocolatey, &["ignored"])],
            )
        });
        let (_dir, _store, orchestrator) = harness(vec![dying.clone()]);

        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let (first, second) = tokio::join!(
            orchestrator.refresh_one(Manager::Chocolatey, true, tx_a, CancellationToken::new()),
            orchestrator.refresh_one(Manager::Chocolatey, true, tx_b, CancellationToken::new()),
        );

        let first = first.expect_err("leading sync fails");
        let second = second.expect_err("coalesced caller sees the same failure");
        assert_eq!(first.kind, CoreErrorKind::ProviderUnavailable);
        assert_eq!(first, second);
        assert_eq!(dying.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_all_reports_per_provider_results() {
        let choco = Arc::new(ScriptedProvider::new(
            Manager::Chocolatey,
            vec![ScriptedProvider::records(Manager::Chocolatey, &["python"])],
        ));
        let cargo = Arc::new(ScriptedProvider::new(
            Manager::Cargo,
            vec![ScriptedProvider::records(Manager::Cargo, &["serde", "tokio"])],
        ));
        let (_dir, store, orchestrator) = harness(vec![choco, cargo]);

        let (tx, _rx) = mpsc::unbounded_channel();
        let results = orchestrator
            .refresh_all(true, tx, CancellationToken::new())
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, outcome)| outcome.is_ok()));
        assert_eq!(store.package_count(Manager::Chocolatey).unwrap(), 1);
        assert_eq!(store.package_count(Manager::Cargo).unwrap(), 2);
    }
}
