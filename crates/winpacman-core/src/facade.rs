//! Core API surface for the presentation layer.
//!
//! Every call is non-blocking: queries run on the blocking pool, refreshes
//! and operations return stream handles carrying typed events plus a
//! cancellation token. The GUI thread never touches the database or a
//! subprocess directly.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::warn;

use crate::execution::{CommandRunner, CommandSpec, TokioCommandRunner};
use crate::inventory::{
    ChocolateyStateDir, FsProbe, InventoryService, ManagerResolver, RegCommandView,
    ScoopAppsScanner, WingetTrackingDb,
};
use crate::models::{
    CoreError, CoreErrorKind, CoreResult, Freshness, HistoryEntry, Manager, OperationEvent,
    OperationKind, OperationRequest, OperationResult, PackageRecord, SyncEvent,
};
use crate::operations::{HistoryLog, OperationEngine};
use crate::orchestration::{CancellationToken, ProgressEmitter, SyncOrchestrator, SyncOutcome};
use crate::persistence::{MigrationStore, PackageStore, SyncStateStore};
use crate::providers::{
    CargoProvider, CatalogProvider, ChocolateyProvider, HttpCargoIndexSource, HttpChocolateyFeed,
    HttpClient, HttpNpmApi, NpmProvider, ScoopProvider, WingetProvider,
};
use crate::providers::cargo::{CRATES_IO_API_BASE, SPARSE_INDEX_BASE};
use crate::providers::chocolatey::COMMUNITY_FEED_BASE;
use crate::providers::npm::REGISTRY_BASE;
use crate::sqlite::SqliteStore;
use crate::state::{AppConfig, AppDirs};

/// Event stream for a catalog or inventory refresh. Dropping the stream
/// does not cancel the work; `cancel()` does, cooperatively.
pub struct SyncStream {
    pub events: mpsc::UnboundedReceiver<SyncEvent>,
    cancel: CancellationToken,
    pub completion: JoinHandle<CoreResult<Vec<(Manager, SyncOutcome)>>>,
}

impl SyncStream {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Event stream for a single install/uninstall.
pub struct OperationStream {
    pub events: mpsc::UnboundedReceiver<OperationEvent>,
    abort: AbortHandle,
    pub completion: JoinHandle<CoreResult<OperationResult>>,
}

impl OperationStream {
    /// Terminates the in-flight subprocess and discards its output.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

pub struct Core {
    store: Arc<SqliteStore>,
    orchestrator: Arc<SyncOrchestrator>,
    engine: Arc<OperationEngine>,
    inventory: Arc<InventoryService>,
    history: Arc<HistoryLog>,
    runner: Arc<dyn CommandRunner>,
    config: AppConfig,
}

impl Core {
    /// Wire the production stack against the standard directories. Must be
    /// called from within a tokio runtime.
    pub fn open(dirs: &AppDirs, config: AppConfig) -> CoreResult<Arc<Self>> {
        dirs.ensure_created()?;

        let store = Arc::new(SqliteStore::new(dirs.database_file()));
        store.migrate_to_latest()?;

        let http = Arc::new(HttpClient::new()?);
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);

        let mut providers: Vec<Arc<dyn CatalogProvider>> = Vec::new();
        if let Some(manifest_root) = &config.sync.winget_manifest_root {
            providers.push(Arc::new(
                WingetProvider::new(manifest_root).with_max_age(config.winget_max_age()),
            ));
        }
        providers.push(Arc::new(
            ChocolateyProvider::new(
                Arc::new(HttpChocolateyFeed::new(http.clone(), COMMUNITY_FEED_BASE)),
                COMMUNITY_FEED_BASE,
            )
            .with_max_age(config.chocolatey_max_age()),
        ));
        if let Some(buckets) = ScoopProvider::default_root() {
            providers.push(Arc::new(ScoopProvider::new(buckets)));
        }
        providers.push(Arc::new(NpmProvider::new(
            Arc::new(HttpNpmApi::new(http.clone(), REGISTRY_BASE)),
            config.sync.npm_keywords.clone(),
        )));
        providers.push(Arc::new(CargoProvider::new(
            Arc::new(HttpCargoIndexSource::new(
                http.clone(),
                SPARSE_INDEX_BASE,
                CRATES_IO_API_BASE,
            )),
            config.sync.cargo_keywords.clone(),
        )));

        let parallel_degree = if config.sync.parallel_refresh { 2 } else { 1 };
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            store.clone(),
            providers,
            parallel_degree,
        ));

        let resolver = ManagerResolver::new(
            store.clone(),
            Arc::new(WingetTrackingDb::new(winget_tracking_db_path())),
            Arc::new(ChocolateyStateDir::new(chocolatey_state_dir_path())),
        );
        let scoop_apps = ScoopAppsScanner::default_root()
            .map(ScoopAppsScanner::new)
            .unwrap_or_else(|| ScoopAppsScanner::new("scoop-apps-unavailable"));
        let inventory = Arc::new(InventoryService::new(
            Arc::new(RegCommandView::new(runner.clone())),
            scoop_apps,
            resolver,
            store.clone(),
            Arc::new(FsProbe),
        ));

        let history = Arc::new(HistoryLog::new(dirs.history_file()));
        // A successful operation schedules an inventory rescan so the
        // installed view catches up without user action.
        let rescan_inventory = inventory.clone();
        let engine = Arc::new(
            OperationEngine::new(runner.clone(), history.clone()).with_success_hook(Arc::new(
                move || {
                    let inventory = rescan_inventory.clone();
                    tokio::spawn(async move {
                        let cancel = CancellationToken::new();
                        if let Err(error) = inventory
                            .refresh_installed(&crate::providers::NullProgress, &cancel)
                            .await
                        {
                            warn!(error = %error, "post-operation inventory rescan failed");
                        }
                    });
                },
            )),
        );

        Ok(Self::assemble(
            store,
            orchestrator,
            engine,
            inventory,
            history,
            runner,
            config,
        ))
    }

    /// Explicit-collaborator constructor; tests wire stubbed pieces against
    /// a temp directory.
    pub fn assemble(
        store: Arc<SqliteStore>,
        orchestrator: Arc<SyncOrchestrator>,
        engine: Arc<OperationEngine>,
        inventory: Arc<InventoryService>,
        history: Arc<HistoryLog>,
        runner: Arc<dyn CommandRunner>,
        config: AppConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            orchestrator,
            engine,
            inventory,
            history,
            runner,
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn search(
        &self,
        query: &str,
        managers: Option<Vec<Manager>>,
        limit: Option<usize>,
    ) -> CoreResult<Vec<PackageRecord>> {
        let store = self.store.clone();
        let query = query.to_string();
        run_blocking(move || store.search(&query, managers.as_deref(), limit.unwrap_or(100))).await
    }

    /// Catalog view straight from the cache; never hits a provider.
    pub async fn list_available(
        &self,
        manager: Option<Manager>,
        limit: Option<usize>,
    ) -> CoreResult<Vec<PackageRecord>> {
        let store = self.store.clone();
        run_blocking(move || store.list_available(manager, limit.unwrap_or(10_000))).await
    }

    pub async fn list_installed(
        &self,
        manager: Option<Manager>,
    ) -> CoreResult<Vec<PackageRecord>> {
        let store = self.store.clone();
        run_blocking(move || {
            let filter = manager.map(|manager| vec![manager]);
            store.get_installed(filter.as_deref(), None)
        })
        .await
    }

    pub fn refresh(self: &Arc<Self>, manager: Option<Manager>, force: bool) -> SyncStream {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let orchestrator = self.orchestrator.clone();
        let task_cancel = cancel.clone();

        let completion = tokio::spawn(async move {
            match manager {
                Some(manager) => {
                    let outcome = orchestrator
                        .refresh_one(manager, force, events_tx, task_cancel)
                        .await?;
                    Ok(vec![(manager, outcome)])
                }
                None => {
                    let results = orchestrator.refresh_all(force, events_tx, task_cancel).await;
                    let mut outcomes = Vec::with_capacity(results.len());
                    for (manager, outcome) in results {
                        match outcome {
                            Ok(outcome) => outcomes.push((manager, outcome)),
                            Err(error) => {
                                warn!(%manager, error = %error, "provider refresh failed");
                            }
                        }
                    }
                    Ok(outcomes)
                }
            }
        });

        SyncStream {
            events: events_rx,
            cancel,
            completion,
        }
    }

    /// Registry + Scoop inventory, manager resolution, then the merge.
    pub fn refresh_installed(self: &Arc<Self>) -> SyncStream {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let inventory = self.inventory.clone();
        let task_cancel = cancel.clone();

        let completion = tokio::spawn(async move {
            let emitter = ProgressEmitter::new(Manager::Unknown, events_tx);
            inventory.refresh_installed(&emitter, &task_cancel).await?;
            Ok(Vec::new())
        });

        SyncStream {
            events: events_rx,
            cancel,
            completion,
        }
    }

    pub fn install(
        self: &Arc<Self>,
        package_id: &str,
        manager: Manager,
        version: Option<String>,
    ) -> OperationStream {
        self.spawn_operation(OperationRequest {
            op: OperationKind::Install,
            package_id: package_id.to_string(),
            manager,
            version,
        })
    }

    pub fn uninstall(self: &Arc<Self>, package_id: &str, manager: Manager) -> OperationStream {
        self.spawn_operation(OperationRequest {
            op: OperationKind::Uninstall,
            package_id: package_id.to_string(),
            manager,
            version: None,
        })
    }

    fn spawn_operation(self: &Arc<Self>, request: OperationRequest) -> OperationStream {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = self.engine.clone();

        let completion =
            tokio::spawn(async move { engine.execute(request, Some(events_tx)).await });
        let abort = completion.abort_handle();

        OperationStream {
            events: events_rx,
            abort,
            completion,
        }
    }

    /// Cache first; lazy ecosystems fall back to the provider's
    /// `fetch_one`, and the enriched record is written back.
    pub async fn get_details(
        &self,
        package_id: &str,
        manager: Manager,
    ) -> CoreResult<Option<PackageRecord>> {
        let store = self.store.clone();
        let id = package_id.to_string();
        let cached =
            run_blocking(move || store.get_package(&id, manager)).await?;
        if cached.is_some() {
            return Ok(cached);
        }

        let Some(provider) = self.orchestrator.provider(manager) else {
            return Ok(None);
        };
        let fetched = provider.fetch_one(package_id).await?;
        if let Some(record) = &fetched {
            let store = self.store.clone();
            let record = record.clone();
            run_blocking(move || store.upsert_one(&record)).await?;
        }
        Ok(fetched)
    }

    pub async fn freshness_summary(&self) -> CoreResult<Vec<Freshness>> {
        let store = self.store.clone();
        run_blocking(move || store.all_freshness()).await
    }

    /// Availability probe: is the manager's CLI on PATH at all?
    pub async fn is_manager_available(&self, manager: Manager) -> bool {
        let Some(program) = crate::registry::descriptor(manager).cli_program else {
            return false;
        };
        let spec = CommandSpec::new(program)
            .arg("--version")
            .via_shell(crate::registry::descriptor(manager).cli_via_shell)
            .timeout(std::time::Duration::from_secs(10));
        matches!(self.runner.run(spec).await, Ok(output) if output.success())
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.entries()
    }
}

async fn run_blocking<T, F>(work: F) -> CoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("blocking query task failed: {error}"),
            )
        })?
}

fn winget_tracking_db_path() -> PathBuf {
    let base = std::env::var_os("LOCALAPPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Users\Default\AppData\Local"));
    base.join("Packages")
        .join("Microsoft.DesktopAppInstaller_8wekyb3d8bbwe")
        .join("LocalState")
        .join("installed.db")
}

fn chocolatey_state_dir_path() -> PathBuf {
    let base = std::env::var_os("ProgramData")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"));
    base.join("chocolatey").join(".chocolatey")
}
