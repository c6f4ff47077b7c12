//! The facade wired end-to-end against a temp directory: search semantics,
//! detail fallback to a provider, operation streams, freshness reporting.

use std::sync::Arc;

use async_trait::async_trait;

use winpacman_core::execution::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use winpacman_core::facade::Core;
use winpacman_core::inventory::{
    ChocolateyEvidence, FsProbe, InventoryService, ManagerResolver, RawUninstallEntry,
    RegistryView, ScoopAppsScanner, WingetEvidence,
};
use winpacman_core::models::{
    CoreResult, Manager, OperationEvent, OperationPhase, PackageRecord, SyncStatus,
};
use winpacman_core::operations::{HistoryLog, OperationEngine};
use winpacman_core::orchestration::SyncOrchestrator;
use winpacman_core::persistence::{MigrationStore, PackageStore};
use winpacman_core::providers::{CargoIndexSource, CargoProvider, CatalogProvider};
use winpacman_core::sqlite::SqliteStore;
use winpacman_core::state::AppConfig;

const INDEX_FIXTURE: &str = include_str!("fixtures/cargo/index_serde.ndjson");

struct NoEvidence;

impl WingetEvidence for NoEvidence {
    fn contains(&self, _package_id: &str) -> Option<bool> {
        None
    }
}

impl ChocolateyEvidence for NoEvidence {
    fn contains(&self, _package_id: &str) -> Option<bool> {
        None
    }
}

struct EmptyRegistry;

#[async_trait]
impl RegistryView for EmptyRegistry {
    async fn query_uninstall_root(&self, _root: &str) -> CoreResult<Vec<RawUninstallEntry>> {
        Ok(Vec::new())
    }
}

struct OkRunner;

#[async_trait]
impl CommandRunner for OkRunner {
    async fn run(&self, _spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        Ok(CommandOutput {
            code: 0,
            stdout: "done".to_string(),
            stderr: String::new(),
        })
    }
}

struct FixtureIndex;

#[async_trait]
impl CargoIndexSource for FixtureIndex {
    async fn index_file(&self, prefix_path: &str) -> CoreResult<Option<String>> {
        if prefix_path == "se/rd/serde" {
            Ok(Some(INDEX_FIXTURE.to_string()))
        } else {
            Ok(None)
        }
    }

    async fn search(&self, _query: &str, _per_page: u32) -> CoreResult<String> {
        Ok(r#"{"crates":[]}"#.to_string())
    }
}

fn build_core(dir: &tempfile::TempDir) -> (Arc<SqliteStore>, Arc<Core>) {
    let store = Arc::new(SqliteStore::new(dir.path().join("data").join("cache.db")));
    store.migrate_to_latest().expect("migrations");

    let providers: Vec<Arc<dyn CatalogProvider>> = vec![Arc::new(CargoProvider::new(
        Arc::new(FixtureIndex),
        vec![],
    ))];
    let orchestrator = Arc::new(SyncOrchestrator::new(
        store.clone(),
        store.clone(),
        providers,
        1,
    ));

    let runner: Arc<dyn CommandRunner> = Arc::new(OkRunner);
    let history = Arc::new(HistoryLog::new(dir.path().join("data").join("history.json")));
    let engine = Arc::new(OperationEngine::new(runner.clone(), history.clone()));

    let inventory = Arc::new(InventoryService::new(
        Arc::new(EmptyRegistry),
        ScoopAppsScanner::new(dir.path().join("no-scoop")),
        ManagerResolver::new(store.clone(), Arc::new(NoEvidence), Arc::new(NoEvidence)),
        store.clone(),
        Arc::new(FsProbe),
    ));

    let core = Core::assemble(
        store.clone(),
        orchestrator,
        engine,
        inventory,
        history,
        runner,
        AppConfig::default(),
    );
    (store, core)
}

fn seeded(store: &Arc<SqliteStore>) {
    let mut vscode = PackageRecord::new(
        Manager::Winget,
        "Microsoft.VisualStudioCode",
        "Visual Studio Code",
        "1.94.0",
    );
    vscode.description = Some("Code editing. Redefined.".to_string());
    vscode.regenerate_search_tokens();

    let mut python = PackageRecord::new(Manager::Chocolatey, "python", "Python", "3.12.6");
    python.description = Some("Python 3.12 programming language".to_string());
    python.tags = vec!["python".to_string(), "3.12".to_string()];
    python.regenerate_search_tokens();

    let mut mingw = PackageRecord::new(Manager::Chocolatey, "mingw", "MinGW", "13.2.0");
    mingw.description = Some("c++ compiler toolchain".to_string());
    mingw.regenerate_search_tokens();

    store
        .insert_batch(Manager::Winget, &[vscode], &[], true)
        .expect("seed winget");
    store
        .insert_batch(Manager::Chocolatey, &[python, mingw], &[], true)
        .expect("seed chocolatey");
}

#[tokio::test]
async fn search_is_case_whitespace_insensitive_and_survives_punctuation() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (store, core) = build_core(&dir);
    seeded(&store);

    let a = core
        .search("Visual Studio Code", None, None)
        .await
        .expect("search");
    let b = core
        .search("visual  studio  code", None, None)
        .await
        .expect("search");
    let c = core
        .search("VISUAL STUDIO CODE", None, None)
        .await
        .expect("search");
    assert_eq!(a.len(), 1);
    assert_eq!(a, b);
    assert_eq!(b, c);

    // Tokens with punctuation are quoted, not rejected.
    let hits = core.search("python 3.12", None, None).await.expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].package_id, "python");

    let cpp = core.search("c++", None, None).await.expect("search");
    assert_eq!(cpp.len(), 1);
    assert_eq!(cpp[0].package_id, "mingw");

    // Nothing queryable: empty result, no error.
    assert!(core.search(".", None, None).await.expect("search").is_empty());

    // Manager filter narrows the result set.
    let choco_only = core
        .search("python", Some(vec![Manager::Chocolatey]), None)
        .await
        .expect("search");
    assert!(
        choco_only
            .iter()
            .all(|record| record.manager == Manager::Chocolatey)
    );
}

#[tokio::test]
async fn get_details_falls_back_to_the_provider_and_caches_the_result() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (store, core) = build_core(&dir);

    // Not in the cache: the cargo provider's sparse-index lookup answers.
    let record = core
        .get_details("serde", Manager::Cargo)
        .await
        .expect("lookup runs")
        .expect("crate found");
    assert_eq!(record.version, "1.0.210");

    // And the enriched record is now cached.
    let cached = store
        .get_package("serde", Manager::Cargo)
        .expect("query")
        .expect("written back");
    assert_eq!(cached.version, "1.0.210");

    assert!(
        core.get_details("missing-crate", Manager::Cargo)
            .await
            .expect("lookup runs")
            .is_none()
    );
}

#[tokio::test]
async fn operation_stream_reports_phases_then_the_result() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (_store, core) = build_core(&dir);

    let mut stream = core.install("ripgrep", Manager::Cargo, None);
    let result = stream
        .completion
        .await
        .expect("task joins")
        .expect("operation runs");
    assert!(result.success);

    let mut phases = Vec::new();
    let mut finished = false;
    while let Ok(event) = stream.events.try_recv() {
        match event {
            OperationEvent::Progress { phase, .. } => phases.push(phase),
            OperationEvent::Finished(result) => {
                finished = true;
                assert!(result.success);
            }
        }
    }
    assert_eq!(
        phases,
        vec![OperationPhase::Starting, OperationPhase::Running]
    );
    assert!(finished);

    // The operation landed in history.
    let history = core.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].package_id, "ripgrep");
    assert!(history[0].success);
}

#[tokio::test]
async fn refresh_installed_on_an_empty_machine_completes_cleanly() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (store, core) = build_core(&dir);

    let stream = core.refresh_installed();
    stream
        .completion
        .await
        .expect("task joins")
        .expect("inventory pass runs");

    assert!(
        core.list_installed(None)
            .await
            .expect("query")
            .is_empty()
    );
    let _ = store;
}

#[tokio::test]
async fn freshness_summary_reflects_sync_metadata() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (store, core) = build_core(&dir);

    store
        .refresh_started(Manager::Cargo, 1_700_000_000)
        .expect("start");
    store
        .insert_batch(
            Manager::Cargo,
            &[PackageRecord::new(Manager::Cargo, "serde", "serde", "1.0.210")],
            &[],
            true,
        )
        .expect("write");
    store
        .refresh_finished(Manager::Cargo, SyncStatus::Success, 1_700_000_050, None)
        .expect("finish");

    let summary = core.freshness_summary().await.expect("summary");
    let cargo = summary
        .iter()
        .find(|entry| entry.provider == Manager::Cargo)
        .expect("cargo entry");
    assert_eq!(cargo.package_count, 1);
    assert_eq!(cargo.status, Some(SyncStatus::Success));
    assert_eq!(cargo.last_sync_at, Some(1_700_000_050));

    let never_synced = summary
        .iter()
        .find(|entry| entry.provider == Manager::Winget)
        .expect("winget entry");
    assert_eq!(never_synced.package_count, 0);
    assert_eq!(never_synced.status, None);
}
