pub mod resolver;
pub mod scoop_apps;
pub mod uninstall_scan;

pub use resolver::{
    ChocolateyEvidence, ChocolateyStateDir, ManagerResolver, ResolutionSummary, WingetEvidence,
    WingetTrackingDb,
};
pub use scoop_apps::ScoopAppsScanner;
pub use uninstall_scan::{
    FsProbe, PathProbe, RawUninstallEntry, RegCommandView, RegistryView, UNINSTALL_ROOTS,
    extract_install_dir, find_install_path, fingerprint, parse_reg_dump, to_package_record,
};

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::models::{CoreError, CoreErrorKind, CoreResult, SyncPhase};
use crate::orchestration::CancellationToken;
use crate::persistence::PackageStore;
use crate::providers::ProgressSink;

/// Drives one full installed-inventory pass: registry scan, Scoop scan,
/// manager resolution, then a single merge transaction into the cache.
pub struct InventoryService {
    registry: Arc<dyn RegistryView>,
    scoop: ScoopAppsScanner,
    resolver: ManagerResolver,
    store: Arc<dyn PackageStore>,
    probe: Arc<dyn PathProbe>,
}

impl InventoryService {
    pub fn new(
        registry: Arc<dyn RegistryView>,
        scoop: ScoopAppsScanner,
        resolver: ManagerResolver,
        store: Arc<dyn PackageStore>,
        probe: Arc<dyn PathProbe>,
    ) -> Self {
        Self {
            registry,
            scoop,
            resolver,
            store,
            probe,
        }
    }

    /// Returns how many installed records were merged.
    pub async fn refresh_installed(
        &self,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> CoreResult<u64> {
        progress.emit(SyncPhase::Starting, 0, None, "scanning installed applications");

        let mut records = Vec::new();
        let mut seen_names: HashSet<String> = HashSet::new();

        for root in UNINSTALL_ROOTS {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            let entries = self.registry.query_uninstall_root(root).await?;
            progress.emit(
                SyncPhase::Fetching,
                records.len() as u64,
                None,
                &format!("scanned {root}"),
            );
            for entry in &entries {
                // The same app often registers in both the native and the
                // WOW6432Node hive.
                if !seen_names.insert(entry.display_name.to_lowercase()) {
                    continue;
                }
                records.push(to_package_record(entry, self.probe.as_ref()));
            }
        }

        for record in self.scoop.scan()? {
            if seen_names.insert(record.package_id.to_lowercase()) {
                records.push(record);
            }
        }

        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        progress.emit(
            SyncPhase::Parsing,
            records.len() as u64,
            None,
            "attributing records to managers",
        );
        let resolution = self.resolver.resolve(&mut records)?;

        progress.emit(
            SyncPhase::Writing,
            records.len() as u64,
            None,
            "merging installed state into the cache",
        );
        self.store.sync_installed(&records)?;

        info!(
            installed = records.len(),
            resolved = resolution.resolved,
            downgraded = resolution.downgraded,
            "installed inventory refreshed"
        );
        progress.emit(
            SyncPhase::Done,
            records.len() as u64,
            Some(records.len() as u64),
            "installed inventory refreshed",
        );
        Ok(records.len() as u64)
    }
}

fn cancelled() -> CoreError {
    CoreError::new(CoreErrorKind::Cancelled, "installed inventory scan cancelled")
}
