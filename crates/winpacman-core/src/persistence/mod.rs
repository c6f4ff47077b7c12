use crate::models::{
    CoreResult, Freshness, Manager, PackageRecord, PackageVersion, SyncMetadata, SyncStatus,
};

/// A hit from `find_manager`: the canonical identity of a catalog row. The
/// resolver rewrites display-name ids from the registry to `package_id`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CatalogHit {
    pub manager: Manager,
    pub package_id: String,
    pub name: String,
}

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> CoreResult<i64>;

    fn migrate_to_latest(&self) -> CoreResult<()>;
}

/// The aggregated catalog plus installed-state merge operations.
///
/// Refresh protocol: `refresh_started`, then `insert_batch` once per batch in
/// production order (`first_batch = true` exactly once — that transaction
/// also deletes the provider's previous slice, so a sync that fails before
/// its first batch leaves the prior slice untouched), then
/// `refresh_finished` with the final status.
pub trait PackageStore: Send + Sync {
    fn refresh_started(&self, provider: Manager, started_at: i64) -> CoreResult<()>;

    fn insert_batch(
        &self,
        provider: Manager,
        records: &[PackageRecord],
        versions: &[PackageVersion],
        first_batch: bool,
    ) -> CoreResult<()>;

    fn refresh_finished(
        &self,
        provider: Manager,
        status: SyncStatus,
        finished_at: i64,
        error_message: Option<&str>,
    ) -> CoreResult<()>;

    fn search(
        &self,
        query: &str,
        managers: Option<&[Manager]>,
        limit: usize,
    ) -> CoreResult<Vec<PackageRecord>>;

    fn list_available(&self, manager: Option<Manager>, limit: usize)
    -> CoreResult<Vec<PackageRecord>>;

    fn get_installed(
        &self,
        managers: Option<&[Manager]>,
        source: Option<Manager>,
    ) -> CoreResult<Vec<PackageRecord>>;

    fn get_package(&self, package_id: &str, manager: Manager) -> CoreResult<Option<PackageRecord>>;

    fn find_manager(&self, package_id: &str, name: &str) -> CoreResult<Option<CatalogHit>>;

    /// One transaction: clear every installed-state flag, then merge the
    /// given inventory records — update the matching `(package_id, manager)`
    /// row, or insert a fresh record with `manager = install_source`.
    fn sync_installed(&self, records: &[PackageRecord]) -> CoreResult<()>;

    fn upsert_one(&self, record: &PackageRecord) -> CoreResult<()>;

    fn versions_of(&self, package_id: &str, manager: Manager) -> CoreResult<Vec<String>>;

    fn package_count(&self, provider: Manager) -> CoreResult<u64>;
}

pub trait SyncStateStore: Send + Sync {
    fn sync_metadata(&self, provider: Manager) -> CoreResult<SyncMetadata>;

    fn freshness(&self, provider: Manager) -> CoreResult<Freshness>;

    fn all_freshness(&self) -> CoreResult<Vec<Freshness>>;
}
