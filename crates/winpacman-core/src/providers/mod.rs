pub mod cargo;
pub mod chocolatey;
pub mod http;
pub mod npm;
pub mod scoop;
pub mod winget;

pub use cargo::{CargoIndexSource, CargoProvider, HttpCargoIndexSource, sparse_index_prefix};
pub use chocolatey::{ChocolateyFeed, ChocolateyProvider, HttpChocolateyFeed};
pub use http::{HttpClient, USER_AGENT_STRING};
pub use npm::{HttpNpmApi, NpmApi, NpmProvider};
pub use scoop::ScoopProvider;
pub use winget::WingetProvider;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::{CoreResult, Manager, PackageRecord, PackageVersion, SyncPhase};
use crate::orchestration::CancellationToken;

/// Records a provider hands to the orchestrator. Version rows ride along
/// with the records that produced them so a batch commits as one unit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CatalogBatch {
    pub records: Vec<PackageRecord>,
    pub versions: Vec<PackageVersion>,
}

impl CatalogBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.versions.is_empty()
    }
}

/// Where providers report fetch/parse progress. Implemented by the
/// orchestrator's coalescing emitter; a no-op implementation exists for
/// direct provider use in tests.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, phase: SyncPhase, current: u64, total: Option<u64>, message: &str);
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn emit(&self, _phase: SyncPhase, _current: u64, _total: Option<u64>, _message: &str) {}
}

/// Summary a provider returns from a completed `fetch_all`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FetchSummary {
    pub records: u64,
    /// Records dropped because they failed normalization. Counted, never
    /// fatal.
    pub parse_failures: u64,
}

/// One ecosystem's catalog fetcher. Providers never touch the cache; they
/// stream batches to the orchestrator and stop at the next batch boundary
/// when cancelled.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    fn manager(&self) -> Manager;

    /// Stream the full catalog as batches. Returns how many records were
    /// emitted. Honors `cancel` between batches; a cancelled fetch returns
    /// `CoreErrorKind::Cancelled`.
    async fn fetch_all(
        &self,
        sink: mpsc::Sender<CatalogBatch>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> CoreResult<FetchSummary>;

    /// On-demand detail lookup for lazy ecosystems and enrichment.
    async fn fetch_one(&self, package_id: &str) -> CoreResult<Option<PackageRecord>>;

    /// Freshness policy: should a non-forced refresh run given the unix
    /// seconds of the last successful sync?
    fn is_stale(&self, last_sync_finished_at: Option<i64>, now: i64) -> bool;
}

/// Send one batch, erroring with `Cancelled` if the receiving side is gone
/// (the orchestrator dropped the stream).
pub(crate) async fn send_batch(
    manager: Manager,
    sink: &mpsc::Sender<CatalogBatch>,
    batch: CatalogBatch,
) -> CoreResult<()> {
    use crate::models::{CoreError, CoreErrorKind};

    if batch.is_empty() {
        return Ok(());
    }
    sink.send(batch).await.map_err(|_| {
        CoreError::for_manager(
            manager,
            CoreErrorKind::Cancelled,
            "catalog consumer went away mid-sync",
        )
    })
}

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Order two version strings: semver when both sides parse, then a
/// numeric dotted comparison, then plain string order.
pub(crate) fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    if let (Ok(left), Ok(right)) = (semver::Version::parse(a), semver::Version::parse(b)) {
        return left.cmp(&right);
    }

    let numeric = |version: &str| -> Option<Vec<u64>> {
        version
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect()
    };
    if let (Some(mut left), Some(mut right)) = (numeric(a), numeric(b)) {
        let width = left.len().max(right.len());
        left.resize(width, 0);
        right.resize(width, 0);
        return left.cmp(&right);
    }

    a.cmp(b)
}

/// Shared freshness rule for scheduled catalogs.
pub(crate) fn stale_by_age(
    last_sync_finished_at: Option<i64>,
    now: i64,
    max_age: std::time::Duration,
) -> bool {
    match last_sync_finished_at {
        Some(finished) => now.saturating_sub(finished) > max_age.as_secs() as i64,
        None => true,
    }
}
