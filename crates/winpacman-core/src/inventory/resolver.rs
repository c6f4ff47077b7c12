use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::models::{CoreResult, Manager, PackageRecord};
use crate::persistence::PackageStore;

/// Manager-owned evidence consulted to cross-validate a fingerprint.
/// `None` means the evidence source is unavailable, which neither confirms
/// nor contradicts.
pub trait WingetEvidence: Send + Sync {
    fn contains(&self, package_id: &str) -> Option<bool>;
}

pub trait ChocolateyEvidence: Send + Sync {
    fn contains(&self, package_id: &str) -> Option<bool>;
}

/// WinGet's own tracking database
/// (`...\Microsoft.DesktopAppInstaller_8wekyb3d8bbwe\LocalState\installed.db`).
/// Consulted read-only, and only to validate attribution.
pub struct WingetTrackingDb {
    db_path: PathBuf,
}

impl WingetTrackingDb {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

impl WingetEvidence for WingetTrackingDb {
    fn contains(&self, package_id: &str) -> Option<bool> {
        if !self.db_path.is_file() {
            return None;
        }
        let connection = rusqlite::Connection::open_with_flags(
            &self.db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .ok()?;
        let found = connection
            .query_row(
                "SELECT 1 FROM ids WHERE id = ?1 LIMIT 1",
                [package_id],
                |_| Ok(()),
            )
            .is_ok();
        Some(found)
    }
}

/// Chocolatey leaves one folder per installed package under
/// `C:\ProgramData\chocolatey\.chocolatey\`, named `<id>.<version>`.
pub struct ChocolateyStateDir {
    state_dir: PathBuf,
}

impl ChocolateyStateDir {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }
}

impl ChocolateyEvidence for ChocolateyStateDir {
    fn contains(&self, package_id: &str) -> Option<bool> {
        let entries = std::fs::read_dir(&self.state_dir).ok()?;
        let needle = package_id.to_lowercase();
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if name == needle || name.starts_with(&format!("{needle}.")) {
                return Some(true);
            }
        }
        Some(false)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResolutionSummary {
    pub resolved: u64,
    pub downgraded: u64,
}

/// Attributes installed records to managers. Unknown fingerprints are
/// looked up in the catalog; confident fingerprints are checked against
/// manager-owned evidence and downgraded when it disagrees. No attribution
/// is ever invented without one of the two.
pub struct ManagerResolver {
    store: Arc<dyn PackageStore>,
    winget_evidence: Arc<dyn WingetEvidence>,
    chocolatey_evidence: Arc<dyn ChocolateyEvidence>,
}

impl ManagerResolver {
    pub fn new(
        store: Arc<dyn PackageStore>,
        winget_evidence: Arc<dyn WingetEvidence>,
        chocolatey_evidence: Arc<dyn ChocolateyEvidence>,
    ) -> Self {
        Self {
            store,
            winget_evidence,
            chocolatey_evidence,
        }
    }

    pub fn resolve(&self, records: &mut [PackageRecord]) -> CoreResult<ResolutionSummary> {
        let mut summary = ResolutionSummary::default();

        for record in records.iter_mut() {
            if !record.is_installed {
                continue;
            }

            match record.install_source.unwrap_or(Manager::Unknown) {
                Manager::Unknown => {
                    if self.try_catalog_match(record)? {
                        summary.resolved += 1;
                    }
                }
                Manager::Winget => {
                    if self.winget_evidence.contains(&record.package_id) == Some(false) {
                        warn!(
                            package_id = %record.package_id,
                            "winget fingerprint contradicted by installed.db, downgrading"
                        );
                        downgrade(record);
                        summary.downgraded += 1;
                        if self.try_catalog_match(record)? {
                            summary.resolved += 1;
                        }
                    }
                }
                Manager::Chocolatey => {
                    if self.chocolatey_evidence.contains(&record.package_id) == Some(false) {
                        warn!(
                            package_id = %record.package_id,
                            "chocolatey fingerprint contradicted by .chocolatey state, downgrading"
                        );
                        downgrade(record);
                        summary.downgraded += 1;
                        if self.try_catalog_match(record)? {
                            summary.resolved += 1;
                        }
                    }
                }
                // Scoop inventory comes from scoop's own directories and
                // msstore has no catalog to validate against.
                Manager::Scoop | Manager::MsStore | Manager::Npm | Manager::Cargo => {}
            }
        }

        debug!(
            resolved = summary.resolved,
            downgraded = summary.downgraded,
            "manager resolution complete"
        );
        Ok(summary)
    }

    /// Catalog lookup by id, then name. On a hit the record adopts the
    /// catalog's canonical id so the installed row merges onto the catalog
    /// row instead of duplicating it.
    fn try_catalog_match(&self, record: &mut PackageRecord) -> CoreResult<bool> {
        let hit = self
            .store
            .find_manager(&record.package_id, &record.name)?;
        let Some(hit) = hit else {
            return Ok(false);
        };

        debug!(
            from = %record.package_id,
            to = %hit.package_id,
            manager = %hit.manager,
            "resolved installed record against the catalog"
        );
        record.package_id = hit.package_id;
        record.manager = hit.manager;
        record.install_source = Some(hit.manager);
        Ok(true)
    }
}

fn downgrade(record: &mut PackageRecord) {
    record.manager = Manager::Unknown;
    record.install_source = Some(Manager::Unknown);
}
