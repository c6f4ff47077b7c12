use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, Manager, PackageRecord, PackageVersion, SyncPhase,
};
use crate::orchestration::CancellationToken;
use crate::providers::{
    CatalogBatch, CatalogProvider, FetchSummary, ProgressSink, compare_versions, now_unix,
    send_batch, stale_by_age,
};

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const EMIT_BATCH_SIZE: usize = 1_000;
const CANCEL_CHECK_INTERVAL: usize = 500;

/// Catalog provider backed by a local clone of the winget-pkgs manifest
/// repository. The tree is
/// `manifests/<letter>/<Publisher>/<Package>/<Version>/*.yaml`; locale
/// manifests are skipped outright and `(id, version)` duplicates collapse
/// onto the richest manifest seen.
pub struct WingetProvider {
    manifest_root: PathBuf,
    max_age: Duration,
}

impl WingetProvider {
    pub fn new(manifest_root: impl Into<PathBuf>) -> Self {
        Self {
            manifest_root: manifest_root.into(),
            max_age: DEFAULT_MAX_AGE,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    fn manifests_dir(&self) -> PathBuf {
        let nested = self.manifest_root.join("manifests");
        if nested.is_dir() {
            nested
        } else {
            self.manifest_root.clone()
        }
    }
}

#[async_trait]
impl CatalogProvider for WingetProvider {
    fn manager(&self) -> Manager {
        Manager::Winget
    }

    async fn fetch_all(
        &self,
        sink: mpsc::Sender<CatalogBatch>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> CoreResult<FetchSummary> {
        let manifests_dir = self.manifests_dir();
        if !manifests_dir.is_dir() {
            return Err(CoreError::for_manager(
                Manager::Winget,
                CoreErrorKind::ProviderUnavailable,
                format!(
                    "winget manifest clone not found at '{}'",
                    manifests_dir.display()
                ),
            ));
        }

        progress.emit(SyncPhase::Fetching, 0, None, "scanning manifest tree");

        let mut collapsed: HashMap<String, ManifestEntry> = HashMap::new();
        let mut scanned_files = 0usize;
        let mut parse_failures = 0u64;

        for dir_entry in WalkDir::new(&manifests_dir)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !dir_entry.file_type().is_file() {
                continue;
            }
            let path = dir_entry.path();
            match classify_manifest(path) {
                ManifestKind::Locale | ManifestKind::Other => continue,
                ManifestKind::Root | ManifestKind::Installer => {}
            }

            scanned_files += 1;
            if scanned_files % CANCEL_CHECK_INTERVAL == 0 {
                if cancel.is_cancelled() {
                    return Err(cancelled());
                }
                progress.emit(
                    SyncPhase::Parsing,
                    scanned_files as u64,
                    None,
                    "parsing manifests",
                );
                // Long filesystem walks should not starve the runtime.
                tokio::task::yield_now().await;
            }

            let manifest = match read_manifest(path) {
                Ok(Some(manifest)) => manifest,
                Ok(None) => continue,
                Err(_) => {
                    parse_failures += 1;
                    continue;
                }
            };

            collapse(&mut collapsed, manifest);
        }

        debug!(
            scanned_files,
            unique_packages = collapsed.len(),
            parse_failures,
            "winget manifest scan complete"
        );

        let mut summary = FetchSummary {
            records: 0,
            parse_failures,
        };

        let mut batch = CatalogBatch::default();
        for (_, entry) in collapsed {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            let (record, versions) = entry.into_record();
            summary.records += 1;
            batch.records.push(record);
            batch.versions.extend(versions);

            if batch.records.len() >= EMIT_BATCH_SIZE {
                send_batch(Manager::Winget, &sink, std::mem::take(&mut batch)).await?;
            }
        }
        send_batch(Manager::Winget, &sink, batch).await?;

        Ok(summary)
    }

    async fn fetch_one(&self, package_id: &str) -> CoreResult<Option<PackageRecord>> {
        let Some(first) = package_id.chars().next() else {
            return Ok(None);
        };
        let mut package_dir = self
            .manifests_dir()
            .join(first.to_lowercase().to_string());
        for segment in package_id.split('.') {
            package_dir = package_dir.join(segment);
        }
        if !package_dir.is_dir() {
            return Ok(None);
        }

        let mut collapsed: HashMap<String, ManifestEntry> = HashMap::new();
        for dir_entry in WalkDir::new(&package_dir).into_iter().filter_map(Result::ok) {
            if !dir_entry.file_type().is_file() {
                continue;
            }
            if matches!(
                classify_manifest(dir_entry.path()),
                ManifestKind::Locale | ManifestKind::Other
            ) {
                continue;
            }
            if let Ok(Some(manifest)) = read_manifest(dir_entry.path()) {
                collapse(&mut collapsed, manifest);
            }
        }

        Ok(collapsed
            .into_values()
            .find(|entry| entry.package_id == package_id)
            .map(|entry| entry.into_record().0))
    }

    fn is_stale(&self, last_sync_finished_at: Option<i64>, now: i64) -> bool {
        stale_by_age(last_sync_finished_at, now, self.max_age)
    }
}

fn cancelled() -> CoreError {
    CoreError::for_manager(
        Manager::Winget,
        CoreErrorKind::Cancelled,
        "winget sync cancelled",
    )
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ManifestKind {
    Root,
    Installer,
    Locale,
    Other,
}

fn classify_manifest(path: &Path) -> ManifestKind {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return ManifestKind::Other;
    };
    if !(name.ends_with(".yaml") || name.ends_with(".yml")) {
        return ManifestKind::Other;
    }
    if name.contains(".locale.") {
        return ManifestKind::Locale;
    }
    if name.contains(".installer.") {
        return ManifestKind::Installer;
    }
    ManifestKind::Root
}

/// Dynamic-typed YAML scalar: winget manifests occasionally carry numeric
/// tags and versions, which must land as strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum YamlScalar {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl YamlScalar {
    fn into_string(self) -> String {
        match self {
            YamlScalar::String(value) => value,
            YamlScalar::Int(value) => value.to_string(),
            // Debug formatting keeps the trailing ".0" a bare YAML version
            // like `2.0` would otherwise lose.
            YamlScalar::Float(value) => format!("{value:?}"),
            YamlScalar::Bool(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(rename = "PackageIdentifier")]
    package_identifier: Option<String>,
    #[serde(rename = "PackageVersion")]
    package_version: Option<YamlScalar>,
    #[serde(rename = "PackageName")]
    package_name: Option<String>,
    #[serde(rename = "Publisher")]
    publisher: Option<String>,
    #[serde(rename = "ShortDescription")]
    short_description: Option<String>,
    #[serde(rename = "Description")]
    description: Option<String>,
    #[serde(rename = "PackageUrl")]
    package_url: Option<String>,
    #[serde(rename = "License")]
    license: Option<YamlScalar>,
    #[serde(rename = "Tags")]
    tags: Option<Vec<YamlScalar>>,
}

#[derive(Debug)]
struct ParsedManifest {
    package_id: String,
    version: String,
    name: Option<String>,
    publisher: Option<String>,
    description: Option<String>,
    homepage: Option<String>,
    license: Option<String>,
    tags: Vec<String>,
}

fn read_manifest(path: &Path) -> CoreResult<Option<ParsedManifest>> {
    let text = std::fs::read_to_string(path).map_err(|error| {
        CoreError::for_manager(
            Manager::Winget,
            CoreErrorKind::ProviderParse,
            format!("failed to read manifest '{}': {error}", path.display()),
        )
    })?;

    let raw: RawManifest = serde_yml::from_str(&text).map_err(|error| {
        warn!(path = %path.display(), error = %error, "dropping unparseable winget manifest");
        CoreError::for_manager(
            Manager::Winget,
            CoreErrorKind::ProviderParse,
            format!("malformed manifest '{}': {error}", path.display()),
        )
    })?;

    let (Some(package_id), Some(version)) = (raw.package_identifier, raw.package_version) else {
        // Not a package manifest (e.g. a singleton metadata file).
        return Ok(None);
    };

    Ok(Some(ParsedManifest {
        package_id,
        version: version.into_string(),
        name: raw.package_name,
        publisher: raw.publisher,
        description: raw.short_description.or(raw.description),
        homepage: raw.package_url,
        license: raw.license.map(YamlScalar::into_string),
        tags: raw
            .tags
            .into_iter()
            .flatten()
            .map(|scalar| scalar.into_string().to_lowercase())
            .collect(),
    }))
}

#[derive(Debug)]
struct ManifestEntry {
    package_id: String,
    latest: ParsedManifest,
    versions: Vec<String>,
}

impl ManifestEntry {
    fn into_record(self) -> (PackageRecord, Vec<PackageVersion>) {
        let name = self
            .latest
            .name
            .clone()
            .unwrap_or_else(|| self.package_id.clone());
        let mut record = PackageRecord::new(
            Manager::Winget,
            self.package_id.clone(),
            name,
            self.latest.version.clone(),
        );
        record.publisher = self.latest.publisher;
        record.description = self.latest.description;
        record.homepage = self.latest.homepage;
        record.license = self.latest.license;
        record.tags = self.latest.tags;
        record.last_seen_at = Some(now_unix());
        record.regenerate_search_tokens();

        let versions = self
            .versions
            .into_iter()
            .map(|version| PackageVersion {
                package_id: self.package_id.clone(),
                manager: Manager::Winget,
                version,
            })
            .collect();

        (record, versions)
    }
}

fn collapse(collapsed: &mut HashMap<String, ManifestEntry>, manifest: ParsedManifest) {
    match collapsed.get_mut(&manifest.package_id) {
        None => {
            collapsed.insert(
                manifest.package_id.clone(),
                ManifestEntry {
                    package_id: manifest.package_id.clone(),
                    versions: vec![manifest.version.clone()],
                    latest: manifest,
                },
            );
        }
        Some(entry) => {
            let is_new_version = !entry.versions.contains(&manifest.version);
            if is_new_version {
                entry.versions.push(manifest.version.clone());
            }

            let ordering = compare_versions(&manifest.version, &entry.latest.version);
            if ordering == std::cmp::Ordering::Greater {
                entry.latest = manifest;
            } else if ordering == std::cmp::Ordering::Equal && entry.latest.name.is_none() {
                // Same version seen twice (root + installer manifest): keep
                // the one that actually names the package.
                if manifest.name.is_some() {
                    entry.latest = manifest;
                }
            }
        }
    }
}
