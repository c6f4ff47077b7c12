use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, Manager, PackageRecord, SyncPhase,
};
use crate::orchestration::CancellationToken;
use crate::providers::{
    CatalogBatch, CatalogProvider, FetchSummary, ProgressSink, now_unix, send_batch,
};

const EMIT_BATCH_SIZE: usize = 1_000;

/// Catalog provider over the locally checked-out Scoop buckets:
/// `<buckets_root>/<bucket>/bucket/*.json`, one manifest per package.
pub struct ScoopProvider {
    buckets_root: PathBuf,
}

impl ScoopProvider {
    pub fn new(buckets_root: impl Into<PathBuf>) -> Self {
        Self {
            buckets_root: buckets_root.into(),
        }
    }

    /// The conventional location under the user profile.
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join("scoop").join("buckets"))
    }

    fn bucket_manifest_dirs(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.buckets_root) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .map(|entry| {
                let bucket = entry.path();
                let nested = bucket.join("bucket");
                if nested.is_dir() { nested } else { bucket }
            })
            .collect()
    }
}

#[async_trait]
impl CatalogProvider for ScoopProvider {
    fn manager(&self) -> Manager {
        Manager::Scoop
    }

    async fn fetch_all(
        &self,
        sink: mpsc::Sender<CatalogBatch>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> CoreResult<FetchSummary> {
        if !self.buckets_root.is_dir() {
            return Err(CoreError::for_manager(
                Manager::Scoop,
                CoreErrorKind::ProviderUnavailable,
                format!(
                    "scoop buckets not found at '{}'; is Scoop installed?",
                    self.buckets_root.display()
                ),
            ));
        }

        let mut summary = FetchSummary::default();
        let mut batch = CatalogBatch::default();

        for manifest_dir in self.bucket_manifest_dirs() {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            let Ok(entries) = std::fs::read_dir(&manifest_dir) else {
                continue;
            };

            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                match read_bucket_manifest(&path) {
                    Ok(record) => {
                        summary.records += 1;
                        batch.records.push(record);
                        if batch.records.len() >= EMIT_BATCH_SIZE {
                            progress.emit(
                                SyncPhase::Parsing,
                                summary.records,
                                None,
                                "reading bucket manifests",
                            );
                            send_batch(Manager::Scoop, &sink, std::mem::take(&mut batch)).await?;
                            if cancel.is_cancelled() {
                                return Err(cancelled());
                            }
                        }
                    }
                    Err(_) => summary.parse_failures += 1,
                }
            }
        }

        send_batch(Manager::Scoop, &sink, batch).await?;
        debug!(
            records = summary.records,
            parse_failures = summary.parse_failures,
            "scoop bucket scan complete"
        );
        Ok(summary)
    }

    async fn fetch_one(&self, package_id: &str) -> CoreResult<Option<PackageRecord>> {
        for manifest_dir in self.bucket_manifest_dirs() {
            let path = manifest_dir.join(format!("{package_id}.json"));
            if path.is_file() {
                return read_bucket_manifest(&path).map(Some);
            }
        }
        Ok(None)
    }

    /// Scoop's catalog is a local checkout; it is re-read on every explicit
    /// refresh rather than on a timer.
    fn is_stale(&self, _last_sync_finished_at: Option<i64>, _now: i64) -> bool {
        true
    }
}

fn cancelled() -> CoreError {
    CoreError::for_manager(
        Manager::Scoop,
        CoreErrorKind::Cancelled,
        "scoop sync cancelled",
    )
}

/// `license` in bucket manifests is either a plain SPDX string or an
/// object like `{"identifier": "MIT", "url": ...}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LicenseField {
    Text(String),
    Detailed {
        identifier: Option<String>,
        url: Option<String>,
    },
}

impl LicenseField {
    fn into_string(self) -> Option<String> {
        match self {
            LicenseField::Text(text) => Some(text),
            LicenseField::Detailed { identifier, url } => identifier.or(url),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BucketManifest {
    version: Option<String>,
    description: Option<String>,
    homepage: Option<String>,
    license: Option<LicenseField>,
}

fn read_bucket_manifest(path: &Path) -> CoreResult<PackageRecord> {
    let package_id = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .to_string();

    let text = std::fs::read_to_string(path).map_err(|error| {
        CoreError::for_manager(
            Manager::Scoop,
            CoreErrorKind::ProviderParse,
            format!("failed to read manifest '{}': {error}", path.display()),
        )
    })?;
    let manifest: BucketManifest = serde_json::from_str(&text).map_err(|error| {
        warn!(path = %path.display(), error = %error, "dropping unparseable scoop manifest");
        CoreError::for_manager(
            Manager::Scoop,
            CoreErrorKind::ProviderParse,
            format!("malformed manifest '{}': {error}", path.display()),
        )
    })?;

    let mut record = PackageRecord::new(
        Manager::Scoop,
        package_id.clone(),
        package_id,
        manifest.version.unwrap_or_else(|| "unknown".to_string()),
    );
    record.description = manifest.description;
    record.homepage = manifest.homepage;
    record.license = manifest.license.and_then(LicenseField::into_string);
    record.last_seen_at = Some(now_unix());
    record.regenerate_search_tokens();
    Ok(record)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tokio::sync::mpsc;

    use super::ScoopProvider;
    use crate::models::Manager;
    use crate::orchestration::CancellationToken;
    use crate::providers::{CatalogProvider, NullProgress};

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[tokio::test]
    async fn reads_manifests_and_normalizes_license_objects() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path().join("buckets");

        write(
            &root,
            "main/bucket/ripgrep.json",
            r#"{"version":"14.1.0","description":"Line-oriented search tool","homepage":"https://github.com/BurntSushi/ripgrep","license":"MIT"}"#,
        );
        write(
            &root,
            "main/bucket/7zip.json",
            r#"{"version":"24.08","description":"File archiver","homepage":"https://www.7-zip.org/","license":{"identifier":"LGPL-2.1-only","url":"https://www.7-zip.org/license.txt"}}"#,
        );
        write(&root, "main/bucket/broken.json", "{not json");

        let provider = ScoopProvider::new(&root);
        let (tx, mut rx) = mpsc::channel(16);
        let summary = provider
            .fetch_all(tx, &NullProgress, &CancellationToken::new())
            .await
            .expect("scan completes");

        assert_eq!(summary.records, 2);
        assert_eq!(summary.parse_failures, 1);

        let batch = rx.recv().await.expect("one batch");
        let seven_zip = batch
            .records
            .iter()
            .find(|record| record.package_id == "7zip")
            .expect("7zip present");
        assert_eq!(seven_zip.manager, Manager::Scoop);
        assert_eq!(seven_zip.license.as_deref(), Some("LGPL-2.1-only"));

        let ripgrep = batch
            .records
            .iter()
            .find(|record| record.package_id == "ripgrep")
            .expect("ripgrep present");
        assert_eq!(ripgrep.license.as_deref(), Some("MIT"));
        assert_eq!(ripgrep.version, "14.1.0");
    }

    #[tokio::test]
    async fn bucket_without_nested_dir_is_scanned_too() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path().join("buckets");
        write(
            &root,
            "extras/neovim.json",
            r#"{"version":"0.10.1","description":"Vim fork","homepage":"https://neovim.io"}"#,
        );

        let provider = ScoopProvider::new(&root);
        let record = provider
            .fetch_one("neovim")
            .await
            .expect("lookup runs")
            .expect("manifest found");
        assert_eq!(record.version, "0.10.1");
        assert!(record.license.is_none());
    }

    #[tokio::test]
    async fn missing_buckets_root_is_provider_unavailable() {
        let provider = ScoopProvider::new("/nope/scoop/buckets");
        let (tx, _rx) = mpsc::channel(4);
        let error = provider
            .fetch_all(tx, &NullProgress, &CancellationToken::new())
            .await
            .expect_err("no buckets");
        assert_eq!(
            error.kind,
            crate::models::CoreErrorKind::ProviderUnavailable
        );
    }

    #[test]
    fn scoop_is_always_stale() {
        let provider = ScoopProvider::new("/anywhere");
        assert!(provider.is_stale(Some(1_700_000_000), 1_700_000_001));
    }
}
