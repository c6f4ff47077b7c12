use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

use crate::models::{CoreResult, Manager, PackageRecord};

/// Installed-inventory helper for Scoop, which deliberately stays out of
/// the registry: every `apps\<name>\current\` directory is one installed
/// package, with the version in `current\manifest.json`.
pub struct ScoopAppsScanner {
    apps_root: PathBuf,
}

#[derive(Debug, Deserialize)]
struct InstalledManifest {
    version: Option<String>,
}

impl ScoopAppsScanner {
    pub fn new(apps_root: impl Into<PathBuf>) -> Self {
        Self {
            apps_root: apps_root.into(),
        }
    }

    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join("scoop").join("apps"))
    }

    /// A host without Scoop yields an empty inventory, not an error.
    pub fn scan(&self) -> CoreResult<Vec<PackageRecord>> {
        let Ok(entries) = std::fs::read_dir(&self.apps_root) else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let app_dir = entry.path();
            if !app_dir.is_dir() {
                continue;
            }
            let current = app_dir.join("current");
            if !current.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let version = std::fs::read_to_string(current.join("manifest.json"))
                .ok()
                .and_then(|text| serde_json::from_str::<InstalledManifest>(&text).ok())
                .and_then(|manifest| manifest.version)
                .unwrap_or_else(|| "unknown".to_string());

            let mut record =
                PackageRecord::new(Manager::Scoop, name.clone(), name, version.clone());
            record.is_installed = true;
            record.installed_version = Some(version);
            record.install_source = Some(Manager::Scoop);
            record.install_location = Some(current.to_string_lossy().into_owned());
            record.regenerate_search_tokens();
            records.push(record);
        }

        debug!(count = records.len(), "scoop apps scan complete");
        Ok(records)
    }
}
