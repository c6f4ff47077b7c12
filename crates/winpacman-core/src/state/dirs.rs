use std::path::{Path, PathBuf};

use crate::models::{CoreError, CoreErrorKind, CoreResult};

const APP_DIR_NAME: &str = "winpacman";

/// Application directory layout: `config/`, `data/` and `cache/` under one
/// per-user root (`%LOCALAPPDATA%\winpacman` on Windows, the XDG data dir
/// elsewhere).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppDirs {
    pub config: PathBuf,
    pub data: PathBuf,
    pub cache: PathBuf,
}

impl AppDirs {
    pub fn resolve() -> CoreResult<Self> {
        let base = dirs::data_local_dir()
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    "cannot determine the per-user application data directory",
                )
            })?
            .join(APP_DIR_NAME);
        Ok(Self::under(base))
    }

    /// Root everything under one directory; tests point this at a temp dir.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config: root.join("config"),
            data: root.join("data"),
            cache: root.join("cache"),
        }
    }

    pub fn ensure_created(&self) -> CoreResult<()> {
        for dir in [&self.config, &self.data, &self.cache] {
            std::fs::create_dir_all(dir).map_err(|error| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    format!("cannot create '{}': {error}", dir.display()),
                )
            })?;
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.json")
    }

    pub fn database_file(&self) -> PathBuf {
        self.data.join("metadata_cache.db")
    }

    pub fn history_file(&self) -> PathBuf {
        self.data.join("history.json")
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::AppDirs;

    #[test]
    fn layout_matches_the_config_data_cache_split() {
        let dirs = AppDirs::under("/tmp/winpacman-test");
        assert!(dirs.config_file().ends_with("config/config.json"));
        assert!(dirs.database_file().ends_with("data/metadata_cache.db"));
        assert!(dirs.history_file().ends_with("data/history.json"));
    }

    #[test]
    fn ensure_created_builds_the_tree() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let dirs = AppDirs::under(tmp.path().join("app"));
        dirs.ensure_created().expect("mkdir");
        assert!(dirs.config.is_dir());
        assert!(dirs.data.is_dir());
        assert!(dirs.cache.is_dir());
    }
}
