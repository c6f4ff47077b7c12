use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// How often a provider's catalog is refreshed automatically.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncInterval {
    Daily,
    Weekly,
    OnDemand,
}

impl SyncInterval {
    pub fn as_max_age(self) -> Option<Duration> {
        match self {
            SyncInterval::Daily => Some(Duration::from_secs(24 * 60 * 60)),
            SyncInterval::Weekly => Some(Duration::from_secs(7 * 24 * 60 * 60)),
            SyncInterval::OnDemand => None,
        }
    }
}

/// Persisted and restored by the GUI; the core only stores it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowState {
    pub width: u32,
    pub height: u32,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub maximized: bool,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 700,
            x: None,
            y: None,
            maximized: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UiConfig {
    pub window_state: WindowState,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncIntervals {
    pub winget: SyncInterval,
    pub chocolatey: SyncInterval,
    pub scoop: SyncInterval,
    pub npm: SyncInterval,
    pub cargo: SyncInterval,
}

impl Default for SyncIntervals {
    fn default() -> Self {
        Self {
            winget: SyncInterval::Daily,
            chocolatey: SyncInterval::Weekly,
            scoop: SyncInterval::OnDemand,
            npm: SyncInterval::OnDemand,
            cargo: SyncInterval::OnDemand,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub intervals: SyncIntervals,
    /// Freshness budget in days for the scheduled catalogs.
    pub max_age_days: MaxAgeDays,
    /// Local clone of the winget-pkgs repository; no WinGet catalog sync
    /// without it.
    pub winget_manifest_root: Option<PathBuf>,
    /// Keyword seeds for the npm/crates.io popular sets. An input, not a
    /// design decision, hence configurable.
    pub npm_keywords: Vec<String>,
    pub cargo_keywords: Vec<String>,
    /// Run `refresh_all` with bounded parallelism instead of sequentially.
    pub parallel_refresh: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            intervals: SyncIntervals::default(),
            max_age_days: MaxAgeDays::default(),
            winget_manifest_root: None,
            npm_keywords: default_npm_keywords(),
            cargo_keywords: default_cargo_keywords(),
            parallel_refresh: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxAgeDays {
    pub winget: u32,
    pub chocolatey: u32,
}

impl Default for MaxAgeDays {
    fn default() -> Self {
        Self {
            winget: 1,
            chocolatey: 7,
        }
    }
}

const MAX_AGE_DAYS_CEILING: u32 = 365;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub ui: UiConfig,
    pub sync: SyncConfig,
    /// Surface raw install/uninstall captures to the user.
    pub verbose_output: bool,
}

impl AppConfig {
    /// Load from `config.json`. A missing file yields defaults; an
    /// unreadable one yields defaults with a warning. Unknown keys are
    /// ignored by deserialization; recognized options holding out-of-range
    /// values fall back to their defaults with a warning.
    pub fn load(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<AppConfig>(&text) {
                Ok(config) => config,
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "config file is invalid, using defaults");
                    AppConfig::default()
                }
            },
            Err(_) => AppConfig::default(),
        };
        config.validate();
        config
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|error| std::io::Error::other(error.to_string()))?;
        std::fs::write(path, json)
    }

    /// Clamp recognized options to their valid ranges, warning per field.
    pub fn validate(&mut self) {
        let defaults = MaxAgeDays::default();
        if self.sync.max_age_days.winget == 0
            || self.sync.max_age_days.winget > MAX_AGE_DAYS_CEILING
        {
            warn!(
                value = self.sync.max_age_days.winget,
                "sync.max_age_days.winget out of range, falling back to default"
            );
            self.sync.max_age_days.winget = defaults.winget;
        }
        if self.sync.max_age_days.chocolatey == 0
            || self.sync.max_age_days.chocolatey > MAX_AGE_DAYS_CEILING
        {
            warn!(
                value = self.sync.max_age_days.chocolatey,
                "sync.max_age_days.chocolatey out of range, falling back to default"
            );
            self.sync.max_age_days.chocolatey = defaults.chocolatey;
        }

        if self.ui.window_state.width < 200 || self.ui.window_state.height < 150 {
            warn!("ui.window_state below minimum size, falling back to default");
            self.ui.window_state = WindowState::default();
        }
    }

    pub fn winget_max_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.sync.max_age_days.winget) * 24 * 60 * 60)
    }

    pub fn chocolatey_max_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.sync.max_age_days.chocolatey) * 24 * 60 * 60)
    }
}

fn default_npm_keywords() -> Vec<String> {
    [
        "react", "vue", "angular", "typescript", "webpack", "eslint", "express", "cli",
        "testing", "framework",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_cargo_keywords() -> Vec<String> {
    [
        "cli", "web", "async", "serde", "parser", "http", "database", "game", "graphics",
        "tokio",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, SyncInterval};

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = AppConfig::load(&dir.path().join("config.json"));
        assert_eq!(config.sync.intervals.winget, SyncInterval::Daily);
        assert_eq!(config.sync.intervals.chocolatey, SyncInterval::Weekly);
        assert_eq!(config.sync.max_age_days.winget, 1);
        assert!(!config.verbose_output);
        assert!(!config.sync.npm_keywords.is_empty());
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config").join("config.json");

        let mut config = AppConfig::default();
        config.verbose_output = true;
        config.sync.intervals.npm = SyncInterval::Weekly;
        config.ui.window_state.width = 1440;
        config.save(&path).expect("save");

        let loaded = AppConfig::load(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn unknown_keys_are_ignored_on_read() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"verbose_output":true,"telemetry":{"enabled":true},"sync":{"shiny_new_option":1}}"#,
        )
        .expect("seed");

        let config = AppConfig::load(&path);
        assert!(config.verbose_output);
        assert_eq!(config.sync.max_age_days.chocolatey, 7);
    }

    #[test]
    fn out_of_range_values_fall_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"sync":{"max_age_days":{"winget":0,"chocolatey":9999}},"ui":{"window_state":{"width":10,"height":10}}}"#,
        )
        .expect("seed");

        let config = AppConfig::load(&path);
        assert_eq!(config.sync.max_age_days.winget, 1);
        assert_eq!(config.sync.max_age_days.chocolatey, 7);
        assert_eq!(config.ui.window_state.width, 1000);
    }

    #[test]
    fn malformed_config_is_defaults_not_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").expect("seed");
        let config = AppConfig::load(&path);
        assert_eq!(config, AppConfig::default());
    }
}
