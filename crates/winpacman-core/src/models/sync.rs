use serde::{Deserialize, Serialize};

use crate::models::Manager;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(raw: &str) -> Option<SyncStatus> {
        match raw {
            "success" => Some(SyncStatus::Success),
            "partial" => Some(SyncStatus::Partial),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Per-provider sync bookkeeping, unique by provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncMetadata {
    pub provider: Manager,
    pub last_sync_started_at: Option<i64>,
    pub last_sync_finished_at: Option<i64>,
    pub last_sync_status: Option<SyncStatus>,
    pub package_count: u64,
    pub error_message: Option<String>,
}

impl SyncMetadata {
    pub fn empty(provider: Manager) -> Self {
        Self {
            provider,
            last_sync_started_at: None,
            last_sync_finished_at: None,
            last_sync_status: None,
            package_count: 0,
            error_message: None,
        }
    }
}

/// What the facade reports per provider when asked how fresh the cache is.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Freshness {
    pub provider: Manager,
    pub last_sync_at: Option<i64>,
    pub package_count: u64,
    pub status: Option<SyncStatus>,
}
