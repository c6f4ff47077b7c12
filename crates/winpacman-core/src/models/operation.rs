use serde::{Deserialize, Serialize};

use crate::models::Manager;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Install,
    Uninstall,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Uninstall => "uninstall",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperationRequest {
    pub op: OperationKind,
    pub package_id: String,
    pub manager: Manager,
    pub version: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// One entry of the bounded operation history kept in `history.json`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub op: OperationKind,
    pub package_id: String,
    pub manager: Manager,
    pub success: bool,
    pub message: String,
    pub timestamp: i64,
}
