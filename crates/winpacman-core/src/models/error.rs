use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::models::{Manager, OperationKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    /// A provider's data source is unreachable: network failure, binary
    /// missing from PATH, configured path absent.
    ProviderUnavailable,
    /// Malformed manifest or unexpected upstream schema. Surfaced per
    /// record; never aborts a sync on its own.
    ProviderParse,
    /// A sync ended early through cancellation or fatal I/O.
    SyncAborted,
    /// The cache database refuses to open or its FTS index is inconsistent.
    CacheCorrupt,
    /// Non-zero exit from an install/uninstall subprocess.
    OperationFailed,
    /// Install/uninstall deadline exceeded; partial output is in the message.
    OperationTimeout,
    /// Uninstall requested for a record whose manager is `unknown`.
    UnattributedPackage,
    /// The underlying manager reported an elevation-required failure.
    PermissionDenied,
    /// A recognized configuration option holds an out-of-range value.
    ConfigInvalid,
    StorageFailure,
    Cancelled,
    InvalidInput,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoreError {
    pub manager: Option<Manager>,
    pub operation: Option<OperationKind>,
    pub kind: CoreErrorKind,
    pub message: String,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            manager: None,
            operation: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_manager(manager: Manager, kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            manager: Some(manager),
            operation: None,
            kind,
            message: message.into(),
        }
    }

    pub fn operation(mut self, operation: OperationKind) -> Self {
        self.operation = Some(operation);
        self
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for CoreError {}
