pub mod error;
pub mod manager;
pub mod operation;
pub mod package;
pub mod progress;
pub mod sync;

pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use manager::Manager;
pub use operation::{HistoryEntry, OperationKind, OperationRequest, OperationResult};
pub use package::{PackageRecord, PackageVersion, derive_search_tokens};
pub use progress::{OperationEvent, OperationPhase, SyncEvent, SyncPhase};
pub use sync::{Freshness, SyncMetadata, SyncStatus};
