use crate::models::{Manager, OperationResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SyncPhase {
    Starting,
    Fetching,
    Parsing,
    Writing,
    Done,
    Failed,
}

impl SyncPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncPhase::Done | SyncPhase::Failed)
    }
}

/// Progress emitted by the sync orchestrator. Events are coalesced before
/// they reach subscribers; phase transitions always pass through.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncEvent {
    pub provider: Manager,
    pub phase: SyncPhase,
    pub current: u64,
    pub total: Option<u64>,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OperationPhase {
    Starting,
    Running,
    Finished,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OperationEvent {
    Progress {
        phase: OperationPhase,
        line: Option<String>,
    },
    Finished(OperationResult),
}
