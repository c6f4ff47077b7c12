pub mod engine;
pub mod history;

pub use engine::{OperationEngine, command_for};
pub use history::HistoryLog;
