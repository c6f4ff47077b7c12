pub mod power;
pub mod sync;

pub use power::KeepAwakeGuard;
pub use sync::{SyncOrchestrator, SyncOutcome};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::models::{Manager, SyncEvent, SyncPhase};
use crate::providers::ProgressSink;

/// Cooperative cancellation flag shared between a stream handle and the
/// work it controls.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Forwards sync progress to a subscriber, coalescing bursts so at most
/// ~20 events/s reach the channel. Phase transitions and terminal events
/// always pass.
pub struct ProgressEmitter {
    provider: Manager,
    tx: mpsc::UnboundedSender<SyncEvent>,
    min_interval: Duration,
    state: Mutex<EmitState>,
}

struct EmitState {
    last_emit: Option<Instant>,
    last_phase: Option<SyncPhase>,
}

impl ProgressEmitter {
    pub fn new(provider: Manager, tx: mpsc::UnboundedSender<SyncEvent>) -> Self {
        Self {
            provider,
            tx,
            min_interval: Duration::from_millis(50),
            state: Mutex::new(EmitState {
                last_emit: None,
                last_phase: None,
            }),
        }
    }

    fn should_forward(&self, phase: SyncPhase) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let phase_changed = state.last_phase != Some(phase);
        let due = state
            .last_emit
            .map(|at| at.elapsed() >= self.min_interval)
            .unwrap_or(true);

        if phase_changed || phase.is_terminal() || due {
            state.last_emit = Some(Instant::now());
            state.last_phase = Some(phase);
            true
        } else {
            false
        }
    }
}

impl ProgressSink for ProgressEmitter {
    fn emit(&self, phase: SyncPhase, current: u64, total: Option<u64>, message: &str) {
        if !self.should_forward(phase) {
            return;
        }
        let _ = self.tx.send(SyncEvent {
            provider: self.provider,
            phase,
            current,
            total,
            message: message.to_string(),
        });
    }
}
