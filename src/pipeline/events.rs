use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::store::{BuildVerdict, DocumentStatus, GateStatus, RunStatus};

/// Progress notifications pushed to websocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum RunEvent {
    RunCreated {
        run_id: i64,
        subject: String,
    },
    RunStatusChanged {
        run_id: i64,
        status: RunStatus,
        current_phase: i32,
        label: String,
    },
    PhaseCompleted {
        run_id: i64,
        phase: String,
    },
    BatchFinished {
        run_id: i64,
        batch_index: usize,
        total_batches: usize,
        success: bool,
    },
    ChainStepFinished {
        run_id: i64,
        chain_index: usize,
        step: String,
        is_error: bool,
    },
    GateVerdict {
        run_id: i64,
        status: GateStatus,
        coverage_pct: f64,
    },
    BuildFinalized {
        run_id: i64,
        verdict: BuildVerdict,
    },
    JobDeadLettered {
        run_id: i64,
        job_id: i64,
        job_type: String,
        error: String,
    },
    /// An ingested document reached a final state.
    DocumentSettled {
        run_id: i64,
        document_id: i64,
        status: DocumentStatus,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> i64 {
        match self {
            Self::RunCreated { run_id, .. }
            | Self::RunStatusChanged { run_id, .. }
            | Self::PhaseCompleted { run_id, .. }
            | Self::BatchFinished { run_id, .. }
            | Self::ChainStepFinished { run_id, .. }
            | Self::GateVerdict { run_id, .. }
            | Self::BuildFinalized { run_id, .. }
            | Self::JobDeadLettered { run_id, .. }
            | Self::DocumentSettled { run_id, .. } => *run_id,
        }
    }
}

/// Fan-out of serialized [`RunEvent`]s. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<String>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }

    /// Serialize and broadcast. Silently drops the event when nobody listens.
    pub fn emit(&self, event: &RunEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = self.tx.send(json);
            }
            Err(e) => warn!(error = %e, "failed to serialize run event"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_event_tagged_serialization() {
        let event = RunEvent::BatchFinished {
            run_id: 3,
            batch_index: 2,
            total_batches: 6,
            success: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"BatchFinished\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"batch_index\":2"));
    }

    #[test]
    fn test_status_event_uses_snake_case_status() {
        let event = RunEvent::RunStatusChanged {
            run_id: 1,
            status: RunStatus::PhaseComplete,
            current_phase: 1,
            label: RunStatus::PhaseComplete.label(1),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\":\"phase_complete\""));
        assert!(json.contains("\"label\":\"phase_1_complete\""));
    }

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(&RunEvent::PhaseCompleted {
            run_id: 9,
            phase: "quality_gate".into(),
        });
        let received = rx.recv().await.unwrap();
        let parsed: RunEvent = serde_json::from_str(&received).unwrap();
        assert_eq!(
            parsed,
            RunEvent::PhaseCompleted {
                run_id: 9,
                phase: "quality_gate".into()
            }
        );
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        EventBus::new(4).emit(&RunEvent::RunCreated {
            run_id: 1,
            subject: "s".into(),
        });
    }
}
