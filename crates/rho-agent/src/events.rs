//! Generation event types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::steering::SteeringMode;
use crate::subagent::SubAgentResult;

/// Events emitted during a generation run
///
/// Within one `run_id` events arrive in the order they occurred.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// A run started
    GenerationStarted {
        run_id: Uuid,
        message_id: Uuid,
        chat_id: String,
    },

    /// Raw text streamed so far in the current iteration
    StreamUpdated {
        run_id: Uuid,
        iteration: u32,
        text: String,
    },

    /// A tool call was dispatched
    ToolStarted {
        run_id: Uuid,
        request_id: String,
        tool_name: String,
        arguments: String,
    },

    /// A tool call finished (or was skipped)
    ToolCompleted {
        run_id: Uuid,
        request_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
    },

    /// The context crossed the soft threshold and a flush was requested
    MemoryFlushRequested { run_id: Uuid, utilization: f64 },

    /// The run finished with a final answer
    GenerationCompleted {
        run_id: Uuid,
        duration_ms: u64,
        iterations: u32,
    },

    /// The run failed
    GenerationFailed {
        run_id: Uuid,
        error: String,
        duration_ms: u64,
    },

    /// The run was stopped by steering or cancellation
    GenerationInterrupted {
        run_id: Uuid,
        reason: Option<SteeringMode>,
        duration_ms: u64,
    },

    /// A sub-agent was spawned
    SubAgentSpawned {
        id: Uuid,
        parent_message_id: Option<Uuid>,
    },

    /// A sub-agent reached a terminal result
    SubAgentFinished { id: Uuid, result: SubAgentResult },
}

impl GenerationEvent {
    /// Check if this is a terminal event of a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationEvent::GenerationCompleted { .. }
                | GenerationEvent::GenerationFailed { .. }
                | GenerationEvent::GenerationInterrupted { .. }
        )
    }

    /// Run this event belongs to, if any
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            GenerationEvent::GenerationStarted { run_id, .. }
            | GenerationEvent::StreamUpdated { run_id, .. }
            | GenerationEvent::ToolStarted { run_id, .. }
            | GenerationEvent::ToolCompleted { run_id, .. }
            | GenerationEvent::MemoryFlushRequested { run_id, .. }
            | GenerationEvent::GenerationCompleted { run_id, .. }
            | GenerationEvent::GenerationFailed { run_id, .. }
            | GenerationEvent::GenerationInterrupted { run_id, .. } => Some(*run_id),
            GenerationEvent::SubAgentSpawned { .. } | GenerationEvent::SubAgentFinished { .. } => {
                None
            }
        }
    }
}
