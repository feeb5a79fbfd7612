//! Generation requests and the per-step state of one run

use rho_engine::{GenerationMetrics, ModelDescriptor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::channel::ParsedOutput;

/// A file or snippet attached to a text generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    /// Textual content included in the prompt
    pub content: String,
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationAction {
    Text {
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    Image,
}

impl Default for GenerationAction {
    fn default() -> Self {
        GenerationAction::Text {
            attachments: Vec::new(),
        }
    }
}

/// One user turn. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Id of the assistant message this run produces
    pub message_id: Uuid,
    pub chat_id: String,
    /// Model the run targets
    pub model: ModelDescriptor,
    pub action: GenerationAction,
    /// The user's prompt
    pub prompt: String,
}

impl GenerationRequest {
    /// Create a text-generation request with a fresh message id
    pub fn new(chat_id: impl Into<String>, model: ModelDescriptor, prompt: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            model,
            action: GenerationAction::default(),
            prompt: prompt.into(),
        }
    }

    pub fn with_action(mut self, action: GenerationAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_message_id(mut self, message_id: Uuid) -> Self {
        self.message_id = message_id;
        self
    }
}

/// Snapshot of a run between steps
///
/// Updated only by producing a new value. The iteration counter never
/// decreases within a run.
#[derive(Debug, Clone)]
pub struct GenerationState {
    request: Arc<GenerationRequest>,
    output: ParsedOutput,
    metrics: Option<GenerationMetrics>,
    context_utilization: f64,
    iteration: u32,
    is_terminal: bool,
}

impl GenerationState {
    /// Initial state for a request
    pub fn new(request: GenerationRequest) -> Self {
        Self::from_shared(Arc::new(request))
    }

    pub(crate) fn from_shared(request: Arc<GenerationRequest>) -> Self {
        Self {
            request,
            output: ParsedOutput::default(),
            metrics: None,
            context_utilization: 0.0,
            iteration: 0,
            is_terminal: false,
        }
    }

    /// Attach the parsed output and metrics of a finished stream
    pub fn with_stream_complete(self, output: ParsedOutput, metrics: Option<GenerationMetrics>) -> Self {
        Self {
            output,
            metrics,
            ..self
        }
    }

    /// Attach the recomputed context utilization
    pub fn with_context_utilization(self, utilization: f64) -> Self {
        Self {
            context_utilization: utilization,
            ..self
        }
    }

    /// Advance to the next loop pass
    pub fn with_next_iteration(self) -> Self {
        Self {
            iteration: self.iteration.saturating_add(1),
            ..self
        }
    }

    /// Mark the run finished; the state must not be decided on again
    pub fn into_terminal(self) -> Self {
        Self {
            is_terminal: true,
            ..self
        }
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    /// Latest parsed output
    pub fn output(&self) -> &ParsedOutput {
        &self.output
    }

    /// Latest metrics
    pub fn metrics(&self) -> Option<&GenerationMetrics> {
        self.metrics.as_ref()
    }

    pub fn context_utilization(&self) -> f64 {
        self.context_utilization
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn is_terminal(&self) -> bool {
        self.is_terminal
    }
}
