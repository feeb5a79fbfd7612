//! rho-agent: Generation control plane for an on-device agent
//!
//! This crate provides the agentic loop (stream, decide, execute tools,
//! repeat) together with the coordinators it consults: backend lifecycle,
//! context compaction, steering and sub-agents.

pub mod agent;
pub mod channel;
pub mod compaction;
pub mod context;
pub mod decision;
pub mod error;
pub mod events;
pub mod generation;
pub mod handle;
pub mod model_state;
pub mod orchestrator;
pub mod steering;
pub mod store;
pub mod subagent;
pub mod tool;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{GenerationOutcome, RunStatus};
pub use channel::{Channel, ChannelKind, ParsedOutput};
pub use compaction::{CompactionConfig, CompactionCoordinator};
pub use context::{ContextBuilder, ContextEntry, ContextParameters, TaggedContextBuilder};
pub use decision::{DecisionChain, DecisionHandler, GenerationDecision};
pub use error::{Error, Result};
pub use events::GenerationEvent;
pub use generation::{Attachment, GenerationAction, GenerationRequest, GenerationState};
pub use handle::GenerationHandle;
pub use model_state::{LoadedModel, ModelStateCoordinator};
pub use orchestrator::{AgentOrchestrator, OrchestratorConfig};
pub use steering::{SteeringCoordinator, SteeringMode, SteeringRequest};
pub use store::{ChatStore, FinalMessageState, GenerationParameters, InMemoryChatStore, MessageStatus};
pub use subagent::{
    DelegateTool, SubAgentCoordinator, SubAgentMode, SubAgentRequest, SubAgentResult,
    SubAgentRunner,
};
pub use tool::{Tool, ToolExecutor, ToolRegistry, ToolRequest, ToolResponse, ToolResult};
