//! The public entry point: one orchestrator per on-device agent
//!
//! [`AgentOrchestrator`] owns the coordinators, wires them into the loop and
//! exposes the narrow surface the application calls: load/unload/stop a
//! chat's model, generate, steer, and observe events.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::{
    agent::{GenerationLoop, GenerationOutcome, LoopSettings},
    compaction::{CompactionConfig, CompactionCoordinator},
    context::ContextBuilder,
    decision::{DEFAULT_MAX_ITERATIONS, DecisionChain},
    error::{Error, Result},
    events::GenerationEvent,
    generation::{GenerationAction, GenerationRequest},
    handle::GenerationHandle,
    model_state::ModelStateCoordinator,
    steering::{SteeringCoordinator, SteeringMode, SteeringRequest},
    store::ChatStore,
    subagent::{DEFAULT_SUB_AGENT_TIMEOUT, DelegateTool, LoopRunner, ParentLink, SubAgentCoordinator},
    tool::ToolRegistry,
};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Loop passes allowed before a run fails
    pub max_iterations: u32,
    pub compaction: CompactionConfig,
    /// Minimum time between persisted partial updates
    pub partial_update_interval: Duration,
    pub system_instruction: Option<String>,
    /// Offer the `delegate` tool to runs
    pub enable_delegation: bool,
    /// Timeout of sub-agents that do not ask for one
    pub sub_agent_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            compaction: CompactionConfig::default(),
            partial_update_interval: Duration::from_millis(100),
            system_instruction: None,
            enable_delegation: true,
            sub_agent_timeout: DEFAULT_SUB_AGENT_TIMEOUT,
        }
    }
}

/// Drives generation runs for the loaded chat
pub struct AgentOrchestrator {
    config: OrchestratorConfig,
    model_state: Arc<ModelStateCoordinator>,
    store: Arc<dyn ChatStore>,
    engine: GenerationLoop,
    tools: ToolRegistry,
    subagents: Arc<SubAgentCoordinator>,
    handle: GenerationHandle,
    event_tx: broadcast::Sender<GenerationEvent>,
}

impl AgentOrchestrator {
    pub fn new(
        model_state: Arc<ModelStateCoordinator>,
        store: Arc<dyn ChatStore>,
        context_builder: Arc<dyn ContextBuilder>,
        tools: ToolRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        let compaction = Arc::new(CompactionCoordinator::new(config.compaction.clone()));
        let chain = Arc::new(DecisionChain::standard(
            config.max_iterations,
            Arc::clone(&compaction),
        ));
        let engine = GenerationLoop::new(
            Arc::clone(&model_state),
            context_builder,
            compaction,
            chain,
            event_tx.clone(),
            config.partial_update_interval,
        );
        let runner = LoopRunner::new(
            engine.clone(),
            tools.clone(),
            config.system_instruction.clone(),
        );
        let subagents =
            Arc::new(SubAgentCoordinator::new(Arc::new(runner)).with_events(event_tx.clone()));

        Self {
            config,
            model_state,
            store,
            engine,
            tools,
            subagents,
            handle: GenerationHandle::new(),
            event_tx,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Resolve and load the model selected for `chat_id`
    pub async fn load(&self, chat_id: &str) -> Result<()> {
        self.model_state.load(chat_id).await
    }

    pub async fn unload(&self) -> Result<()> {
        self.model_state.unload().await
    }

    /// Cancel in-flight generation at the backend; the model stays loaded
    pub async fn stop(&self) -> Result<()> {
        self.model_state.stop().await
    }

    /// Run the loop for `prompt` against the loaded chat
    pub async fn generate(
        &self,
        prompt: impl Into<String>,
        action: GenerationAction,
    ) -> Result<GenerationOutcome> {
        let loaded = self
            .model_state
            .loaded()
            .await
            .ok_or(Error::NoChatLoaded)?;
        let request =
            GenerationRequest::new(loaded.chat_id, loaded.model, prompt).with_action(action);
        self.run(request).await
    }

    /// Run the loop for a prepared request
    pub async fn run(&self, request: GenerationRequest) -> Result<GenerationOutcome> {
        let cancel = self.handle.begin_run();
        let message_id = request.message_id;
        let result = self.run_inner(request, &cancel).await;

        let finished_cleanly = matches!(&result, Ok(outcome) if outcome.is_completed());
        if !finished_cleanly {
            let cancelled = self.subagents.cancel_for_parent(message_id);
            if cancelled > 0 {
                tracing::info!("Cancelled {} sub-agent(s) of message {}", cancelled, message_id);
            }
        }
        self.handle.end_run();
        result
    }

    async fn run_inner(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        let parameters = self.store.generation_parameters(&request.chat_id).await?;
        let history = self.store.history(&request.chat_id).await?;

        let mut tools = match &parameters.tool_allow_list {
            Some(allow_list) => self.tools.restricted(allow_list),
            None => self.tools.clone(),
        };
        let delegation_allowed = parameters
            .tool_allow_list
            .as_ref()
            .is_none_or(|list| list.iter().any(|name| name == "delegate"));
        if self.config.enable_delegation && delegation_allowed {
            tools.register(Arc::new(
                DelegateTool::new(Arc::clone(&self.subagents))
                    .with_default_timeout(self.config.sub_agent_timeout)
                    .with_parent(ParentLink {
                        chat_id: request.chat_id.clone(),
                        message_id: request.message_id,
                    }),
            ));
        }

        let settings = LoopSettings {
            system_instruction: self.config.system_instruction.clone(),
            tools,
            sampling: parameters.sampling(),
            max_tokens: parameters.max_tokens,
            history,
            store: Some(Arc::clone(&self.store)),
        };
        self.engine
            .run(Arc::new(request), settings, &self.handle.steering, cancel)
            .await
    }

    /// Submit a steering request to the running generation
    pub async fn steer(&self, mode: SteeringMode) -> SteeringRequest {
        tracing::debug!("Steering request: {:?}", mode);
        self.handle.steer(mode)
    }

    pub fn steering(&self) -> &SteeringCoordinator {
        self.handle.steering()
    }

    /// Cancel the running generation and its sub-agents
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Get a cloneable handle for steering or aborting from other tasks
    pub fn handle(&self) -> GenerationHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Subscribe to generation events
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.event_tx.subscribe()
    }

    /// Generation events as a stream; lagged receivers yield an error item
    pub fn events(&self) -> BroadcastStream<GenerationEvent> {
        BroadcastStream::new(self.event_tx.subscribe())
    }

    pub fn subagents(&self) -> &Arc<SubAgentCoordinator> {
        &self.subagents
    }

    pub fn model_state(&self) -> &Arc<ModelStateCoordinator> {
        &self.model_state
    }
}
