//! Sub-agents: timeout-bounded nested runs of the loop
//!
//! [`SubAgentCoordinator`] spawns each request on its own task, races it
//! against the request's timeout, and records exactly one terminal
//! [`SubAgentResult`]. Cancellation flows from parent to child only: a
//! sub-agent's token is derived from its parent's, so cancelling the parent
//! cascades while a sub-agent timing out leaves the parent untouched.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{GenerationLoop, LoopSettings, RunStatus};
use crate::error::{Error, Result};
use crate::events::GenerationEvent;
use crate::generation::GenerationRequest;
use crate::steering::SteeringCoordinator;
use crate::tool::{Tool, ToolRegistry, ToolResult};

/// Default time budget of a sub-agent
pub const DEFAULT_SUB_AGENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Whether the spawner waits for the sub-agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentMode {
    /// Fire and forget; the caller gets the id back
    Background,
    /// The caller waits for the result
    #[default]
    Parallel,
}

/// A delegated sub-task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentRequest {
    pub id: Uuid,
    pub prompt: String,
    /// Names of the tools the nested run may call
    pub tools: Vec<String>,
    pub mode: SubAgentMode,
    pub timeout: Duration,
    pub system_instruction: Option<String>,
    pub parent_message_id: Option<Uuid>,
    pub parent_chat_id: Option<String>,
}

impl SubAgentRequest {
    /// A parallel request with no tools and the default timeout
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            tools: Vec::new(),
            mode: SubAgentMode::default(),
            timeout: DEFAULT_SUB_AGENT_TIMEOUT,
            system_instruction: None,
            parent_message_id: None,
            parent_chat_id: None,
        }
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: SubAgentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Link the request to the message and chat that spawned it
    pub fn with_parent(mut self, chat_id: impl Into<String>, message_id: Uuid) -> Self {
        self.parent_chat_id = Some(chat_id.into());
        self.parent_message_id = Some(message_id);
        self
    }
}

/// Terminal result of a sub-agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubAgentResult {
    Completed {
        output: String,
        tools_used: Vec<String>,
        duration_ms: u64,
    },
    Failed {
        error: String,
        duration_ms: u64,
    },
    Cancelled {
        duration_ms: u64,
    },
    TimedOut {
        duration_ms: u64,
    },
}

impl SubAgentResult {
    pub fn duration_ms(&self) -> u64 {
        match self {
            SubAgentResult::Completed { duration_ms, .. }
            | SubAgentResult::Failed { duration_ms, .. }
            | SubAgentResult::Cancelled { duration_ms }
            | SubAgentResult::TimedOut { duration_ms } => *duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SubAgentResult::Completed { .. })
    }
}

/// What a finished nested run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAgentOutput {
    pub output: String,
    pub tools_used: Vec<String>,
}

/// Executes the nested run of a sub-agent
#[async_trait]
pub trait SubAgentRunner: Send + Sync {
    /// Run `request` until it finishes or `cancel` fires
    async fn run(&self, request: &SubAgentRequest, cancel: CancellationToken) -> Result<SubAgentOutput>;
}

struct Entry {
    request: SubAgentRequest,
    cancel: CancellationToken,
    result: watch::Receiver<Option<SubAgentResult>>,
}

impl Entry {
    fn is_terminal(&self) -> bool {
        self.result.borrow().is_some()
    }
}

/// Spawns sub-agents and tracks them until they reach a terminal result
pub struct SubAgentCoordinator {
    runner: Arc<dyn SubAgentRunner>,
    root: CancellationToken,
    entries: Arc<Mutex<HashMap<Uuid, Entry>>>,
    event_tx: Option<broadcast::Sender<GenerationEvent>>,
}

impl SubAgentCoordinator {
    pub fn new(runner: Arc<dyn SubAgentRunner>) -> Self {
        Self {
            runner,
            root: CancellationToken::new(),
            entries: Arc::new(Mutex::new(HashMap::new())),
            event_tx: None,
        }
    }

    /// Emit spawn/finish events on `tx`
    pub fn with_events(mut self, tx: broadcast::Sender<GenerationEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Start a sub-agent and return its id without waiting
    pub fn spawn(&self, request: SubAgentRequest) -> Uuid {
        self.spawn_under(request, &self.root)
    }

    /// Start a sub-agent whose cancellation is derived from `parent`
    pub fn spawn_under(&self, request: SubAgentRequest, parent: &CancellationToken) -> Uuid {
        let id = request.id;
        let cancel = parent.child_token();
        let (result_tx, result_rx) = watch::channel(None);
        self.entries.lock().insert(
            id,
            Entry {
                request: request.clone(),
                cancel: cancel.clone(),
                result: result_rx,
            },
        );

        info!(
            sub_agent = %id,
            tools = ?request.tools,
            timeout_ms = request.timeout.as_millis() as u64,
            "SubAgent: Spawning"
        );
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(GenerationEvent::SubAgentSpawned {
                id,
                parent_message_id: request.parent_message_id,
            });
        }

        let runner = Arc::clone(&self.runner);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let elapsed = || started.elapsed().as_millis() as u64;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => SubAgentResult::Cancelled { duration_ms: elapsed() },
                _ = tokio::time::sleep(request.timeout) => {
                    // Stops tools the nested run handed this token to
                    cancel.cancel();
                    warn!(sub_agent = %id, "SubAgent: Timed out after {:?}", request.timeout);
                    SubAgentResult::TimedOut { duration_ms: elapsed() }
                }
                run = runner.run(&request, cancel.clone()) => match run {
                    Ok(out) => SubAgentResult::Completed {
                        output: out.output,
                        tools_used: out.tools_used,
                        duration_ms: elapsed(),
                    },
                    Err(_) if cancel.is_cancelled() => SubAgentResult::Cancelled { duration_ms: elapsed() },
                    Err(e) => SubAgentResult::Failed {
                        error: e.to_string(),
                        duration_ms: elapsed(),
                    },
                },
            };

            debug!(sub_agent = %id, "SubAgent: Finished: {:?}", result);
            let _ = result_tx.send(Some(result.clone()));
            if let Some(tx) = event_tx {
                let _ = tx.send(GenerationEvent::SubAgentFinished { id, result });
            }
        });

        id
    }

    /// Wait for the terminal result of `id`
    pub async fn wait_for_completion(&self, id: Uuid) -> Result<SubAgentResult> {
        let mut rx = self
            .entries
            .lock()
            .get(&id)
            .map(|e| e.result.clone())
            .ok_or(Error::UnknownSubAgent(id))?;
        let result = rx
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| Error::Other(format!("sub-agent {} ended without a result", id)))?;
        result
            .clone()
            .ok_or_else(|| Error::Other(format!("sub-agent {} ended without a result", id)))
    }

    /// Terminal result of `id`, if it has one
    pub fn get_result(&self, id: Uuid) -> Option<SubAgentResult> {
        self.entries
            .lock()
            .get(&id)
            .and_then(|e| e.result.borrow().clone())
    }

    /// Requests that have not reached a terminal result
    pub fn get_active_requests(&self) -> Vec<SubAgentRequest> {
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_terminal())
            .map(|e| e.request.clone())
            .collect()
    }

    /// Forget a finished sub-agent, returning its result
    ///
    /// Sub-agents still running are kept and yield `None`.
    pub fn remove(&self, id: Uuid) -> Option<SubAgentResult> {
        let mut entries = self.entries.lock();
        let result = entries.get(&id)?.result.borrow().clone()?;
        entries.remove(&id);
        Some(result)
    }

    /// Forget every finished sub-agent; returns how many
    pub fn prune_finished(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_terminal());
        let pruned = before - entries.len();
        if pruned > 0 {
            debug!("SubAgent: Pruned {} finished sub-agent(s)", pruned);
        }
        pruned
    }

    /// Request cooperative cancellation of `id`
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let entries = self.entries.lock();
        let entry = entries.get(&id).ok_or(Error::UnknownSubAgent(id))?;
        if !entry.is_terminal() {
            info!(sub_agent = %id, "SubAgent: Cancelling");
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Cancel every active sub-agent spawned for `message_id`; returns how many
    pub fn cancel_for_parent(&self, message_id: Uuid) -> usize {
        self.cancel_where(|r| r.parent_message_id == Some(message_id))
    }

    /// Cancel every active sub-agent; returns how many
    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    fn cancel_where(&self, predicate: impl Fn(&SubAgentRequest) -> bool) -> usize {
        let entries = self.entries.lock();
        let mut cancelled = 0;
        for entry in entries.values() {
            if !entry.is_terminal() && predicate(&entry.request) {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("SubAgent: Cancelled {} active sub-agent(s)", cancelled);
        }
        cancelled
    }
}

/// Runs sub-agents as nested, detached copies of the loop
///
/// The nested run streams through the parent's loaded model, sees only the
/// allow-listed tools and has its own steering mailbox.
pub struct LoopRunner {
    engine: GenerationLoop,
    tools: ToolRegistry,
    default_instruction: Option<String>,
}

impl LoopRunner {
    pub(crate) fn new(
        engine: GenerationLoop,
        tools: ToolRegistry,
        default_instruction: Option<String>,
    ) -> Self {
        Self {
            engine,
            tools,
            default_instruction,
        }
    }
}

#[async_trait]
impl SubAgentRunner for LoopRunner {
    async fn run(&self, request: &SubAgentRequest, cancel: CancellationToken) -> Result<SubAgentOutput> {
        let loaded = self
            .engine
            .model_state()
            .loaded()
            .await
            .ok_or(Error::NoChatLoaded)?;
        let chat_id = request
            .parent_chat_id
            .clone()
            .unwrap_or_else(|| loaded.chat_id.clone());
        let generation = GenerationRequest::new(chat_id, loaded.model, request.prompt.clone())
            .with_message_id(request.id);
        let settings = LoopSettings {
            system_instruction: request
                .system_instruction
                .clone()
                .or_else(|| self.default_instruction.clone()),
            tools: self.tools.restricted(&request.tools),
            sampling: Default::default(),
            max_tokens: rho_engine::ResourceLimits::default().max_tokens,
            history: Vec::new(),
            store: None,
        };

        let outcome = self
            .engine
            .run(
                Arc::new(generation),
                settings,
                &SteeringCoordinator::new(),
                &cancel,
            )
            .await?;
        match outcome.status {
            RunStatus::Completed => Ok(SubAgentOutput {
                output: outcome.text(),
                tools_used: outcome.tools_used,
            }),
            RunStatus::Interrupted => Err(Error::Cancelled),
        }
    }
}

/// Link from a delegate tool to the run it belongs to
#[derive(Debug, Clone)]
pub(crate) struct ParentLink {
    pub chat_id: String,
    pub message_id: Uuid,
}

/// Tool that hands a sub-task to a sub-agent
///
/// `parallel` mode waits for the result; `background` mode returns the
/// sub-agent id immediately.
pub struct DelegateTool {
    coordinator: Arc<SubAgentCoordinator>,
    parent: Option<ParentLink>,
    default_timeout: Duration,
}

impl DelegateTool {
    pub fn new(coordinator: Arc<SubAgentCoordinator>) -> Self {
        Self {
            coordinator,
            parent: None,
            default_timeout: DEFAULT_SUB_AGENT_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub(crate) fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }
}

#[derive(Debug, Deserialize)]
struct DelegateArgs {
    task: String,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    mode: SubAgentMode,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    instructions: Option<String>,
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn label(&self) -> &str {
        "Delegate"
    }

    fn description(&self) -> &str {
        "Hand a self-contained sub-task to a sub-agent. The sub-agent only sees the listed tools. \
         In parallel mode the sub-agent's answer is returned; in background mode its id is returned."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "What the sub-agent should do" },
                "tools": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Tools the sub-agent may use"
                },
                "mode": { "type": "string", "enum": ["parallel", "background"] },
                "timeout_secs": { "type": "integer", "minimum": 1 },
                "instructions": { "type": "string", "description": "Optional system instruction" }
            },
            "required": ["task"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let args: DelegateArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(e) => return ToolResult::error(format!("Invalid delegate arguments: {}", e)),
        };

        let mut request = SubAgentRequest::new(args.task)
            .with_tools(args.tools)
            .with_mode(args.mode)
            .with_timeout(
                args.timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_timeout),
            );
        if let Some(instructions) = args.instructions {
            request = request.with_system_instruction(instructions);
        }
        if let Some(parent) = &self.parent {
            request = request.with_parent(parent.chat_id.clone(), parent.message_id);
        }

        let mode = request.mode;
        let id = self.coordinator.spawn_under(request, &cancel);
        if mode == SubAgentMode::Background {
            return ToolResult::text(serde_json::json!({ "sub_agent_id": id }).to_string());
        }

        let result = self.coordinator.wait_for_completion(id).await;
        // The result is handed to the model here, nobody else polls it
        self.coordinator.remove(id);
        match result {
            Ok(SubAgentResult::Completed { output, .. }) => ToolResult::text(output),
            Ok(SubAgentResult::Failed { error, .. }) => {
                ToolResult::error(format!("Sub-agent failed: {}", error))
            }
            Ok(SubAgentResult::Cancelled { .. }) => ToolResult::error("Sub-agent was cancelled"),
            Ok(SubAgentResult::TimedOut { duration_ms }) => {
                ToolResult::error(format!("Sub-agent timed out after {}ms", duration_ms))
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}
