//! The agentic loop: stream, decide, execute tools, repeat
//!
//! [`GenerationLoop`] drives one [`GenerationRequest`] to a terminal state.
//! It is shared by the orchestrator (persisting runs) and by sub-agents
//! (detached runs without persistence).

use futures::{FutureExt, StreamExt, stream::FuturesUnordered};
use rho_engine::{GenerationMetrics, OutputAccumulator, OutputChunk, ResourceLimits, SamplingParameters, StreamInput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    channel::ParsedOutput,
    compaction::CompactionCoordinator,
    context::{ContextBuilder, ContextEntry, ContextParameters},
    decision::{DecisionChain, GenerationDecision},
    error::{Error, Result},
    events::GenerationEvent,
    generation::{GenerationRequest, GenerationState},
    model_state::ModelStateCoordinator,
    steering::{SteeringCoordinator, SteeringMode},
    store::{ChatStore, FinalMessageState, MessageStatus},
    tool::{ToolExecutor, ToolRegistry, ToolRequest, ToolResponse},
};

/// How a run that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Interrupted,
}

/// Result of a run that reached a non-error terminal state
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub run_id: Uuid,
    pub message_id: Uuid,
    pub status: RunStatus,
    /// Number of streams performed
    pub iterations: u32,
    /// Parsed output of the last stream
    pub output: ParsedOutput,
    /// Tools actually executed, in first-use order
    pub tools_used: Vec<String>,
    pub duration: Duration,
}

impl GenerationOutcome {
    /// Final answer text
    pub fn text(&self) -> String {
        self.output.final_text()
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Per-run inputs that differ between chats and sub-agents
pub(crate) struct LoopSettings {
    pub system_instruction: Option<String>,
    pub tools: ToolRegistry,
    pub sampling: SamplingParameters,
    pub max_tokens: u32,
    /// Prior turns preceding the request's prompt
    pub history: Vec<ContextEntry>,
    /// Where partial and final state is persisted; detached runs have none
    pub store: Option<Arc<dyn ChatStore>>,
}

/// Borrowed handles for the duration of one run
struct RunScope<'a> {
    run_id: Uuid,
    request: &'a GenerationRequest,
    store: Option<&'a dyn ChatStore>,
    steering: &'a SteeringCoordinator,
    cancel: &'a CancellationToken,
}

impl RunScope<'_> {
    /// Hard stop, redirect or cancellation pending
    fn should_abandon_tools(&self) -> bool {
        self.steering.should_skip_remaining_tools() || self.cancel.is_cancelled()
    }
}

enum StreamStep {
    Finished {
        raw: String,
        metrics: Option<GenerationMetrics>,
    },
    Interrupted(Option<SteeringMode>),
    /// Stopped for a pending redirect, left in the mailbox
    Redirected,
}

enum Terminal {
    Completed,
    Interrupted(Option<SteeringMode>),
}

/// The loop engine. Cloning is cheap.
#[derive(Clone)]
pub(crate) struct GenerationLoop {
    model_state: Arc<ModelStateCoordinator>,
    context_builder: Arc<dyn ContextBuilder>,
    compaction: Arc<CompactionCoordinator>,
    chain: Arc<DecisionChain>,
    event_tx: broadcast::Sender<GenerationEvent>,
    partial_update_interval: Duration,
}

impl GenerationLoop {
    pub(crate) fn new(
        model_state: Arc<ModelStateCoordinator>,
        context_builder: Arc<dyn ContextBuilder>,
        compaction: Arc<CompactionCoordinator>,
        chain: Arc<DecisionChain>,
        event_tx: broadcast::Sender<GenerationEvent>,
        partial_update_interval: Duration,
    ) -> Self {
        Self {
            model_state,
            context_builder,
            compaction,
            chain,
            event_tx,
            partial_update_interval,
        }
    }

    pub(crate) fn model_state(&self) -> &Arc<ModelStateCoordinator> {
        &self.model_state
    }

    fn emit(&self, event: GenerationEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Context window the utilization is measured against
    async fn context_window(&self, request: &GenerationRequest) -> u32 {
        match self.model_state.loaded().await {
            Some(loaded) if loaded.config.context_size > 0 => loaded.config.context_size,
            _ if request.model.context_window > 0 => request.model.context_window,
            _ => rho_engine::config::DEFAULT_CONTEXT_SIZE,
        }
    }

    /// Run `request` to completion, interruption or failure
    ///
    /// Every terminal state is persisted (when a store is configured) and
    /// emitted before returning.
    pub(crate) async fn run(
        &self,
        request: Arc<GenerationRequest>,
        settings: LoopSettings,
        steering: &SteeringCoordinator,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        let started = Instant::now();
        let scope = RunScope {
            run_id: Uuid::new_v4(),
            request: &request,
            store: settings.store.as_deref(),
            steering,
            cancel,
        };
        tracing::info!(
            run_id = %scope.run_id,
            chat_id = %request.chat_id,
            "Generation started"
        );
        self.emit(GenerationEvent::GenerationStarted {
            run_id: scope.run_id,
            message_id: request.message_id,
            chat_id: request.chat_id.clone(),
        });

        let context_window = self.context_window(&request).await;
        let limits = ResourceLimits {
            context_size: context_window,
            max_tokens: settings.max_tokens,
        };
        let tool_definitions = settings.tools.definitions();
        let mut entries = settings.history.clone();
        entries.push(ContextEntry::from_action(&request.prompt, &request.action));

        let mut state = GenerationState::from_shared(Arc::clone(&request));
        let mut tools_used: Vec<String> = Vec::new();
        let mut partial = String::new();
        let mut streams = 0u32;

        let result: Result<Terminal> = loop {
            if let Some(steer) = steering.consume() {
                match steer.mode {
                    SteeringMode::Redirect { prompt } => {
                        tracing::info!(run_id = %scope.run_id, "Redirected by steering request");
                        entries.push(ContextEntry::user(prompt));
                    }
                    mode => break Ok(Terminal::Interrupted(Some(mode))),
                }
            }
            if cancel.is_cancelled() {
                break Ok(Terminal::Interrupted(None));
            }

            let params = ContextParameters {
                model: request.model.clone(),
                system_instruction: settings.system_instruction.clone(),
                tools: tool_definitions.clone(),
                entries: entries.clone(),
            };
            let context = match self.context_builder.build(&params) {
                Ok(context) => context,
                Err(e) => break Err(e),
            };
            let input = StreamInput {
                context: context.clone(),
                sampling: settings.sampling.clone(),
                limits,
            };

            streams += 1;
            let (raw, metrics) = match self
                .stream_once(&scope, state.iteration(), input, &mut partial)
                .await
            {
                Ok(StreamStep::Finished { raw, metrics }) => (raw, metrics),
                Ok(StreamStep::Interrupted(mode)) => break Ok(Terminal::Interrupted(mode)),
                Ok(StreamStep::Redirected) => {
                    state = state.with_next_iteration();
                    continue;
                }
                Err(Error::Engine(e)) if e.is_aborted() => {
                    break Ok(Terminal::Interrupted(steering.consume().map(|r| r.mode)));
                }
                Err(e) => break Err(e),
            };

            let output = match self.context_builder.process(&raw, &request.model) {
                Ok(output) => output,
                Err(e) => break Err(e),
            };
            if let Some(store) = scope.store {
                if let Err(e) = store.update_channels(request.message_id, &output.channels).await {
                    tracing::warn!("Failed to persist channels: {}", e);
                }
            }
            let utilization = self.compaction.utilization_after_stream(
                metrics.as_ref(),
                &context,
                &raw,
                context_window,
            );
            state = state
                .with_stream_complete(output, metrics)
                .with_context_utilization(utilization);
            entries.push(ContextEntry::assistant(raw));

            match self.chain.decide(&state) {
                GenerationDecision::ExecuteTools(requests) => {
                    if steering.should_skip_remaining_tools() {
                        tracing::info!(
                            run_id = %scope.run_id,
                            "Skipping {} tool call(s) on steering request",
                            requests.len()
                        );
                    } else {
                        let responses = self
                            .execute_tools(&scope, &requests, &settings.tools, &mut tools_used)
                            .await;
                        entries.extend(responses.into_iter().map(ContextEntry::from));
                    }
                    state = state.with_next_iteration();
                }
                GenerationDecision::ContinueWithNewPrompt(prompt) => {
                    tracing::info!(
                        run_id = %scope.run_id,
                        "Context at {:.0}%, requesting memory flush",
                        utilization * 100.0
                    );
                    self.emit(GenerationEvent::MemoryFlushRequested {
                        run_id: scope.run_id,
                        utilization,
                    });
                    entries.push(ContextEntry::instruction(prompt));
                    state = state.with_next_iteration();
                }
                GenerationDecision::Complete => {
                    let redirect_pending = matches!(
                        steering.current_request().map(|r| r.mode),
                        Some(SteeringMode::Redirect { .. })
                    );
                    if redirect_pending {
                        state = state.with_next_iteration();
                        continue;
                    }
                    break Ok(Terminal::Completed);
                }
                GenerationDecision::Error(e) => break Err(e.into()),
            }
        };

        let state = state.into_terminal();
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;

        if let Some(store) = scope.store {
            let status = match &result {
                Ok(Terminal::Completed) => MessageStatus::Completed,
                Ok(Terminal::Interrupted(_)) => MessageStatus::Interrupted,
                Err(e) => MessageStatus::Failed {
                    error: e.to_string(),
                },
            };
            let final_state = FinalMessageState {
                status,
                prompt: request.prompt.clone(),
                channels: state.output().channels.clone(),
                partial,
                tools_used: tools_used.clone(),
                iterations: streams,
            };
            if let Err(e) = store.finalize_message(request.message_id, final_state).await {
                tracing::warn!("Failed to persist final message state: {}", e);
            }
        }

        let outcome = |status| GenerationOutcome {
            run_id: scope.run_id,
            message_id: request.message_id,
            status,
            iterations: streams,
            output: state.output().clone(),
            tools_used: tools_used.clone(),
            duration,
        };

        match result {
            Ok(Terminal::Completed) => {
                tracing::info!(
                    run_id = %scope.run_id,
                    iterations = streams,
                    "Generation completed in {}ms",
                    duration_ms
                );
                self.emit(GenerationEvent::GenerationCompleted {
                    run_id: scope.run_id,
                    duration_ms,
                    iterations: streams,
                });
                Ok(outcome(RunStatus::Completed))
            }
            Ok(Terminal::Interrupted(reason)) => {
                tracing::info!(run_id = %scope.run_id, "Generation interrupted: {:?}", reason);
                self.emit(GenerationEvent::GenerationInterrupted {
                    run_id: scope.run_id,
                    reason,
                    duration_ms,
                });
                Ok(outcome(RunStatus::Interrupted))
            }
            Err(e) => {
                tracing::warn!(run_id = %scope.run_id, "Generation failed: {}", e);
                self.emit(GenerationEvent::GenerationFailed {
                    run_id: scope.run_id,
                    error: e.to_string(),
                    duration_ms,
                });
                Err(e)
            }
        }
    }

    /// Consume one backend stream, persisting throttled partial updates
    ///
    /// A hard stop, redirect or cancellation stops the backend and ends the
    /// stream early. A redirect stays pending for the caller to consume.
    /// Raw text is appended to `partial` as it arrives.
    async fn stream_once(
        &self,
        scope: &RunScope<'_>,
        iteration: u32,
        input: StreamInput,
        partial: &mut String,
    ) -> Result<StreamStep> {
        let mut stream = self.model_state.stream(input).await?;
        let mut accumulator = OutputAccumulator::new();
        let mut unsent = String::new();
        let mut last_update = Instant::now();

        loop {
            let notified = scope.steering.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let hard_stop = scope.steering.should_interrupt_immediately();
            if hard_stop || scope.cancel.is_cancelled() {
                let reason = if hard_stop {
                    scope.steering.consume().map(|r| r.mode)
                } else {
                    None
                };
                tracing::info!(run_id = %scope.run_id, "Stopping in-flight generation");
                self.model_state.stop().await?;
                self.flush_partial(scope, iteration, accumulator.text(), &mut unsent)
                    .await;
                return Ok(StreamStep::Interrupted(reason));
            }
            if scope.steering.should_skip_remaining_tools() {
                tracing::info!(run_id = %scope.run_id, "Stopping in-flight generation for redirect");
                self.model_state.stop().await?;
                self.flush_partial(scope, iteration, accumulator.text(), &mut unsent)
                    .await;
                return Ok(StreamStep::Redirected);
            }

            let next = tokio::select! {
                next = stream.next() => next,
                _ = &mut notified => continue,
                _ = scope.cancel.cancelled() => continue,
            };

            match next {
                Some(Ok(chunk)) => {
                    if let OutputChunk::Text { delta } = &chunk {
                        unsent.push_str(delta);
                        partial.push_str(delta);
                    }
                    accumulator.process_chunk(&chunk);
                    if last_update.elapsed() >= self.partial_update_interval {
                        self.flush_partial(scope, iteration, accumulator.text(), &mut unsent)
                            .await;
                        last_update = Instant::now();
                    }
                }
                Some(Err(e)) => {
                    self.flush_partial(scope, iteration, accumulator.text(), &mut unsent)
                        .await;
                    return Err(e.into());
                }
                None => break,
            }
        }

        self.flush_partial(scope, iteration, accumulator.text(), &mut unsent)
            .await;
        tracing::debug!(
            run_id = %scope.run_id,
            chunks = accumulator.chunk_count(),
            "Stream finished"
        );
        let (raw, metrics) = accumulator.finish();
        Ok(StreamStep::Finished { raw, metrics })
    }

    /// Append unsent text to the message and notify observers
    async fn flush_partial(
        &self,
        scope: &RunScope<'_>,
        iteration: u32,
        text: &str,
        unsent: &mut String,
    ) {
        if unsent.is_empty() {
            return;
        }
        if let Some(store) = scope.store {
            if let Err(e) = store
                .append_partial(&scope.request.chat_id, scope.request.message_id, unsent)
                .await
            {
                tracing::warn!("Failed to persist partial output: {}", e);
            }
        }
        self.emit(GenerationEvent::StreamUpdated {
            run_id: scope.run_id,
            iteration,
            text: text.to_string(),
        });
        unsent.clear();
    }

    /// Execute one batch of tool requests
    ///
    /// Responses are returned in request order. Each response is held in
    /// the slot of the request that produced it, so repeated ids cannot
    /// displace one another. Calls still running when a hard stop or
    /// redirect arrives are abandoned and calls not yet started are
    /// skipped; both are answered with error responses.
    async fn execute_tools(
        &self,
        scope: &RunScope<'_>,
        requests: &[ToolRequest],
        tools: &ToolRegistry,
        tools_used: &mut Vec<String>,
    ) -> Vec<ToolResponse> {
        let tool_cancel = scope.cancel.child_token();
        let mut slots: Vec<Option<ToolResponse>> = vec![None; requests.len()];
        let mut started = vec![false; requests.len()];

        if tools.supports_concurrency() && requests.len() > 1 {
            let mut in_flight = FuturesUnordered::new();
            for (index, request) in requests.iter().enumerate() {
                self.emit_tool_started(scope, request);
                started[index] = true;
                in_flight.push(
                    tools
                        .execute(request, tool_cancel.clone())
                        .map(move |response| (index, response)),
                );
            }
            loop {
                let notified = scope.steering.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if scope.should_abandon_tools() {
                    tool_cancel.cancel();
                    break;
                }
                tokio::select! {
                    next = in_flight.next() => match next {
                        Some((index, response)) => {
                            self.record_response(scope, &requests[index], response, &mut slots[index]);
                        }
                        None => break,
                    },
                    _ = &mut notified => {}
                    _ = scope.cancel.cancelled() => {}
                }
            }
        } else {
            'requests: for (index, request) in requests.iter().enumerate() {
                if scope.should_abandon_tools() {
                    break;
                }
                self.emit_tool_started(scope, request);
                started[index] = true;
                let execution = tools.execute(request, tool_cancel.clone());
                tokio::pin!(execution);
                loop {
                    let notified = scope.steering.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if scope.should_abandon_tools() {
                        tool_cancel.cancel();
                        break 'requests;
                    }
                    tokio::select! {
                        response = &mut execution => {
                            self.record_response(scope, request, response, &mut slots[index]);
                            break;
                        }
                        _ = &mut notified => {}
                        _ = scope.cancel.cancelled() => {}
                    }
                }
            }
        }

        requests
            .iter()
            .zip(slots)
            .zip(started)
            .map(|((request, slot), was_started)| match slot {
                Some(response) => {
                    if tools.get(&response.tool_name).is_some()
                        && !tools_used.contains(&response.tool_name)
                    {
                        tools_used.push(response.tool_name.clone());
                    }
                    response
                }
                None => {
                    let reason = if was_started {
                        "Cancelled: generation was stopped or redirected"
                    } else {
                        self.emit_tool_started(scope, request);
                        "Skipped: generation was stopped or redirected"
                    };
                    let response = ToolResponse::failure(request, reason);
                    self.emit_tool_completed(scope, &response);
                    response
                }
            })
            .collect()
    }

    fn record_response(
        &self,
        scope: &RunScope<'_>,
        request: &ToolRequest,
        response: ToolResponse,
        slot: &mut Option<ToolResponse>,
    ) {
        if response.request_id != request.id {
            tracing::warn!(
                "Dropping response {} for tool call {}",
                response.request_id,
                request.id
            );
            return;
        }
        if let Some(error) = &response.error {
            tracing::warn!("Tool {} failed: {}", response.tool_name, error);
        } else {
            tracing::debug!("Tool {} completed", response.tool_name);
        }
        self.emit_tool_completed(scope, &response);
        *slot = Some(response);
    }

    fn emit_tool_started(&self, scope: &RunScope<'_>, request: &ToolRequest) {
        self.emit(GenerationEvent::ToolStarted {
            run_id: scope.run_id,
            request_id: request.id.clone(),
            tool_name: request.name.clone(),
            arguments: request.arguments.clone(),
        });
    }

    fn emit_tool_completed(&self, scope: &RunScope<'_>, response: &ToolResponse) {
        self.emit(GenerationEvent::ToolCompleted {
            run_id: scope.run_id,
            request_id: response.request_id.clone(),
            tool_name: response.tool_name.clone(),
            result: response.result.clone(),
            is_error: response.is_error(),
        });
    }
}
