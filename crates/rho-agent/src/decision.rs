//! The decision chain: ordered pure handlers that turn a finished stream
//! into the loop's next action

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::compaction::CompactionCoordinator;
use crate::error::Error;
use crate::generation::GenerationState;
use crate::tool::ToolRequest;

/// Default iteration limit of the safety handler
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Reason a run must stop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DecisionError {
    TooManyIterations { max: u32 },
    ContextLimitExceeded { utilization: f64 },
}

impl From<DecisionError> for Error {
    fn from(e: DecisionError) -> Self {
        match e {
            DecisionError::TooManyIterations { max } => Error::TooManyIterations { max },
            DecisionError::ContextLimitExceeded { utilization } => {
                Error::ContextLimitExceeded { utilization }
            }
        }
    }
}

/// The next action of the loop
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationDecision {
    /// Run these tools, in this order, then stream again
    ExecuteTools(Vec<ToolRequest>),
    /// Append this instruction to the context and stream again
    ContinueWithNewPrompt(String),
    /// The model produced its final answer
    Complete,
    /// Stop the run
    Error(DecisionError),
}

/// One link of the chain
///
/// Returning `None` passes the state to the next handler.
pub trait DecisionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn decide(&self, state: &GenerationState) -> Option<GenerationDecision>;
}

/// Stops runs that loop too long
#[derive(Debug, Clone)]
pub struct SafetyHandler {
    max_iterations: u32,
}

impl SafetyHandler {
    pub fn new(max_iterations: u32) -> Self {
        Self { max_iterations }
    }
}

impl Default for SafetyHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS)
    }
}

impl DecisionHandler for SafetyHandler {
    fn name(&self) -> &'static str {
        "safety"
    }

    fn decide(&self, state: &GenerationState) -> Option<GenerationDecision> {
        (state.iteration() >= self.max_iterations).then_some(GenerationDecision::Error(
            DecisionError::TooManyIterations {
                max: self.max_iterations,
            },
        ))
    }
}

/// Stops or flushes when the context fills up
#[derive(Debug, Clone)]
pub struct MemoryFlushHandler {
    compaction: Arc<CompactionCoordinator>,
}

impl MemoryFlushHandler {
    pub fn new(compaction: Arc<CompactionCoordinator>) -> Self {
        Self { compaction }
    }
}

impl DecisionHandler for MemoryFlushHandler {
    fn name(&self) -> &'static str {
        "memory_flush"
    }

    fn decide(&self, state: &GenerationState) -> Option<GenerationDecision> {
        let utilization = state.context_utilization();
        if self.compaction.should_force_compaction(utilization) {
            return Some(GenerationDecision::Error(
                DecisionError::ContextLimitExceeded { utilization },
            ));
        }
        if self.compaction.should_trigger_memory_flush(utilization) {
            return Some(GenerationDecision::ContinueWithNewPrompt(
                self.compaction.flush_prompt().to_string(),
            ));
        }
        None
    }
}

/// Dispatches complete tool calls in first-seen order
#[derive(Debug, Clone, Default)]
pub struct ToolCallHandler;

impl DecisionHandler for ToolCallHandler {
    fn name(&self) -> &'static str {
        "tool_call"
    }

    fn decide(&self, state: &GenerationState) -> Option<GenerationDecision> {
        let requests = state.output().tool_requests();
        (!requests.is_empty()).then_some(GenerationDecision::ExecuteTools(requests))
    }
}

/// Terminal handler
#[derive(Debug, Clone, Default)]
pub struct CompletionHandler;

impl DecisionHandler for CompletionHandler {
    fn name(&self) -> &'static str {
        "completion"
    }

    fn decide(&self, _state: &GenerationState) -> Option<GenerationDecision> {
        Some(GenerationDecision::Complete)
    }
}

/// Ordered handlers evaluated fresh on every loop pass
pub struct DecisionChain {
    handlers: Vec<Box<dyn DecisionHandler>>,
}

impl DecisionChain {
    /// A chain of arbitrary handlers; the first to decide wins
    pub fn new(handlers: Vec<Box<dyn DecisionHandler>>) -> Self {
        Self { handlers }
    }

    /// safety → memory flush → tool call → completion
    pub fn standard(max_iterations: u32, compaction: Arc<CompactionCoordinator>) -> Self {
        Self::new(vec![
            Box::new(SafetyHandler::new(max_iterations)),
            Box::new(MemoryFlushHandler::new(compaction)),
            Box::new(ToolCallHandler),
            Box::new(CompletionHandler),
        ])
    }

    /// Evaluate the chain. Exactly one decision is returned; a chain whose
    /// handlers all delegate completes.
    pub fn decide(&self, state: &GenerationState) -> GenerationDecision {
        for handler in &self.handlers {
            if let Some(decision) = handler.decide(state) {
                tracing::debug!(
                    handler = handler.name(),
                    iteration = state.iteration(),
                    "decision: {:?}",
                    decision
                );
                return decision;
            }
        }
        GenerationDecision::Complete
    }

    /// Handler names in evaluation order
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelKind, ParsedOutput};
    use crate::compaction::CompactionConfig;
    use crate::generation::GenerationRequest;
    use crate::testing;

    fn chain() -> DecisionChain {
        DecisionChain::standard(
            DEFAULT_MAX_ITERATIONS,
            Arc::new(CompactionCoordinator::default()),
        )
    }

    fn state_at(iteration: u32, output: ParsedOutput, utilization: f64) -> GenerationState {
        let mut state = GenerationState::new(GenerationRequest::new(
            "chat",
            testing::model("tiny", rho_engine::BackendKind::Cpu),
            "hi",
        ));
        for _ in 0..iteration {
            state = state.with_next_iteration();
        }
        state
            .with_stream_complete(output, None)
            .with_context_utilization(utilization)
    }

    fn tool_output() -> ParsedOutput {
        ParsedOutput::new(vec![Channel::tool_call(
            ToolRequest::new("calculator", "{}").with_id("c1"),
        )])
    }

    #[test]
    fn test_standard_order() {
        assert_eq!(
            chain().handler_names(),
            vec!["safety", "memory_flush", "tool_call", "completion"]
        );
    }

    #[test]
    fn test_safety_wins_regardless_of_output() {
        for output in [ParsedOutput::default(), tool_output()] {
            for utilization in [0.0, 0.85, 0.99] {
                let state = state_at(DEFAULT_MAX_ITERATIONS, output.clone(), utilization);
                assert_eq!(
                    chain().decide(&state),
                    GenerationDecision::Error(DecisionError::TooManyIterations { max: 10 })
                );
            }
        }
    }

    #[test]
    fn test_one_below_limit_completes() {
        let output = ParsedOutput::new(vec![Channel::final_answer("42")]);
        let state = state_at(DEFAULT_MAX_ITERATIONS - 1, output, 0.1);
        assert_eq!(chain().decide(&state), GenerationDecision::Complete);
    }

    #[test]
    fn test_hard_threshold_is_fatal() {
        let state = state_at(0, tool_output(), 0.90);
        assert_eq!(
            chain().decide(&state),
            GenerationDecision::Error(DecisionError::ContextLimitExceeded { utilization: 0.90 })
        );
    }

    #[test]
    fn test_soft_threshold_requests_flush() {
        let state = state_at(0, tool_output(), 0.85);
        match chain().decide(&state) {
            GenerationDecision::ContinueWithNewPrompt(prompt) => {
                assert_eq!(prompt, CompactionConfig::default().flush_prompt)
            }
            other => panic!("expected flush prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_soft_threshold_ignored_when_auto_flush_off() {
        let compaction = Arc::new(CompactionCoordinator::new(CompactionConfig {
            auto_flush_enabled: false,
            ..Default::default()
        }));
        let chain = DecisionChain::standard(10, compaction);
        let state = state_at(0, tool_output(), 0.85);
        assert!(matches!(chain.decide(&state), GenerationDecision::ExecuteTools(_)));
    }

    #[test]
    fn test_tool_calls_in_channel_order() {
        let output = ParsedOutput::new(vec![
            Channel::tool_call(ToolRequest::new("zeta", "{}").with_id("first")),
            Channel::text(ChannelKind::Commentary, "..."),
            Channel::tool_call(ToolRequest::new("alpha", "{}").with_id("second")),
        ]);
        match chain().decide(&state_at(0, output, 0.0)) {
            GenerationDecision::ExecuteTools(requests) => {
                let ids: Vec<&str> = requests.iter().map(|r| r.id.as_str()).collect();
                assert_eq!(ids, vec!["first", "second"]);
            }
            other => panic!("expected ExecuteTools, got {:?}", other),
        }
    }

    #[test]
    fn test_single_tool_call_round_trip() {
        let request = ToolRequest::new("calculator", r#"{"operation":"add"}"#).with_id("c9");
        let output = ParsedOutput::new(vec![Channel::tool_call(request.clone())]);
        assert_eq!(
            chain().decide(&state_at(0, output, 0.0)),
            GenerationDecision::ExecuteTools(vec![request])
        );
    }

    #[test]
    fn test_incomplete_tool_call_completes() {
        let output = ParsedOutput::new(vec![Channel::tool_call(
            ToolRequest::new("calculator", "{").incomplete(),
        )]);
        assert_eq!(chain().decide(&state_at(0, output, 0.0)), GenerationDecision::Complete);
    }

    #[test]
    fn test_decide_does_not_mutate_state() {
        let state = state_at(3, tool_output(), 0.5);
        let before = format!("{:?}", state);
        let _ = chain().decide(&state);
        let _ = chain().decide(&state);
        assert_eq!(format!("{:?}", state), before);
    }

    #[test]
    fn test_empty_chain_completes() {
        let chain = DecisionChain::new(vec![]);
        assert_eq!(
            chain.decide(&state_at(0, tool_output(), 0.0)),
            GenerationDecision::Complete
        );
    }
}
