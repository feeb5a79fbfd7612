//! Context-budget compaction signals
//!
//! Translates token counts into a go/no-go signal: below the soft threshold
//! nothing happens, between soft and hard the model is asked to compact its
//! own context ("memory flush"), at or above the hard threshold the run stops.

use rho_engine::GenerationMetrics;

/// Instruction appended to the context when a memory flush is triggered
pub const DEFAULT_FLUSH_PROMPT: &str = "\
Your context window is nearly full. Before continuing, write a concise summary of \
the conversation so far: the user's goal, what has been done, results of tool calls \
that still matter, and what remains. Keep only information needed to finish the task, \
then continue.";

/// Configuration for context compaction
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Utilization at which a memory flush is requested
    pub soft_threshold: f64,
    /// Utilization at which the run is stopped
    pub hard_threshold: f64,
    /// Whether the soft threshold triggers a flush at all
    pub auto_flush_enabled: bool,
    /// Prompt sent to request a flush
    pub flush_prompt: String,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            soft_threshold: 0.80,
            hard_threshold: 0.90,
            auto_flush_enabled: true,
            flush_prompt: DEFAULT_FLUSH_PROMPT.to_string(),
        }
    }
}

/// Pure computation over a [`CompactionConfig`]
#[derive(Debug, Clone, Default)]
pub struct CompactionCoordinator {
    config: CompactionConfig,
}

impl CompactionCoordinator {
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// `current / max`, or 0.0 when `max` is 0
    pub fn calculate_utilization(&self, current: u32, max: u32) -> f64 {
        if max == 0 {
            return 0.0;
        }
        current as f64 / max as f64
    }

    /// Utilization after a stream, preferring backend-reported token counts
    /// over the chars/4 estimate of context plus output
    pub fn utilization_after_stream(
        &self,
        metrics: Option<&GenerationMetrics>,
        context: &str,
        output: &str,
        context_window: u32,
    ) -> f64 {
        let used = match metrics {
            Some(m) if m.total_tokens() > 0 => m.total_tokens(),
            _ => estimate_tokens(context).saturating_add(estimate_tokens(output)),
        };
        self.calculate_utilization(used, context_window)
    }

    /// True iff auto-flush is enabled and utilization reached the soft threshold
    pub fn should_trigger_memory_flush(&self, utilization: f64) -> bool {
        self.config.auto_flush_enabled && utilization >= self.config.soft_threshold
    }

    /// True iff utilization reached the hard threshold, whatever the flush toggle says
    pub fn should_force_compaction(&self, utilization: f64) -> bool {
        utilization >= self.config.hard_threshold
    }

    pub fn flush_prompt(&self) -> &str {
        &self.config.flush_prompt
    }
}

/// Estimate token count for text (chars/4 heuristic)
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}
