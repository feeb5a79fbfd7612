//! Replay backend that streams canned responses
//!
//! Useful for dry runs of the agent loop without model weights: each call to
//! `stream` pops the next scripted response and emits it word by word.

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::sessions::BackendSession;
use crate::stream::{ChunkStream, ProgressStream};
use crate::types::{BackendKind, GenerationMetrics, LoadProgress, OutputChunk, StreamInput};

/// One canned model turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptedResponse {
    /// Raw text to stream
    pub text: String,
    /// Raise this error after streaming `text`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Metrics to report instead of the chars/4 estimate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<GenerationMetrics>,
}

impl ScriptedResponse {
    /// A response that streams `text` and finishes normally
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// A response that streams `partial` and then fails mid-stream
    pub fn failing(partial: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            text: partial.into(),
            error: Some(message.into()),
            metrics: None,
        }
    }

    /// Override the reported metrics
    pub fn with_metrics(mut self, metrics: GenerationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[derive(Default)]
struct SessionState {
    loaded: Option<ProviderConfig>,
    generation: CancellationToken,
}

/// Backend session replaying a script of responses
pub struct ScriptedSession {
    kind: BackendKind,
    responses: Mutex<VecDeque<ScriptedResponse>>,
    fallback: ScriptedResponse,
    chunk_delay: Duration,
    preload_delay: Duration,
    preload_failure: Mutex<Option<String>>,
    unload_failure: Mutex<Option<String>>,
    state: Arc<Mutex<SessionState>>,
    inputs: Mutex<Vec<StreamInput>>,
    preloads: AtomicU32,
    unloads: AtomicU32,
    stops: AtomicU32,
}

impl ScriptedSession {
    /// Create an empty session for `kind`
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            responses: Mutex::new(VecDeque::new()),
            fallback: ScriptedResponse::text("done"),
            chunk_delay: Duration::ZERO,
            preload_delay: Duration::ZERO,
            preload_failure: Mutex::new(None),
            unload_failure: Mutex::new(None),
            state: Arc::new(Mutex::new(SessionState::default())),
            inputs: Mutex::new(Vec::new()),
            preloads: AtomicU32::new(0),
            unloads: AtomicU32::new(0),
            stops: AtomicU32::new(0),
        }
    }

    /// Queue responses in the order they will be streamed
    pub fn with_responses(self, responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        self.responses.lock().extend(responses);
        self
    }

    /// Response used once the script is exhausted
    pub fn with_fallback(mut self, response: ScriptedResponse) -> Self {
        self.fallback = response;
        self
    }

    /// Sleep between emitted chunks
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Sleep before a preload reports completion
    pub fn with_preload_delay(mut self, delay: Duration) -> Self {
        self.preload_delay = delay;
        self
    }

    /// Append a response to the script
    pub fn push_response(&self, response: ScriptedResponse) {
        self.responses.lock().push_back(response);
    }

    /// Make the next preload fail with `message`
    pub fn fail_next_preload(&self, message: impl Into<String>) {
        *self.preload_failure.lock() = Some(message.into());
    }

    /// Make the next unload fail with `message`, keeping the model resident
    pub fn fail_next_unload(&self, message: impl Into<String>) {
        *self.unload_failure.lock() = Some(message.into());
    }

    /// Whether a model is currently resident
    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded.is_some()
    }

    /// Configuration of the resident model
    pub fn loaded_config(&self) -> Option<ProviderConfig> {
        self.state.lock().loaded.clone()
    }

    /// Inputs received by `stream`, oldest first
    pub fn recorded_inputs(&self) -> Vec<StreamInput> {
        self.inputs.lock().clone()
    }

    pub fn preload_count(&self) -> u32 {
        self.preloads.load(Ordering::Acquire)
    }

    pub fn unload_count(&self) -> u32 {
        self.unloads.load(Ordering::Acquire)
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BackendSession for ScriptedSession {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn preload(&self, config: &ProviderConfig) -> Result<ProgressStream> {
        self.preloads.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            "Preloading {} in {} session",
            config.model_path.display(),
            self.kind
        );
        let failure = self.preload_failure.lock().take();
        let state = Arc::clone(&self.state);
        let config = config.clone();
        let delay = self.preload_delay;

        Ok(Box::pin(stream! {
            yield Ok(LoadProgress::new(0.0));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = failure {
                yield Err(Error::Provider(message));
                return;
            }
            yield Ok(LoadProgress::new(0.5));
            state.lock().loaded = Some(config);
            yield Ok(LoadProgress::new(1.0));
        }))
    }

    async fn stream(&self, input: StreamInput) -> Result<ChunkStream> {
        let cancel = {
            let mut state = self.state.lock();
            if state.loaded.is_none() {
                return Err(Error::ModelNotFound(format!(
                    "no model resident in {} session",
                    self.kind
                )));
            }
            state.generation = CancellationToken::new();
            state.generation.clone()
        };

        let response = self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let prompt_tokens = (input.context.len() / 4) as u32;
        self.inputs.lock().push(input);
        let delay = self.chunk_delay;

        Ok(Box::pin(stream! {
            let started = std::time::Instant::now();
            for piece in response.text.split_inclusive(char::is_whitespace) {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    yield Err(Error::Aborted);
                    return;
                }
                yield Ok(OutputChunk::text(piece));
            }

            if let Some(message) = response.error {
                yield Err(Error::Provider(message));
                return;
            }

            let metrics = response.metrics.unwrap_or_else(|| {
                let elapsed = started.elapsed().as_secs_f64();
                let generated_tokens = (response.text.len() / 4) as u32;
                GenerationMetrics {
                    prompt_tokens,
                    generated_tokens,
                    time_to_first_token_ms: None,
                    tokens_per_second: (elapsed > 0.0)
                        .then(|| generated_tokens as f64 / elapsed),
                }
            });
            yield Ok(OutputChunk::Metrics { metrics });
        }))
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::AcqRel);
        tracing::debug!("Stopping generation in {} session", self.kind);
        self.state.lock().generation.cancel();
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        self.unloads.fetch_add(1, Ordering::AcqRel);
        tracing::debug!("Unloading {} session", self.kind);
        if let Some(message) = self.unload_failure.lock().take() {
            return Err(Error::Provider(message));
        }
        let mut state = self.state.lock();
        state.generation.cancel();
        state.loaded = None;
        Ok(())
    }
}
