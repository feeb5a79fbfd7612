//! Shared test fixtures

use async_trait::async_trait;
use parking_lot::Mutex;
use rho_engine::{
    BackendKind, BackendSession, BoxedSession, ChunkStream, ModelDescriptor, ModelLocation,
    ModelResolver, ProgressStream, ProviderConfig, ScriptedSession, StreamInput,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::tool::{Tool, ToolResult};

/// A downloaded local-file model with a 4096 token window
pub(crate) fn model(id: &str, kind: BackendKind) -> ModelDescriptor {
    ModelDescriptor::new(
        id,
        kind,
        ModelLocation::LocalFile {
            path: PathBuf::from(format!("/models/{}.gguf", id)),
        },
    )
    .with_context_window(4096)
}

/// Resolver whose failures are toggled per model id
#[derive(Default)]
pub(crate) struct StaticResolver {
    missing: Mutex<HashSet<String>>,
    not_downloaded: Mutex<HashMap<String, String>>,
}

impl StaticResolver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn mark_missing(&self, id: &str) {
        self.missing.lock().insert(id.to_string());
    }

    pub(crate) fn restore(&self, id: &str) {
        self.missing.lock().remove(id);
        self.not_downloaded.lock().remove(id);
    }

    pub(crate) fn mark_not_downloaded(&self, id: &str, repo_id: &str) {
        self.not_downloaded
            .lock()
            .insert(id.to_string(), repo_id.to_string());
    }
}

#[async_trait]
impl ModelResolver for StaticResolver {
    async fn resolve(&self, model: &ModelDescriptor) -> rho_engine::Result<PathBuf> {
        if let Some(repo_id) = self.not_downloaded.lock().get(&model.id) {
            return Err(rho_engine::Error::ModelNotDownloaded {
                repo_id: repo_id.clone(),
            });
        }
        let path = match &model.location {
            ModelLocation::LocalFile { path } => path.clone(),
            other => PathBuf::from(other.to_string()),
        };
        if self.missing.lock().contains(&model.id) {
            return Err(rho_engine::Error::ModelFileMissing { path });
        }
        Ok(path)
    }
}

#[derive(Default)]
struct RecorderState {
    log: Vec<String>,
    resident: HashSet<BackendKind>,
    overlaps: u32,
}

/// Records lifecycle calls across several sessions in one timeline
#[derive(Default)]
pub(crate) struct Recorder {
    state: Mutex<RecorderState>,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wrap `session` so its preloads and unloads are recorded here
    pub(crate) fn wrap(self: &Arc<Self>, session: Arc<ScriptedSession>) -> BoxedSession {
        Arc::new(RecordingSession {
            inner: session,
            recorder: Arc::clone(self),
        })
    }

    /// Calls in order, as `preload:<kind>` / `unload:<kind>`
    pub(crate) fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Preloads that started while another backend was resident
    pub(crate) fn overlaps(&self) -> u32 {
        self.state.lock().overlaps
    }
}

struct RecordingSession {
    inner: Arc<ScriptedSession>,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl BackendSession for RecordingSession {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn preload(&self, config: &ProviderConfig) -> rho_engine::Result<ProgressStream> {
        let kind = self.kind();
        {
            let mut state = self.recorder.state.lock();
            state.log.push(format!("preload:{}", kind));
            if state.resident.iter().any(|k| *k != kind) {
                state.overlaps += 1;
            }
            state.resident.insert(kind);
        }
        self.inner.preload(config).await
    }

    async fn stream(&self, input: StreamInput) -> rho_engine::Result<ChunkStream> {
        self.inner.stream(input).await
    }

    async fn stop(&self) -> rho_engine::Result<()> {
        self.inner.stop().await
    }

    async fn unload(&self) -> rho_engine::Result<()> {
        let kind = self.kind();
        self.recorder.state.lock().log.push(format!("unload:{}", kind));
        self.inner.unload().await?;
        self.recorder.state.lock().resident.remove(&kind);
        Ok(())
    }
}

/// Sleeps for `millis`, giving up early when cancelled
#[derive(Default)]
pub(crate) struct SlowTool {
    started: AtomicU32,
    completed: AtomicU32,
}

impl SlowTool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn started(&self) -> u32 {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn completed(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Waits for the given number of milliseconds"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "millis": { "type": "integer", "minimum": 0 }
            },
            "required": ["millis"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        self.started.fetch_add(1, Ordering::AcqRel);
        let millis = arguments["millis"].as_u64().unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {
                self.completed.fetch_add(1, Ordering::AcqRel);
                ToolResult::text(format!("slept {}ms", millis))
            }
            _ = cancel.cancelled() => ToolResult::error("cancelled"),
        }
    }
}

/// Two-operand arithmetic; dividing by zero is an error result
pub(crate) struct Calculator;

#[async_trait]
impl Tool for Calculator {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Basic arithmetic on two numbers"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "operation": { "type": "string", "enum": ["add", "subtract", "multiply", "divide"] },
                "first": { "type": "number" },
                "second": { "type": "number" }
            },
            "required": ["operation", "first", "second"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let a = arguments["first"].as_f64().unwrap_or(0.0);
        let b = arguments["second"].as_f64().unwrap_or(0.0);
        match arguments["operation"].as_str().unwrap_or("") {
            "add" => ToolResult::text((a + b).to_string()),
            "subtract" => ToolResult::text((a - b).to_string()),
            "multiply" => ToolResult::text((a * b).to_string()),
            "divide" if b == 0.0 => ToolResult::error("Division by zero"),
            "divide" => ToolResult::text((a / b).to_string()),
            other => ToolResult::error(format!("Unknown operation: {}", other)),
        }
    }
}
