//! Core types for backend sessions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Families of inference engine a model can run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Local inference on a GPU / unified-memory accelerator
    Accelerated,
    /// Local inference on the CPU
    Cpu,
    /// A remote inference API
    Remote,
}

impl BackendKind {
    /// Get a stable lowercase name for this backend
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Accelerated => "accelerated",
            BackendKind::Cpu => "cpu",
            BackendKind::Remote => "remote",
        }
    }

    /// Whether weights for this backend live on the local machine
    pub fn is_local(&self) -> bool {
        !matches!(self, BackendKind::Remote)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accelerated" | "mlx" | "gpu" => Ok(BackendKind::Accelerated),
            "cpu" | "llama" | "llama-cpp" => Ok(BackendKind::Cpu),
            "remote" | "api" => Ok(BackendKind::Remote),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown backend kind: {}",
                other
            ))),
        }
    }
}

/// Where a model's weights come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelLocation {
    /// A model repository identifier (e.g. `org/name`)
    Repository { repo_id: String },
    /// A file already on the local filesystem
    LocalFile { path: PathBuf },
    /// An arbitrary download URL
    Url { url: String },
}

impl fmt::Display for ModelLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelLocation::Repository { repo_id } => write!(f, "repo:{}", repo_id),
            ModelLocation::LocalFile { path } => write!(f, "file:{}", path.display()),
            ModelLocation::Url { url } => f.write_str(url),
        }
    }
}

/// Persisted download state of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    #[default]
    NotDownloaded,
    Downloaded,
}

/// Model definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Backend the model runs on
    pub backend: BackendKind,
    /// Where the weights come from
    pub location: ModelLocation,
    /// Model architecture (e.g. "llama", "qwen2")
    pub architecture: String,
    /// Memory needed to keep the model resident, in bytes
    pub ram_requirement: u64,
    /// Context window size in tokens (0 when unknown)
    pub context_window: u32,
    /// Whether the weights are on disk
    #[serde(default)]
    pub download_state: DownloadState,
}

impl ModelDescriptor {
    /// Create a descriptor with empty architecture and unknown sizes
    pub fn new(id: impl Into<String>, backend: BackendKind, location: ModelLocation) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            backend,
            location,
            architecture: String::new(),
            ram_requirement: 0,
            context_window: 0,
            download_state: DownloadState::Downloaded,
        }
    }

    /// Set the architecture
    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    /// Set the context window
    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    /// Set the resident memory requirement
    pub fn with_ram_requirement(mut self, bytes: u64) -> Self {
        self.ram_requirement = bytes;
        self
    }
}

/// Sampling parameters for a single generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParameters {
    pub temperature: f32,
    pub top_p: f32,
    /// Sequences that end generation when produced
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

impl Default for SamplingParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            stop_sequences: Vec::new(),
        }
    }
}

/// Hard limits a backend must respect for one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Context window the backend was loaded with
    pub context_size: u32,
    /// Maximum tokens to generate
    pub max_tokens: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            context_size: crate::config::DEFAULT_CONTEXT_SIZE,
            max_tokens: 1024,
        }
    }
}

/// Structured input accepted by every backend session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInput {
    /// Fully rendered textual context
    pub context: String,
    pub sampling: SamplingParameters,
    pub limits: ResourceLimits,
}

impl StreamInput {
    /// Create an input with default sampling and limits
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            sampling: SamplingParameters::default(),
            limits: ResourceLimits::default(),
        }
    }
}

/// Performance metrics reported at the end of a generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    /// Tokens consumed by the prompt
    pub prompt_tokens: u32,
    /// Tokens produced
    pub generated_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_first_token_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
}

impl GenerationMetrics {
    /// Tokens occupying the context window after this generation
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.generated_tokens)
    }
}

/// One item of a backend's output sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputChunk {
    /// Newly generated text
    Text { delta: String },
    /// Metrics for the finished generation
    Metrics { metrics: GenerationMetrics },
}

impl OutputChunk {
    /// Create a text chunk
    pub fn text(delta: impl Into<String>) -> Self {
        Self::Text {
            delta: delta.into(),
        }
    }
}

/// Progress reported while a backend becomes resident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadProgress {
    /// Completed fraction in `0.0..=1.0`
    pub fraction: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LoadProgress {
    pub fn new(fraction: f32) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            message: None,
        }
    }
}
