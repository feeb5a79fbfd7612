//! Configuration file support

use rho_agent::{CompactionConfig, OrchestratorConfig};
use rho_engine::{BackendKind, LoaderConfig, ModelDescriptor, ModelLocation};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for rho
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentSettings,
    pub compaction: CompactionSettings,
    pub models: ModelSettings,
    pub replay: ReplaySettings,
}

/// Loop settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_iterations: Option<u32>,
    pub system_instruction: Option<String>,
    /// Offer the `delegate` tool
    pub delegation: Option<bool>,
    /// Default sub-agent timeout in seconds
    pub sub_agent_timeout_secs: Option<u64>,
}

/// Context compaction settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    pub soft_threshold: Option<f64>,
    pub hard_threshold: Option<f64>,
    pub auto_flush: Option<bool>,
}

/// Where models live and which one to use
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Directory downloaded models are stored in
    pub directory: Option<PathBuf>,
    /// Context size backends are loaded with
    pub context_size: Option<u32>,
    pub default: Option<ModelEntry>,
}

/// A model definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub backend: BackendKind,
    pub location: ModelLocation,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub context_window: Option<u32>,
}

/// Replay backend settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    /// JSON file holding the scripted responses
    pub script: Option<PathBuf>,
    /// Delay between streamed chunks
    pub chunk_delay_ms: Option<u64>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rho")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        // Check for RHO_CONFIG_PATH env var first
        if let Ok(path) = std::env::var("RHO_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from `path`, or from the default location
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Write the example config if no config file exists
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// Directory the model resolver looks in
    pub fn models_dir(&self) -> PathBuf {
        self.models
            .directory
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("models"))
    }

    pub fn loader_config(&self) -> LoaderConfig {
        let mut loader = LoaderConfig::default();
        if let Some(context_size) = self.models.context_size {
            loader.context_size = context_size;
        }
        loader
    }

    /// The configured model, or the replay model when none is configured
    pub fn model(&self) -> ModelDescriptor {
        let Some(entry) = &self.models.default else {
            return ModelDescriptor::new(
                "replay",
                BackendKind::Remote,
                ModelLocation::Url {
                    url: "replay://local".to_string(),
                },
            );
        };
        let mut model = ModelDescriptor::new(&entry.id, entry.backend, entry.location.clone());
        if let Some(architecture) = &entry.architecture {
            model.architecture = architecture.clone();
        }
        if let Some(window) = entry.context_window {
            model = model.with_context_window(window);
        }
        model
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        let compaction_defaults = CompactionConfig::default();
        OrchestratorConfig {
            max_iterations: self.agent.max_iterations.unwrap_or(defaults.max_iterations),
            compaction: CompactionConfig {
                soft_threshold: self
                    .compaction
                    .soft_threshold
                    .unwrap_or(compaction_defaults.soft_threshold),
                hard_threshold: self
                    .compaction
                    .hard_threshold
                    .unwrap_or(compaction_defaults.hard_threshold),
                auto_flush_enabled: self
                    .compaction
                    .auto_flush
                    .unwrap_or(compaction_defaults.auto_flush_enabled),
                ..compaction_defaults
            },
            system_instruction: self.agent.system_instruction.clone(),
            enable_delegation: self.agent.delegation.unwrap_or(defaults.enable_delegation),
            sub_agent_timeout: self
                .agent
                .sub_agent_timeout_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or(defaults.sub_agent_timeout),
            ..defaults
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# rho configuration file
# Place at ~/.config/rho/config.toml (Linux) or set RHO_CONFIG_PATH

[agent]
# Loop passes allowed before a run fails
max_iterations = 10
# system_instruction = "You are a helpful on-device assistant."
delegation = true
sub_agent_timeout_secs = 120

[compaction]
# Request a memory flush at this context utilization
soft_threshold = 0.80
# Stop the run at this context utilization
hard_threshold = 0.90
auto_flush = true

[models]
# directory = "~/.config/rho/models"
context_size = 2048

# Without a default model, the replay backend answers on its own
# [models.default]
# id = "qwen2.5-0.5b"
# backend = "cpu"
# architecture = "qwen2"
# context_window = 32768
# location = { type = "local_file", path = "/path/to/model.gguf" }

[replay]
# JSON array of responses: [{"text": "<final>Hi!</final>"}]
# script = "~/.config/rho/replay.json"
chunk_delay_ms = 20
"#
}
