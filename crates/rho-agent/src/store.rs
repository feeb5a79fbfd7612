//! Persistence contract and an in-memory implementation

use async_trait::async_trait;
use parking_lot::Mutex;
use rho_engine::{DownloadState, ModelDescriptor, ResourceLimits, SamplingParameters};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::channel::Channel;
use crate::context::ContextEntry;
use crate::error::{Error, Result};

/// Personality-derived generation parameters of a chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub temperature: f32,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    pub max_tokens: u32,
    /// Tools the chat may use; `None` allows all
    #[serde(default)]
    pub tool_allow_list: Option<Vec<String>>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            stop_sequences: Vec::new(),
            max_tokens: 1024,
            tool_allow_list: None,
        }
    }
}

impl GenerationParameters {
    pub fn sampling(&self) -> SamplingParameters {
        SamplingParameters {
            temperature: self.temperature,
            stop_sequences: self.stop_sequences.clone(),
            ..Default::default()
        }
    }

    pub fn limits(&self, context_size: u32) -> ResourceLimits {
        ResourceLimits {
            context_size,
            max_tokens: self.max_tokens,
        }
    }
}

/// How a message's run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MessageStatus {
    Completed,
    Interrupted,
    Failed { error: String },
}

/// Terminal state of an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalMessageState {
    pub status: MessageStatus,
    /// The user prompt that started the run
    pub prompt: String,
    /// Channels of the last completed stream
    pub channels: Vec<Channel>,
    /// Raw text streamed before the run ended, kept for failed runs
    pub partial: String,
    pub tools_used: Vec<String>,
    pub iterations: u32,
}

impl FinalMessageState {
    /// Text of the final-answer channels, falling back to the partial text
    pub fn text(&self) -> String {
        let text = self
            .channels
            .iter()
            .filter(|c| c.kind == crate::channel::ChannelKind::Final)
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            self.partial.clone()
        } else {
            text
        }
    }
}

/// Conversation persistence as seen by the control plane
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// The model selected for a chat
    async fn selected_model(&self, chat_id: &str) -> Result<ModelDescriptor>;

    /// Reset a model's persisted state so the next load re-triggers download
    async fn mark_model_not_downloaded(&self, model_id: &str) -> Result<()>;

    async fn generation_parameters(&self, chat_id: &str) -> Result<GenerationParameters>;

    /// Prior turns of a chat, oldest first
    async fn history(&self, chat_id: &str) -> Result<Vec<ContextEntry>>;

    /// Append streamed text to a message
    async fn append_partial(&self, chat_id: &str, message_id: Uuid, delta: &str) -> Result<()>;

    /// Replace a message's channels with the latest parsed output
    async fn update_channels(&self, message_id: Uuid, channels: &[Channel]) -> Result<()>;

    /// Record a message's terminal state
    async fn finalize_message(&self, message_id: Uuid, state: FinalMessageState) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
struct ChatRecord {
    model: Option<ModelDescriptor>,
    parameters: GenerationParameters,
    history: Vec<ContextEntry>,
}

/// A persisted assistant message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageRecord {
    pub chat_id: String,
    pub partial: String,
    pub channels: Vec<Channel>,
    pub final_state: Option<FinalMessageState>,
}

#[derive(Default)]
struct StoreInner {
    chats: HashMap<String, ChatRecord>,
    messages: HashMap<Uuid, MessageRecord>,
}

/// [`ChatStore`] backed by in-process maps
///
/// Completed runs append the prompt and the final answer to the chat's
/// history. Cloning is cheap; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryChatStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a chat with a selected model
    pub fn insert_chat(&self, chat_id: impl Into<String>, model: ModelDescriptor) {
        self.inner.lock().chats.insert(
            chat_id.into(),
            ChatRecord {
                model: Some(model),
                ..Default::default()
            },
        );
    }

    /// Builder form of [`insert_chat`](Self::insert_chat)
    pub fn with_chat(self, chat_id: impl Into<String>, model: ModelDescriptor) -> Self {
        self.insert_chat(chat_id, model);
        self
    }

    pub fn select_model(&self, chat_id: &str, model: ModelDescriptor) {
        self.inner
            .lock()
            .chats
            .entry(chat_id.to_string())
            .or_default()
            .model = Some(model);
    }

    pub fn set_parameters(&self, chat_id: &str, parameters: GenerationParameters) {
        self.inner
            .lock()
            .chats
            .entry(chat_id.to_string())
            .or_default()
            .parameters = parameters;
    }

    pub fn message(&self, message_id: Uuid) -> Option<MessageRecord> {
        self.inner.lock().messages.get(&message_id).cloned()
    }

    /// Download state of a chat's selected model
    pub fn download_state(&self, chat_id: &str) -> Option<DownloadState> {
        self.inner
            .lock()
            .chats
            .get(chat_id)
            .and_then(|c| c.model.as_ref())
            .map(|m| m.download_state)
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn selected_model(&self, chat_id: &str) -> Result<ModelDescriptor> {
        self.inner
            .lock()
            .chats
            .get(chat_id)
            .and_then(|c| c.model.clone())
            .ok_or_else(|| Error::ChatNotFound(chat_id.to_string()))
    }

    async fn mark_model_not_downloaded(&self, model_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        for model in inner.chats.values_mut().filter_map(|c| c.model.as_mut()) {
            if model.id == model_id {
                model.download_state = DownloadState::NotDownloaded;
            }
        }
        Ok(())
    }

    async fn generation_parameters(&self, chat_id: &str) -> Result<GenerationParameters> {
        self.inner
            .lock()
            .chats
            .get(chat_id)
            .map(|c| c.parameters.clone())
            .ok_or_else(|| Error::ChatNotFound(chat_id.to_string()))
    }

    async fn history(&self, chat_id: &str) -> Result<Vec<ContextEntry>> {
        Ok(self
            .inner
            .lock()
            .chats
            .get(chat_id)
            .map(|c| c.history.clone())
            .unwrap_or_default())
    }

    async fn append_partial(&self, chat_id: &str, message_id: Uuid, delta: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.messages.entry(message_id).or_insert_with(|| MessageRecord {
            chat_id: chat_id.to_string(),
            ..Default::default()
        });
        record.partial.push_str(delta);
        Ok(())
    }

    async fn update_channels(&self, message_id: Uuid, channels: &[Channel]) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| Error::Persistence(format!("unknown message {}", message_id)))?;
        record.channels = channels.to_vec();
        Ok(())
    }

    async fn finalize_message(&self, message_id: Uuid, state: FinalMessageState) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.messages.entry(message_id).or_default();
        let chat_id = record.chat_id.clone();
        if state.status == MessageStatus::Completed {
            let answer = state.text();
            if let Some(chat) = inner.chats.get_mut(&chat_id) {
                chat.history.push(ContextEntry::user(state.prompt.clone()));
                chat.history.push(ContextEntry::assistant(answer));
            }
        }
        if let Some(record) = inner.messages.get_mut(&message_id) {
            record.final_state = Some(state);
        }
        Ok(())
    }
}
