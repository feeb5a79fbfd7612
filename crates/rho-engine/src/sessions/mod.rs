//! Backend session implementations

pub mod scripted;

pub use scripted::{ScriptedResponse, ScriptedSession};

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::error::Result;
use crate::stream::{ChunkStream, ProgressStream};
use crate::types::{BackendKind, StreamInput};

/// Trait for inference backends
///
/// A session is long-lived: it is created once per backend kind and is
/// loaded, streamed from and unloaded many times over its lifetime.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Backend kind this session serves
    fn kind(&self) -> BackendKind;

    /// Make the model resident. The returned stream reports progress and
    /// ends once the model is loaded.
    async fn preload(&self, config: &ProviderConfig) -> Result<ProgressStream>;

    /// Generate output for `input`
    async fn stream(&self, input: StreamInput) -> Result<ChunkStream>;

    /// Cancel in-flight generation; the model stays resident
    async fn stop(&self) -> Result<()>;

    /// Release the model's memory
    async fn unload(&self) -> Result<()>;
}

/// Type alias for a shared session
pub type BoxedSession = Arc<dyn BackendSession>;
