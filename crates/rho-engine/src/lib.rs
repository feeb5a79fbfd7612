//! rho-engine: Uniform inference-backend session abstraction
//!
//! This crate provides the contract every inference backend implements
//! (preload, stream, stop, unload), the model and provider configuration
//! types those backends consume, and model location resolution.

pub mod config;
pub mod error;
pub mod resolver;
pub mod sessions;
pub mod stream;
pub mod types;

pub use config::{LoaderConfig, ProviderConfig, SystemResources};
pub use error::{Error, Result};
pub use resolver::{LocalModelResolver, ModelResolver};
pub use sessions::{BackendSession, BoxedSession, ScriptedResponse, ScriptedSession};
pub use stream::{ChunkStream, OutputAccumulator, ProgressStream};
pub use types::*;
