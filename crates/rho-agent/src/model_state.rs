//! Backend lifecycle: which model is resident, and streaming through it
//!
//! [`ModelStateCoordinator`] is the single owner of the loaded backend.
//! Loads are serialized: the state lock is held across unload, resolution
//! and preload, so a concurrent `load` observes either the state before or
//! the state after another load, never a partially switched one.

use futures::StreamExt;
use rho_engine::{
    BackendKind, BoxedSession, ChunkStream, LoaderConfig, ModelDescriptor, ModelResolver,
    ProviderConfig, StreamInput, SystemResources,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::store::ChatStore;

/// Description of the resident model
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    /// Chat the model was last loaded for
    pub chat_id: String,
    pub model: ModelDescriptor,
    pub config: ProviderConfig,
}

struct ActiveBackend {
    info: LoadedModel,
    session: BoxedSession,
}

/// Owns backend residency and dispatches generation to the active session
pub struct ModelStateCoordinator {
    sessions: HashMap<BackendKind, BoxedSession>,
    store: Arc<dyn ChatStore>,
    resolver: Arc<dyn ModelResolver>,
    system: SystemResources,
    loader: LoaderConfig,
    active: Mutex<Option<ActiveBackend>>,
}

impl ModelStateCoordinator {
    /// Create a coordinator with no sessions registered
    pub fn new(store: Arc<dyn ChatStore>, resolver: Arc<dyn ModelResolver>) -> Self {
        Self {
            sessions: HashMap::new(),
            store,
            resolver,
            system: SystemResources::detect(),
            loader: LoaderConfig::default(),
            active: Mutex::new(None),
        }
    }

    /// Register the session serving its backend kind, replacing any previous one
    pub fn with_session(mut self, session: BoxedSession) -> Self {
        self.sessions.insert(session.kind(), session);
        self
    }

    pub fn with_system_resources(mut self, system: SystemResources) -> Self {
        self.system = system;
        self
    }

    pub fn with_loader_config(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    /// Backend kinds with a registered session
    pub fn backends(&self) -> Vec<BackendKind> {
        self.sessions.keys().copied().collect()
    }

    /// Load the model selected for `chat_id`
    ///
    /// Loading the model that is already resident is a no-op. A different
    /// model is unloaded before the new one is resolved. A failed load leaves
    /// nothing resident.
    pub async fn load(&self, chat_id: &str) -> Result<()> {
        let model = self.store.selected_model(chat_id).await?;
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_mut() {
            if current.info.model.id == model.id && current.info.model.backend == model.backend {
                tracing::debug!("Model {} already loaded", model.id);
                current.info.chat_id = chat_id.to_string();
                return Ok(());
            }
        }

        if let Some(previous) = active.take() {
            tracing::info!(
                "Unloading {} ({}) before loading {}",
                previous.info.model.id,
                previous.session.kind(),
                model.id
            );
            if let Err(e) = previous.session.unload().await {
                tracing::warn!("Unload of {} failed: {}", previous.info.model.id, e);
                *active = Some(previous);
                return Err(e.into());
            }
        }

        let path = match self.resolver.resolve(&model).await {
            Ok(path) => path,
            Err(e @ rho_engine::Error::ModelFileMissing { .. }) => {
                tracing::warn!("{}; marking {} as not downloaded", e, model.id);
                if let Err(mark) = self.store.mark_model_not_downloaded(&model.id).await {
                    tracing::warn!("Failed to reset download state of {}: {}", model.id, mark);
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let session = self
            .sessions
            .get(&model.backend)
            .cloned()
            .ok_or(rho_engine::Error::UnsupportedBackend(model.backend))?;
        let config = ProviderConfig::new(&path, &self.loader, &self.system);

        if let Err(e) = Self::preload(&session, &config).await {
            tracing::warn!("Preload of {} failed: {}", model.id, e);
            if let Err(cleanup) = session.unload().await {
                tracing::warn!("Cleanup after failed preload failed: {}", cleanup);
            }
            return Err(e.into());
        }

        tracing::info!(
            "Loaded {} on {} (context {}, batch {}, threads {})",
            model.id,
            model.backend,
            config.context_size,
            config.batch_size,
            config.thread_count
        );
        *active = Some(ActiveBackend {
            info: LoadedModel {
                chat_id: chat_id.to_string(),
                model,
                config,
            },
            session,
        });
        Ok(())
    }

    /// Drive a preload to completion, discarding progress
    async fn preload(session: &BoxedSession, config: &ProviderConfig) -> rho_engine::Result<()> {
        let mut progress = session.preload(config).await?;
        while let Some(update) = progress.next().await {
            let update = update?;
            tracing::trace!("Preload progress {:.0}%", update.fraction * 100.0);
        }
        Ok(())
    }

    /// Unload the resident model, if any
    pub async fn unload(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(current) = active.as_ref() else {
            return Ok(());
        };
        current.session.unload().await?;
        tracing::info!("Unloaded {}", current.info.model.id);
        *active = None;
        Ok(())
    }

    /// Cancel in-flight generation; the model stays resident
    pub async fn stop(&self) -> Result<()> {
        let session = match self.active.lock().await.as_ref() {
            Some(current) => Arc::clone(&current.session),
            None => return Ok(()),
        };
        session.stop().await?;
        Ok(())
    }

    /// Stream from the active session
    ///
    /// Mid-stream backend errors are passed through untouched.
    pub async fn stream(&self, input: StreamInput) -> Result<ChunkStream> {
        let session = match self.active.lock().await.as_ref() {
            Some(current) => Arc::clone(&current.session),
            None => {
                return Err(rho_engine::Error::ModelNotFound("no chat loaded".to_string()).into());
            }
        };
        Ok(session.stream(input).await?)
    }

    /// The resident model, if any
    pub async fn loaded(&self) -> Option<LoadedModel> {
        self.active.lock().await.as_ref().map(|a| a.info.clone())
    }

    pub async fn is_loaded(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::InMemoryChatStore;
    use crate::testing::{self, Recorder, StaticResolver};
    use rho_engine::{DownloadState, ScriptedResponse, ScriptedSession};
    use std::time::Duration;

    fn system() -> SystemResources {
        SystemResources {
            memory_bytes: 16 * 1024 * 1024 * 1024,
            processor_count: 4,
        }
    }

    struct Fixture {
        coordinator: Arc<ModelStateCoordinator>,
        store: InMemoryChatStore,
        resolver: Arc<StaticResolver>,
        recorder: Arc<Recorder>,
        accelerated: Arc<ScriptedSession>,
        cpu: Arc<ScriptedSession>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryChatStore::new()
            .with_chat("a", testing::model("alpha", BackendKind::Accelerated))
            .with_chat("a2", testing::model("alpha", BackendKind::Accelerated))
            .with_chat("b", testing::model("beta", BackendKind::Cpu))
            .with_chat("c", testing::model("gamma", BackendKind::Cpu))
            .with_chat("r", testing::model("remote", BackendKind::Remote));
        let resolver = Arc::new(StaticResolver::new());
        let recorder = Recorder::new();
        let accelerated = Arc::new(
            ScriptedSession::new(BackendKind::Accelerated)
                .with_preload_delay(Duration::from_millis(5)),
        );
        let cpu = Arc::new(
            ScriptedSession::new(BackendKind::Cpu).with_preload_delay(Duration::from_millis(5)),
        );
        let coordinator = ModelStateCoordinator::new(Arc::new(store.clone()), resolver.clone())
            .with_system_resources(system())
            .with_session(recorder.wrap(accelerated.clone()))
            .with_session(recorder.wrap(cpu.clone()));
        Fixture {
            coordinator: Arc::new(coordinator),
            store,
            resolver,
            recorder,
            accelerated,
            cpu,
        }
    }

    #[tokio::test]
    async fn test_load_twice_preloads_once() {
        let f = fixture();
        f.coordinator.load("a").await.unwrap();
        f.coordinator.load("a").await.unwrap();
        assert_eq!(f.accelerated.preload_count(), 1);
        assert_eq!(f.accelerated.unload_count(), 0);
        assert_eq!(f.recorder.log(), vec!["preload:accelerated"]);
    }

    #[tokio::test]
    async fn test_same_model_other_chat_is_noop() {
        let f = fixture();
        f.coordinator.load("a").await.unwrap();
        f.coordinator.load("a2").await.unwrap();
        assert_eq!(f.accelerated.preload_count(), 1);
        assert_eq!(f.coordinator.loaded().await.unwrap().chat_id, "a2");
    }

    #[tokio::test]
    async fn test_switch_unloads_before_loading() {
        let f = fixture();
        f.coordinator.load("a").await.unwrap();
        f.coordinator.load("b").await.unwrap();
        assert_eq!(
            f.recorder.log(),
            vec!["preload:accelerated", "unload:accelerated", "preload:cpu"]
        );
        assert_eq!(f.recorder.overlaps(), 0);
        assert!(!f.accelerated.is_loaded());
        assert!(f.cpu.is_loaded());
    }

    #[tokio::test]
    async fn test_switch_within_same_backend() {
        let f = fixture();
        f.coordinator.load("b").await.unwrap();
        f.coordinator.load("c").await.unwrap();
        assert_eq!(f.cpu.preload_count(), 2);
        assert_eq!(f.cpu.unload_count(), 1);
        assert_eq!(f.coordinator.loaded().await.unwrap().model.id, "gamma");
    }

    #[tokio::test]
    async fn test_concurrent_loads_never_overlap() {
        let f = fixture();
        let mut handles = Vec::new();
        for chat in ["a", "b", "a", "c", "b"] {
            let coordinator = Arc::clone(&f.coordinator);
            handles.push(tokio::spawn(async move { coordinator.load(chat).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(f.recorder.overlaps(), 0);
        assert!(!(f.accelerated.is_loaded() && f.cpu.is_loaded()));
        assert!(f.coordinator.is_loaded().await);
    }

    #[tokio::test]
    async fn test_provider_config() {
        let f = fixture();
        f.coordinator.load("b").await.unwrap();
        let config = f.cpu.loaded_config().unwrap();
        assert_eq!(config.context_size, 2048);
        assert_eq!(config.batch_size, 2048);
        assert_eq!(config.thread_count, 4);
        assert!(config.authentication.is_none());
        assert_eq!(config.model_path, std::path::PathBuf::from("/models/beta.gguf"));
    }

    #[tokio::test]
    async fn test_missing_file_resets_download_state() {
        let f = fixture();
        f.resolver.mark_missing("beta");
        let err = f.coordinator.load("b").await.unwrap_err();
        assert!(
            matches!(err, Error::Engine(rho_engine::Error::ModelFileMissing { .. })),
            "got {:?}",
            err
        );
        assert_eq!(f.store.download_state("b"), Some(DownloadState::NotDownloaded));
        assert!(!f.coordinator.is_loaded().await);
        assert_eq!(f.cpu.preload_count(), 0);

        // A later attempt is a fresh load
        f.resolver.restore("beta");
        f.coordinator.load("b").await.unwrap();
        assert!(f.cpu.is_loaded());
    }

    #[tokio::test]
    async fn test_failed_switch_leaves_nothing_resident() {
        let f = fixture();
        f.coordinator.load("a").await.unwrap();
        f.resolver.mark_missing("beta");
        assert!(f.coordinator.load("b").await.is_err());
        assert!(!f.accelerated.is_loaded());
        assert!(!f.coordinator.is_loaded().await);
    }

    #[tokio::test]
    async fn test_failed_unload_keeps_previous_model_active() {
        let f = fixture();
        f.coordinator.load("a").await.unwrap();
        f.accelerated.fail_next_unload("device busy");

        let err = f.coordinator.load("b").await.unwrap_err();
        assert!(err.to_string().contains("device busy"), "{}", err);
        assert!(f.accelerated.is_loaded());
        assert_eq!(f.cpu.preload_count(), 0);
        let loaded = f.coordinator.loaded().await.unwrap();
        assert_eq!(loaded.model.id, "alpha");

        // The retry unloads the still-resident model first
        f.coordinator.load("b").await.unwrap();
        assert!(!f.accelerated.is_loaded());
        assert!(f.cpu.is_loaded());
        assert_eq!(f.recorder.overlaps(), 0);
    }

    #[tokio::test]
    async fn test_not_downloaded_is_typed() {
        let f = fixture();
        f.resolver.mark_not_downloaded("beta", "org/beta");
        match f.coordinator.load("b").await {
            Err(Error::Engine(rho_engine::Error::ModelNotDownloaded { repo_id })) => {
                assert_eq!(repo_id, "org/beta")
            }
            other => panic!("expected ModelNotDownloaded, got {:?}", other),
        }
        assert_eq!(f.store.download_state("b"), Some(DownloadState::Downloaded));
    }

    #[tokio::test]
    async fn test_unsupported_backend() {
        let f = fixture();
        let err = f.coordinator.load("r").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Engine(rho_engine::Error::UnsupportedBackend(BackendKind::Remote))
        ));
        assert!(!f.coordinator.is_loaded().await);
    }

    #[tokio::test]
    async fn test_preload_failure_is_retryable() {
        let f = fixture();
        f.cpu.fail_next_preload("out of memory");
        let err = f.coordinator.load("b").await.unwrap_err();
        assert_eq!(err.to_string(), "Provider error: out of memory");
        assert!(!f.coordinator.is_loaded().await);

        f.coordinator.load("b").await.unwrap();
        assert!(f.cpu.is_loaded());
        assert_eq!(f.cpu.preload_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_chat() {
        let f = fixture();
        assert!(matches!(
            f.coordinator.load("zzz").await,
            Err(Error::ChatNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unload_and_stop_without_model_are_noops() {
        let f = fixture();
        f.coordinator.unload().await.unwrap();
        f.coordinator.stop().await.unwrap();
        assert_eq!(f.accelerated.unload_count() + f.cpu.unload_count(), 0);
        assert_eq!(f.accelerated.stop_count() + f.cpu.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_keeps_model_loaded() {
        let f = fixture();
        f.coordinator.load("b").await.unwrap();
        f.coordinator.stop().await.unwrap();
        assert_eq!(f.cpu.stop_count(), 1);
        assert!(f.cpu.is_loaded());
        assert!(f.coordinator.is_loaded().await);
    }

    #[tokio::test]
    async fn test_unload_clears_state() {
        let f = fixture();
        f.coordinator.load("b").await.unwrap();
        f.coordinator.unload().await.unwrap();
        assert!(!f.cpu.is_loaded());
        assert!(f.coordinator.loaded().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_requires_loaded_model() {
        let f = fixture();
        let err = match f.coordinator.stream(StreamInput::new("hi")).await {
            Err(e) => e,
            Ok(_) => panic!("expected stream to fail"),
        };
        assert!(matches!(err, Error::Engine(rho_engine::Error::ModelNotFound(_))));
    }

    #[tokio::test]
    async fn test_stream_passes_errors_through() {
        let f = fixture();
        f.cpu.push_response(ScriptedResponse::failing("half an ", "backend crashed"));
        f.coordinator.load("b").await.unwrap();
        let mut stream = f.coordinator.stream(StreamInput::new("hi")).await.unwrap();
        let mut text = String::new();
        let mut error = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(rho_engine::OutputChunk::Text { delta }) => text.push_str(&delta),
                Ok(_) => {}
                Err(e) => error = Some(e),
            }
        }
        assert_eq!(text, "half an ");
        assert!(matches!(error, Some(rho_engine::Error::Provider(m)) if m == "backend crashed"));
    }
}
