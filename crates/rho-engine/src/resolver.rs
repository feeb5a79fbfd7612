//! Model location resolution

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::{ModelDescriptor, ModelLocation};

/// Turns a model's declared location into a concrete local path
#[async_trait]
pub trait ModelResolver: Send + Sync {
    /// Resolve the weights for `model`, failing with
    /// [`Error::ModelNotDownloaded`] or [`Error::ModelFileMissing`]
    async fn resolve(&self, model: &ModelDescriptor) -> Result<PathBuf>;
}

/// Resolves models against a local models directory
///
/// Repository ids map to `<dir>/<owner>--<name>`, URLs to
/// `<dir>/<last path segment>`, and local files to themselves.
#[derive(Debug, Clone)]
pub struct LocalModelResolver {
    models_dir: PathBuf,
}

impl LocalModelResolver {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    /// Directory downloaded models are stored in
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Where a repository's files are expected on disk
    pub fn repository_path(&self, repo_id: &str) -> PathBuf {
        self.models_dir.join(repo_id.replace('/', "--"))
    }

    /// Where a URL download is expected on disk
    pub fn url_path(&self, url: &str) -> PathBuf {
        let without_query = url.split(['?', '#']).next().unwrap_or(url);
        let name = without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("model");
        self.models_dir.join(name)
    }
}

#[async_trait]
impl ModelResolver for LocalModelResolver {
    async fn resolve(&self, model: &ModelDescriptor) -> Result<PathBuf> {
        if !model.backend.is_local() {
            // Remote backends take their endpoint verbatim
            return Ok(PathBuf::from(model.location.to_string()));
        }

        match &model.location {
            ModelLocation::Repository { repo_id } => {
                let path = self.repository_path(repo_id);
                if exists(&path).await {
                    Ok(path)
                } else {
                    Err(Error::ModelNotDownloaded {
                        repo_id: repo_id.clone(),
                    })
                }
            }
            ModelLocation::LocalFile { path } => {
                if exists(path).await {
                    Ok(path.clone())
                } else {
                    tracing::warn!("Model file {} is missing", path.display());
                    Err(Error::ModelFileMissing { path: path.clone() })
                }
            }
            ModelLocation::Url { url } => {
                let path = self.url_path(url);
                if exists(&path).await {
                    Ok(path)
                } else {
                    Err(Error::ModelNotDownloaded {
                        repo_id: url.clone(),
                    })
                }
            }
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
