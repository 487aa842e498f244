//! Fetching of build artifacts into a local, per-worker cache.
//!
//! Artifacts are identified by content, so a cached copy never goes stale; each artifact is
//! downloaded at most once per worker no matter how many jobs reference it.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use devq_utils::protocol::{ArtifactId, BuildArtifact, BuildArtifacts};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::device::LocalArtifacts;

/// How many distinct artifacts a worker remembers having fetched.
pub const DEFAULT_CACHE_CAPACITY: u64 = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("artifact {artifact} is unavailable: {reason}")]
    Unavailable { artifact: ArtifactId, reason: String },
    #[error("failed to store artifact {artifact}: {reason}")]
    Io { artifact: ArtifactId, reason: String },
    #[error("refusing artifact with unsafe id {0:?}")]
    InvalidId(ArtifactId),
}

impl ArtifactError {
    pub fn artifact(&self) -> &ArtifactId {
        match self {
            ArtifactError::Unavailable { artifact, .. }
            | ArtifactError::Io { artifact, .. }
            | ArtifactError::InvalidId(artifact) => artifact,
        }
    }

    fn io(artifact: &ArtifactId, error: std::io::Error) -> Self {
        Self::Io {
            artifact: artifact.clone(),
            reason: error.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArtifactSourceError {
    #[error("invalid artifact store URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("artifact store URL {0} cannot be a base")]
    NotABase(Url),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Where artifacts come from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Downloads `artifact` to exactly `dest`. Implementations may assume `dest`'s parent exists.
    async fn download(&self, artifact: &BuildArtifact, dest: &Path) -> Result<(), ArtifactError>;
}

/// Fetches artifacts by id from `GET {base}/artifacts/{id}`.
#[derive(Clone, Debug)]
pub struct HttpArtifactSource {
    base: Url,
    client: reqwest::Client,
}

impl HttpArtifactSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ArtifactSourceError> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(ArtifactSourceError::NotABase(base));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("devq/{}", devq_utils::VERSION))
            .build()?;
        Ok(Self { base, client })
    }

    /// `{base}/artifacts/{id}`, with the id escaped as a single path segment.
    fn artifact_url(&self, id: &ArtifactId) -> Result<Url, ArtifactError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ArtifactError::InvalidId(id.clone()))?
            .pop_if_empty()
            .extend(["artifacts", id.0.as_str()]);
        Ok(url)
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn download(&self, artifact: &BuildArtifact, dest: &Path) -> Result<(), ArtifactError> {
        let id = &artifact.id;
        let unavailable = |reason: String| ArtifactError::Unavailable {
            artifact: id.clone(),
            reason,
        };

        let mut response = self
            .client
            .get(self.artifact_url(id)?)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(unavailable(format!("server responded {}", response.status())));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| ArtifactError::io(id, e))?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| unavailable(e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| ArtifactError::io(id, e))?;
        }
        file.flush().await.map_err(|e| ArtifactError::io(id, e))?;
        Ok(())
    }
}

/// Resolves a job's artifacts to local files, downloading on a cache miss.
///
/// Concurrent requests for the same artifact share one download.
#[derive(Clone)]
pub struct ArtifactFetcher {
    source: Arc<dyn ArtifactSource>,
    cache_dir: PathBuf,
    fetched: moka::future::Cache<ArtifactId, PathBuf>,
}

impl ArtifactFetcher {
    pub fn new(source: Arc<dyn ArtifactSource>, cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(source, cache_dir, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(
        source: Arc<dyn ArtifactSource>,
        cache_dir: impl Into<PathBuf>,
        capacity: u64,
    ) -> Self {
        Self {
            source,
            cache_dir: cache_dir.into(),
            fetched: moka::future::Cache::new(capacity),
        }
    }

    pub async fn ensure(
        &self,
        artifacts: &BuildArtifacts,
    ) -> Result<LocalArtifacts, ArtifactError> {
        let app = self.ensure_one(&artifacts.app).await?;
        let test_app = self.ensure_one(&artifacts.test_app).await?;
        Ok(LocalArtifacts { app, test_app })
    }

    async fn ensure_one(&self, artifact: &BuildArtifact) -> Result<PathBuf, ArtifactError> {
        check_path_component(&artifact.id, &artifact.id.0)?;
        check_path_component(&artifact.id, &artifact.file_name)?;

        let dest = self.cache_dir.join(&artifact.id.0).join(&artifact.file_name);
        let fetch = fetch_into(self.source.as_ref(), artifact, dest);

        self.fetched
            .try_get_with(artifact.id.clone(), fetch)
            .await
            .map_err(|error: Arc<ArtifactError>| ArtifactError::clone(&error))
    }
}

fn check_path_component(id: &ArtifactId, component: &str) -> Result<(), ArtifactError> {
    let unsafe_component = component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\']);
    if unsafe_component {
        return Err(ArtifactError::InvalidId(id.clone()));
    }
    Ok(())
}

async fn fetch_into(
    source: &dyn ArtifactSource,
    artifact: &BuildArtifact,
    dest: PathBuf,
) -> Result<PathBuf, ArtifactError> {
    let id = &artifact.id;

    if tokio::fs::metadata(&dest).await.is_ok() {
        tracing::debug!(artifact = %id, "artifact already on disk");
        return Ok(dest);
    }

    if let Some(dir) = dest.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ArtifactError::io(id, e))?;
    }

    // A half-written download must never sit at the final path.
    let partial = dest.with_extension("partial");
    tracing::info!(artifact = %id, dest = %dest.display(), "downloading artifact");
    if let Err(error) = source.download(artifact, &partial).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(error);
    }
    tokio::fs::rename(&partial, &dest)
        .await
        .map_err(|e| ArtifactError::io(id, e))?;

    Ok(dest)
}
