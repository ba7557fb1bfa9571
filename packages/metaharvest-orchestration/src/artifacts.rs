//! Transformation artifact ingestion.
//!
//! Administrative tooling hands this module a `(name, kind, payload_url)`
//! triple; it fetches the payload, upserts it by name, and writes XSLT
//! payloads to the `transformations/` directory under the storage root so
//! the remote session can pick them up by path. Job builders reference the
//! resulting artifact by id.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::store::MetadataStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Xslt,
    Python,
    OpenRefine,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Xslt => "xslt",
            ArtifactKind::Python => "python",
            ArtifactKind::OpenRefine => "openrefine",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "xslt" => Ok(ArtifactKind::Xslt),
            "python" => Ok(ArtifactKind::Python),
            "openrefine" => Ok(ArtifactKind::OpenRefine),
            _ => Err(PipelineError::parse(format!(
                "invalid artifact kind: {s}"
            ))),
        }
    }
}

/// A named, typed, versionable transformation payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformationArtifact {
    pub id: i64,
    pub name: String,
    pub kind: ArtifactKind,
    pub payload: String,
    /// On-disk location of the payload, once written for remote pickup.
    pub filepath: Option<String>,
}

pub struct ArtifactRegistry {
    store: Arc<MetadataStore>,
    http: reqwest::Client,
    config: Arc<Config>,
}

impl ArtifactRegistry {
    pub fn new(store: Arc<MetadataStore>, config: Arc<Config>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            store,
            http,
            config,
        })
    }

    /// Fetch a payload by URL and upsert it under the given name.
    pub async fn ingest(
        &self,
        name: &str,
        kind: ArtifactKind,
        payload_url: &str,
    ) -> Result<TransformationArtifact> {
        debug!(name, payload_url, "fetching transformation payload");
        let payload = self
            .http
            .get(payload_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        self.ingest_payload(name, kind, &payload).await
    }

    /// Upsert an already-fetched payload. Re-ingesting an existing name
    /// replaces its payload and rewrites the on-disk copy.
    pub async fn ingest_payload(
        &self,
        name: &str,
        kind: ArtifactKind,
        payload: &str,
    ) -> Result<TransformationArtifact> {
        let previous = self.store.transformation_by_name(name).await?;
        let mut artifact = self.store.upsert_transformation(name, kind, payload).await?;

        // stale on-disk copy from an earlier ingest
        if let Some(old_path) = previous.and_then(|p| p.filepath) {
            if let Err(e) = std::fs::remove_file(&old_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = old_path, %e, "could not remove previous payload file");
                }
            }
        }

        if artifact.kind == ArtifactKind::Xslt {
            let filepath = self.write_payload(&artifact)?;
            self.store
                .set_transformation_filepath(artifact.id, &filepath)
                .await?;
            artifact.filepath = Some(filepath);
        }

        info!(name, kind = artifact.kind.as_str(), id = artifact.id, "artifact ingested");
        Ok(artifact)
    }

    fn write_payload(&self, artifact: &TransformationArtifact) -> Result<String> {
        let dir = self.config.transformations_dir().ok_or_else(|| {
            PipelineError::Config(
                "storage root is not local, cannot write transformation payloads".to_string(),
            )
        })?;
        std::fs::create_dir_all(&dir)?;

        let filename = format!("{}.xsl", Uuid::new_v4().simple());
        let path = dir.join(filename);
        std::fs::write(&path, &artifact.payload)?;
        Ok(path.to_string_lossy().into_owned())
    }
}
