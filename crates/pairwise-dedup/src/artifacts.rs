//! Artifact stores: where source bytes for catalog files come from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use pairwise_core::{Artifact, ArtifactStore, CatalogFile, Error, Result};

/// Environment variable naming the artifact root directory.
pub const ENV_ARTIFACT_ROOT: &str = "ARTIFACT_ROOT";

/// Default artifact root for local development.
pub const DEFAULT_ARTIFACT_ROOT: &str = "/var/lib/pairwise/artifacts";

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Reads artifacts from `<root>/<file_id>/<filename>`.
///
/// When the catalog entry carries a SHA-256 checksum the content is verified
/// against it; a mismatch is fatal.
#[derive(Debug, Clone)]
pub struct FilesystemArtifactStore {
    root: PathBuf,
}

impl FilesystemArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var(ENV_ARTIFACT_ROOT).unwrap_or_else(|_| DEFAULT_ARTIFACT_ROOT.to_string()),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of a file's artifact, refusing components that escape the root.
    pub fn path_for(&self, file: &CatalogFile) -> Result<PathBuf> {
        for component in [file.file_id.as_str(), file.filename.as_str()] {
            if !is_plain_component(component) {
                return Err(Error::Fatal(format!(
                    "invalid artifact path component: {component:?}"
                )));
            }
        }
        Ok(self.root.join(&file.file_id).join(&file.filename))
    }
}

fn is_plain_component(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\', '\0'])
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn fetch(&self, file: &CatalogFile) -> Result<Artifact> {
        let path = self.path_for(file)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Fatal(format!(
                    "source artifact missing for file {}",
                    file.file_id
                )));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        if let Some(expected) = file.checksum.as_deref().filter(|c| looks_like_sha256(c)) {
            let actual = sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(
                    subsystem = "dedup",
                    component = "artifacts",
                    file_id = %file.file_id,
                    expected = %expected,
                    actual = %actual,
                    "Artifact checksum mismatch"
                );
                return Err(Error::Fatal(format!(
                    "checksum mismatch for file {}",
                    file.file_id
                )));
            }
        }

        debug!(
            subsystem = "dedup",
            component = "artifacts",
            file_id = %file.file_id,
            bytes = bytes.len(),
            "Artifact loaded"
        );
        Ok(Artifact {
            file_id: file.file_id.clone(),
            filename: file.filename.clone(),
            bytes,
            document_type: file.document_type.clone(),
        })
    }
}

fn looks_like_sha256(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Artifacts held in memory, keyed by file id.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, file_id: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.blobs.write().await.insert(file_id.into(), bytes.into());
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn fetch(&self, file: &CatalogFile) -> Result<Artifact> {
        let blobs = self.blobs.read().await;
        let bytes = blobs
            .get(&file.file_id)
            .cloned()
            .ok_or_else(|| Error::Fatal(format!("source artifact missing for file {}", file.file_id)))?;
        Ok(Artifact {
            file_id: file.file_id.clone(),
            filename: file.filename.clone(),
            bytes,
            document_type: file.document_type.clone(),
        })
    }
}
