use std::fs;
use std::io::Write;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, NamedTempFile};
use tracing::debug;

use crate::error::HarvestError;

/// Directory where downloads are staged before upload.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: Utf8PathBuf,
}

impl StagingArea {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// Uses the platform temp directory.
    pub fn system() -> Result<Self, HarvestError> {
        let root = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .map_err(|_| HarvestError::Filesystem("non-utf8 temp directory".to_string()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Creates a uniquely named empty file; it is removed when the artifact drops.
    pub fn acquire(&self, label: &str, extension: &str) -> Result<StagedArtifact, HarvestError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let suffix = format!(".{}", extension.trim_start_matches('.'));
        let file = Builder::new()
            .prefix(&format!("cds-harvest-{}-", sanitize(label)))
            .suffix(&suffix)
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        debug!(path = %file.path().display(), "staged artifact acquired");
        Ok(StagedArtifact { file })
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Local download owned by exactly one combination. Dropping it deletes the file.
#[derive(Debug)]
pub struct StagedArtifact {
    file: NamedTempFile,
}

impl StagedArtifact {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size(&self) -> Result<u64, HarvestError> {
        fs::metadata(self.file.path())
            .map(|meta| meta.len())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), HarvestError> {
        self.file
            .write_all(bytes)
            .and_then(|_| self.file.flush())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        debug!(path = %self.file.path().display(), "removing staged artifact");
    }
}
