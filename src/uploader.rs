use serde::Serialize;
use tracing::{info, warn};

use crate::error::HarvestError;
use crate::keys::StorageKey;
use crate::object_store::ObjectStoreClient;
use crate::staging::StagedArtifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum UploadOutcome {
    Uploaded { bytes: u64 },
    /// At or below the size floor: an empty result, not a failure.
    Skipped { bytes: u64 },
}

pub struct Uploader<S: ObjectStoreClient> {
    store: S,
    bucket: String,
    min_bytes: u64,
}

impl<S: ObjectStoreClient> Uploader<S> {
    pub fn new(store: S, bucket: impl Into<String>, min_bytes: u64) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            min_bytes,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Transport failures are returned as-is; retrying is the caller's decision.
    pub fn upload(
        &self,
        artifact: &StagedArtifact,
        key: &StorageKey,
    ) -> Result<UploadOutcome, HarvestError> {
        let bytes = artifact.size()?;
        if bytes <= self.min_bytes {
            warn!(
                key = %key,
                bytes,
                min_bytes = self.min_bytes,
                "staged artifact too small; skipping upload"
            );
            return Ok(UploadOutcome::Skipped { bytes });
        }

        self.store
            .upload(artifact.path(), &self.bucket, key.as_str())?;
        info!(bucket = %self.bucket, key = %key, bytes, "uploaded");
        Ok(UploadOutcome::Uploaded { bytes })
    }
}
