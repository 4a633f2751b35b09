use std::fs;
use std::path::Path;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use camino::Utf8PathBuf;
use tokio::runtime::Runtime;

use crate::error::HarvestError;

/// Durable key-value store with path-like keys.
pub trait ObjectStoreClient: Send + Sync {
    /// Writes `local_path` to `bucket`/`key`, replacing any existing object.
    fn upload(&self, local_path: &Path, bucket: &str, key: &str) -> Result<(), HarvestError>;
}

#[derive(Debug, Clone)]
pub struct S3Options {
    pub region: String,
    pub endpoint: Option<String>,
}

/// S3 client. Each call blocks the calling thread on the store's own runtime.
pub struct S3ObjectStore {
    client: Client,
    runtime: Runtime,
}

impl S3ObjectStore {
    /// Credentials come from the standard AWS provider chain.
    pub fn new(options: &S3Options) -> Result<Self, HarvestError> {
        let runtime = Runtime::new().map_err(|err| HarvestError::ObjectStore(err.to_string()))?;
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(options.region.clone()));
        if let Some(endpoint) = &options.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = runtime.block_on(loader.load());
        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if options.endpoint.is_some() {
            builder = builder.force_path_style(true);
        }
        Ok(Self {
            client: Client::from_conf(builder.build()),
            runtime,
        })
    }
}

impl ObjectStoreClient for S3ObjectStore {
    fn upload(&self, local_path: &Path, bucket: &str, key: &str) -> Result<(), HarvestError> {
        self.runtime.block_on(async {
            let body = ByteStream::from_path(local_path).await.map_err(|err| {
                HarvestError::ObjectStore(format!("read {}: {err}", local_path.display()))
            })?;
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|err| HarvestError::ObjectStore(err.to_string()))?;
            Ok::<(), HarvestError>(())
        })
    }
}

/// Mirrors the bucket layout under a local directory (`<root>/<bucket>/<key>`).
#[derive(Debug, Clone)]
pub struct FilesystemObjectStore {
    root: Utf8PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Utf8PathBuf {
        self.root.join(bucket).join(key)
    }
}

impl ObjectStoreClient for FilesystemObjectStore {
    fn upload(&self, local_path: &Path, bucket: &str, key: &str) -> Result<(), HarvestError> {
        let dest = self.object_path(bucket, key);
        let parent = dest
            .parent()
            .ok_or_else(|| HarvestError::ObjectStore("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| HarvestError::ObjectStore(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix("cds-harvest-object")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| HarvestError::ObjectStore(err.to_string()))?;
        fs::copy(local_path, temp.path())
            .map_err(|err| HarvestError::ObjectStore(err.to_string()))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| HarvestError::ObjectStore(err.to_string()))?;
        Ok(())
    }
}
