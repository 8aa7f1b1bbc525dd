//! Storage backends.
//!
//! Every provider is reached through the same capability traits: sources can list and
//! fetch, the destination can put and stat. Provider differences (endpoint style,
//! addressing) stay inside the constructors.

mod local;
mod s3;
mod simulated;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::{BackendSettings, Provider};
use crate::core::models::{Digest, ObjectKey};
use crate::error::{BackendInitError, ListError, TransferError};

pub use local::LocalBucket;
pub use s3::S3Bucket;
pub use simulated::{SimulatedBucket, SimulatedOp};

/// Lazy, single-pass listing of object keys.
pub type ObjectStream<'a> = BoxStream<'a, Result<ObjectKey, ListError>>;

/// Common identity of every backend.
pub trait StorageBackend: Send + Sync {
    /// Name used in logs and errors (the configured source name, or "destination").
    fn name(&self) -> &str;

    fn provider(&self) -> Provider;
}

/// Read-only role: enumerate and stage objects.
#[async_trait]
pub trait SourceBackend: StorageBackend {
    /// Every object key, excluding directory markers. Pagination is handled inside;
    /// calling again re-lists from the start.
    fn list_objects(&self) -> ObjectStream<'_>;

    /// Download `key` to `dest`, creating parent directories. Returns the size and
    /// content hash of what was written.
    async fn fetch(&self, key: &ObjectKey, dest: &Path) -> Result<Digest, TransferError>;
}

/// Read-write role: publish staged files.
#[async_trait]
pub trait DestinationBackend: StorageBackend {
    async fn put(&self, key: &ObjectKey, local_path: &Path) -> Result<(), TransferError>;

    /// Size of the remote object; `NotFound` if absent.
    async fn stat_remote(&self, key: &ObjectKey) -> Result<u64, TransferError>;

    /// Create the bucket if it does not exist yet.
    async fn ensure_bucket(&self) -> Result<(), TransferError>;

    async fn remove(&self, key: &ObjectKey) -> Result<(), TransferError>;
}

/// Construct the backend for a configured source.
pub fn create_source(
    name: &str,
    settings: &BackendSettings,
) -> Result<Arc<dyn SourceBackend>, BackendInitError> {
    match settings.provider {
        Provider::Local => Ok(Arc::new(LocalBucket::from_settings(name, settings)?)),
        Provider::Aliyun | Provider::Tencent | Provider::Minio => {
            Ok(Arc::new(S3Bucket::from_settings(name, settings)?))
        }
    }
}

/// Construct the destination backend.
pub fn create_destination(
    settings: &BackendSettings,
) -> Result<Arc<dyn DestinationBackend>, BackendInitError> {
    const NAME: &str = "destination";
    match settings.provider {
        Provider::Local => Ok(Arc::new(LocalBucket::from_settings(NAME, settings)?)),
        Provider::Aliyun | Provider::Tencent | Provider::Minio => {
            Ok(Arc::new(S3Bucket::from_settings(NAME, settings)?))
        }
    }
}
