use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tracing::info;

use super::{DestinationBackend, ObjectStream, SourceBackend, StorageBackend};
use crate::config::{BackendSettings, Provider};
use crate::core::hasher::CHUNK_SIZE;
use crate::core::models::{Digest, ObjectKey};
use crate::core::staging::{StagedWriter, StagingArea};
use crate::error::{BackendInitError, ListError, TransferError, TransferErrorKind};

/// A local directory used as a bucket: keys are `/`-separated paths below `root`.
pub struct LocalBucket {
    name: String,
    layout: StagingArea,
}

impl LocalBucket {
    pub fn new(name: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            layout: StagingArea::at(root),
        }
    }

    pub fn from_settings(name: &str, settings: &BackendSettings) -> Result<Self, BackendInitError> {
        let root = settings
            .root
            .clone()
            .ok_or_else(|| BackendInitError::new(name, "local provider requires `root`"))?;
        info!(backend = name, root = %root.display(), "Local backend ready");
        Ok(Self::new(name, root))
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    fn object_path(&self, key: &ObjectKey) -> Result<PathBuf, TransferError> {
        self.layout.path_for(key).map_err(|e| {
            TransferError::new(TransferErrorKind::LocalIo, key, e.to_string())
        })
    }
}

impl StorageBackend for LocalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> Provider {
        Provider::Local
    }
}

#[async_trait]
impl SourceBackend for LocalBucket {
    fn list_objects(&self) -> ObjectStream<'_> {
        let name = self.name.clone();
        let listing = self.layout.scan();
        futures::stream::once(async move {
            match listing.await {
                Ok(files) => futures::stream::iter(files.into_iter().map(|f| Ok(f.key))).boxed(),
                Err(e) => futures::stream::iter([Err(ListError::new(name, e.to_string()))]).boxed(),
            }
        })
        .flatten()
        .boxed()
    }

    async fn fetch(&self, key: &ObjectKey, dest: &Path) -> Result<Digest, TransferError> {
        let source = self.object_path(key)?;
        let mut file = tokio::fs::File::open(&source)
            .await
            .map_err(|e| TransferError::local(key, &e))?;

        let mut writer = StagedWriter::create(dest)
            .await
            .map_err(|e| TransferError::local(key, &e))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match file.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    writer.abort().await;
                    return Err(TransferError::local(key, &e));
                }
            };
            if let Err(e) = writer.write(&buffer[..n]).await {
                writer.abort().await;
                return Err(TransferError::local(key, &e));
            }
        }

        writer.finish().await.map_err(|e| TransferError::local(key, &e))
    }
}

#[async_trait]
impl DestinationBackend for LocalBucket {
    async fn put(&self, key: &ObjectKey, local_path: &Path) -> Result<(), TransferError> {
        let target = self.object_path(key)?;
        let mut file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| TransferError::local(key, &e))?;

        let mut writer = StagedWriter::create(&target)
            .await
            .map_err(|e| TransferError::local(key, &e))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match file.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    writer.abort().await;
                    return Err(TransferError::local(key, &e));
                }
            };
            if let Err(e) = writer.write(&buffer[..n]).await {
                writer.abort().await;
                return Err(TransferError::local(key, &e));
            }
        }

        writer
            .finish()
            .await
            .map(|_| ())
            .map_err(|e| TransferError::local(key, &e))
    }

    async fn stat_remote(&self, key: &ObjectKey) -> Result<u64, TransferError> {
        let path = self.object_path(key)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| TransferError::local(key, &e))?;
        Ok(metadata.len())
    }

    async fn ensure_bucket(&self) -> Result<(), TransferError> {
        tokio::fs::create_dir_all(self.root())
            .await
            .map_err(|e| TransferError::local(&ObjectKey::new(self.name.clone()), &e))
    }

    async fn remove(&self, key: &ObjectKey) -> Result<(), TransferError> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::local(key, &e)),
        }
    }
}
