use std::path::Path;

use async_stream::try_stream;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use futures::Stream;
use tracing::{debug, info};

use super::{DestinationBackend, ObjectStream, SourceBackend, StorageBackend};
use crate::config::{BackendSettings, Provider};
use crate::core::models::{Digest, ObjectKey};
use crate::core::staging::StagedWriter;
use crate::error::{BackendInitError, ListError, TransferError, TransferErrorKind};

/// A bucket reached through an S3-compatible API (Aliyun OSS, Tencent COS, MinIO).
pub struct S3Bucket {
    name: String,
    provider: Provider,
    client: Client,
    bucket: String,
}

impl S3Bucket {
    pub fn from_settings(name: &str, settings: &BackendSettings) -> Result<Self, BackendInitError> {
        let endpoint = settings
            .resolved_endpoint()
            .ok_or_else(|| BackendInitError::new(name, "no endpoint and no region to derive one from"))?;
        let region = settings
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        if settings.bucket.is_empty() {
            return Err(BackendInitError::new(name, "bucket is not set"));
        }

        let credentials = Credentials::new(
            settings.access_key.clone(),
            settings.secret_key.clone(),
            None,
            None,
            "objmig-config",
        );

        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            // OSS and COS only serve virtual-hosted requests; MinIO wants path-style
            .force_path_style(settings.provider == Provider::Minio)
            .build();

        info!(
            backend = name,
            provider = %settings.provider,
            endpoint = %endpoint,
            bucket = %settings.bucket,
            "S3 backend ready"
        );

        Ok(Self {
            name: name.to_string(),
            provider: settings.provider,
            client: Client::from_conf(config),
            bucket: settings.bucket.clone(),
        })
    }

    /// Walk `ListObjectsV2` pages until the provider reports no more.
    fn list_pages(&self) -> impl Stream<Item = Result<ObjectKey, ListError>> + Send + '_ {
        try_stream! {
            let mut continuation_token: Option<String> = None;
            let mut page_number = 0u32;

            loop {
                let page = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .set_continuation_token(continuation_token.take())
                    .send()
                    .await
                    .map_err(|e| ListError::new(&self.name, DisplayErrorContext(&e).to_string()))?;

                page_number += 1;
                debug!(backend = %self.name, page = page_number, objects = page.contents().len(), "Listed page");

                for object in page.contents() {
                    if let Some(key) = object.key() {
                        if !ObjectKey::is_directory_marker(key) {
                            yield ObjectKey::from(key);
                        }
                    }
                }

                if !page.is_truncated().unwrap_or(false) {
                    break;
                }
                continuation_token = page.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            }
        }
    }
}

/// Map an SDK failure onto the transfer taxonomy by HTTP status.
fn transfer_error<E>(key: &ObjectKey, err: SdkError<E, HttpResponse>) -> TransferError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let kind = match err.raw_response().map(|r| r.status().as_u16()) {
        Some(404) => TransferErrorKind::NotFound,
        Some(401 | 403) => TransferErrorKind::Permission,
        _ => TransferErrorKind::Network,
    };
    TransferError::new(kind, key, DisplayErrorContext(&err).to_string())
}

/// Size from a `HeadObject` response; a missing length is an error, not zero.
fn reported_size(key: &ObjectKey, content_length: Option<i64>) -> Result<u64, TransferError> {
    let length = content_length.ok_or_else(|| {
        TransferError::new(
            TransferErrorKind::Network,
            key,
            "destination did not report a content length, size unknown",
        )
    })?;
    u64::try_from(length).map_err(|_| {
        TransferError::new(
            TransferErrorKind::Network,
            key,
            format!("destination reported invalid content length {length}"),
        )
    })
}

impl StorageBackend for S3Bucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> Provider {
        self.provider
    }
}

#[async_trait]
impl SourceBackend for S3Bucket {
    fn list_objects(&self) -> ObjectStream<'_> {
        Box::pin(self.list_pages())
    }

    async fn fetch(&self, key: &ObjectKey, dest: &Path) -> Result<Digest, TransferError> {
        let mut output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| transfer_error(key, e))?;

        let mut writer = StagedWriter::create(dest)
            .await
            .map_err(|e| TransferError::local(key, &e))?;

        loop {
            let chunk = match output.body.try_next().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    writer.abort().await;
                    return Err(TransferError::new(
                        TransferErrorKind::Network,
                        key,
                        e.to_string(),
                    ));
                }
            };
            if let Err(e) = writer.write(&chunk).await {
                writer.abort().await;
                return Err(TransferError::local(key, &e));
            }
        }

        writer.finish().await.map_err(|e| TransferError::local(key, &e))
    }
}

#[async_trait]
impl DestinationBackend for S3Bucket {
    async fn put(&self, key: &ObjectKey, local_path: &Path) -> Result<(), TransferError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| TransferError::new(TransferErrorKind::LocalIo, key, e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(body)
            .send()
            .await
            .map_err(|e| transfer_error(key, e))?;
        Ok(())
    }

    async fn stat_remote(&self, key: &ObjectKey) -> Result<u64, TransferError> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| transfer_error(key, e))?;

        reported_size(key, head.content_length())
    }

    async fn ensure_bucket(&self) -> Result<(), TransferError> {
        let bucket_key = ObjectKey::new(self.bucket.clone());
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(bucket = %self.bucket, "Bucket exists");
                Ok(())
            }
            Err(e) if e.raw_response().map(|r| r.status().as_u16()) == Some(404) => {
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(|e| transfer_error(&bucket_key, e))?;
                info!(bucket = %self.bucket, "Created bucket");
                Ok(())
            }
            Err(e) => Err(transfer_error(&bucket_key, e)),
        }
    }

    async fn remove(&self, key: &ObjectKey) -> Result<(), TransferError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| transfer_error(key, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reported_size() {
        let key = ObjectKey::from("a.txt");
        assert_eq!(reported_size(&key, Some(10)).unwrap(), 10);

        let err = reported_size(&key, None).unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::Network);
        assert!(err.message.contains("size unknown"));

        assert!(reported_size(&key, Some(-1)).is_err());
    }
}
