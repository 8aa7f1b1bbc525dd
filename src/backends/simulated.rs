use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;

use super::{DestinationBackend, ObjectStream, SourceBackend, StorageBackend};
use crate::config::Provider;
use crate::core::hasher::CHUNK_SIZE;
use crate::core::models::{Digest, ObjectKey};
use crate::core::staging::StagedWriter;
use crate::error::{ListError, TransferError, TransferErrorKind};

/// Operation a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedOp {
    Fetch,
    Put,
    Stat,
    Remove,
}

#[derive(Default)]
struct SimulatedState {
    objects: BTreeMap<String, Vec<u8>>,
    faults: HashMap<(SimulatedOp, String), TransferErrorKind>,
    /// Faults applying to every key
    op_faults: HashMap<SimulatedOp, TransferErrorKind>,
    size_overrides: HashMap<String, u64>,
    /// Listing yields this many keys, then fails
    list_failure_after: Option<usize>,
}

/// In-memory bucket for tests. Plays either role and counts the transfers it serves.
pub struct SimulatedBucket {
    name: String,
    provider: Provider,
    state: Mutex<SimulatedState>,
    fetches: AtomicUsize,
    puts: AtomicUsize,
}

impl SimulatedBucket {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            provider: Provider::Minio,
            state: Mutex::new(SimulatedState::default()),
            fetches: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, key: &str, content: impl Into<Vec<u8>>) {
        self.state().objects.insert(key.to_string(), content.into());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// Make every `op` on `key` fail with `kind` until cleared.
    pub fn fail(&self, op: SimulatedOp, key: &str, kind: TransferErrorKind) {
        self.state().faults.insert((op, key.to_string()), kind);
    }

    pub fn clear_fault(&self, op: SimulatedOp, key: &str) {
        self.state().faults.remove(&(op, key.to_string()));
    }

    /// Make every `op` fail with `kind`, whatever the key.
    pub fn fail_all(&self, op: SimulatedOp, kind: TransferErrorKind) {
        self.state().op_faults.insert(op, kind);
    }

    /// Report `size` from `stat_remote` regardless of the stored content.
    pub fn override_remote_size(&self, key: &str, size: u64) {
        self.state().size_overrides.insert(key.to_string(), size);
    }

    pub fn fail_listing_after(&self, keys: usize) {
        self.state().list_failure_after = Some(keys);
    }

    pub fn fail_listing(&self) {
        self.fail_listing_after(0);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn check_fault(&self, op: SimulatedOp, key: &ObjectKey) -> Result<(), TransferError> {
        let state = self.state();
        let fault = state
            .faults
            .get(&(op, key.as_str().to_string()))
            .or_else(|| state.op_faults.get(&op));
        match fault {
            Some(kind) => Err(TransferError::new(
                *kind,
                key,
                format!("injected {op:?} failure"),
            )),
            None => Ok(()),
        }
    }
}

impl StorageBackend for SimulatedBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> Provider {
        self.provider
    }
}

#[async_trait]
impl SourceBackend for SimulatedBucket {
    fn list_objects(&self) -> ObjectStream<'_> {
        let (keys, failure_after) = {
            let state = self.state();
            let keys: Vec<String> = state
                .objects
                .keys()
                .filter(|k| !ObjectKey::is_directory_marker(k))
                .cloned()
                .collect();
            (keys, state.list_failure_after)
        };

        match failure_after {
            None => futures::stream::iter(keys.into_iter().map(|k| Ok(ObjectKey::new(k)))).boxed(),
            Some(n) => {
                let error = ListError::new(&self.name, "injected listing failure");
                futures::stream::iter(
                    keys.into_iter()
                        .take(n)
                        .map(|k| Ok(ObjectKey::new(k)))
                        .chain(std::iter::once(Err(error))),
                )
                .boxed()
            }
        }
    }

    async fn fetch(&self, key: &ObjectKey, dest: &Path) -> Result<Digest, TransferError> {
        self.check_fault(SimulatedOp::Fetch, key)?;
        let content = self.object(key.as_str()).ok_or_else(|| {
            TransferError::new(TransferErrorKind::NotFound, key, "no such object")
        })?;
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let mut writer = StagedWriter::create(dest)
            .await
            .map_err(|e| TransferError::local(key, &e))?;
        for chunk in content.chunks(CHUNK_SIZE) {
            if let Err(e) = writer.write(chunk).await {
                writer.abort().await;
                return Err(TransferError::local(key, &e));
            }
        }
        writer.finish().await.map_err(|e| TransferError::local(key, &e))
    }
}

#[async_trait]
impl DestinationBackend for SimulatedBucket {
    async fn put(&self, key: &ObjectKey, local_path: &Path) -> Result<(), TransferError> {
        self.check_fault(SimulatedOp::Put, key)?;
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| TransferError::local(key, &e))?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.state().objects.insert(key.as_str().to_string(), content);
        Ok(())
    }

    async fn stat_remote(&self, key: &ObjectKey) -> Result<u64, TransferError> {
        self.check_fault(SimulatedOp::Stat, key)?;
        let state = self.state();
        if let Some(size) = state.size_overrides.get(key.as_str()) {
            return Ok(*size);
        }
        state
            .objects
            .get(key.as_str())
            .map(|content| content.len() as u64)
            .ok_or_else(|| TransferError::new(TransferErrorKind::NotFound, key, "no such object"))
    }

    async fn ensure_bucket(&self) -> Result<(), TransferError> {
        Ok(())
    }

    async fn remove(&self, key: &ObjectKey) -> Result<(), TransferError> {
        self.check_fault(SimulatedOp::Remove, key)?;
        self.state().objects.remove(key.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_listing_skips_directory_markers() {
        let bucket = SimulatedBucket::new("sim");
        bucket.insert("b/", Vec::new());
        bucket.insert("b/c.txt", "x");
        bucket.insert("a.txt", "y");

        let keys: Vec<ObjectKey> = bucket.list_objects().try_collect().await.unwrap();
        assert_eq!(keys, vec![ObjectKey::from("a.txt"), ObjectKey::from("b/c.txt")]);
    }

    #[tokio::test]
    async fn test_listing_failure_after_partial_page() {
        let bucket = SimulatedBucket::new("sim");
        bucket.insert("a", "1");
        bucket.insert("b", "2");
        bucket.fail_listing_after(1);

        let items: Vec<_> = bucket.list_objects().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_injected_fault_until_cleared() {
        let temp = tempfile::tempdir().unwrap();
        let bucket = SimulatedBucket::new("sim");
        bucket.insert("x.bin", "payload");
        bucket.fail(SimulatedOp::Fetch, "x.bin", TransferErrorKind::Network);

        let key = ObjectKey::from("x.bin");
        let dest = temp.path().join("x.bin");
        let err = bucket.fetch(&key, &dest).await.unwrap_err();
        assert_eq!(err.kind, TransferErrorKind::Network);
        assert_eq!(bucket.fetches(), 0);

        bucket.clear_fault(SimulatedOp::Fetch, "x.bin");
        let digest = bucket.fetch(&key, &dest).await.unwrap();
        assert_eq!(digest.size_bytes, 7);
        assert_eq!(bucket.fetches(), 1);
    }
}
