//! Local staging area.
//!
//! Objects are materialised under `<staging-root>/<source>/<key>`, keeping the key's
//! `/`-separated structure. Writers stream into a partial file
//! (`.objmig-<uuid>.part`) next to the target and rename it into place only once the
//! content is complete and synced. Scans skip exactly that pattern and nothing else.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::hasher::ContentHasher;
use super::models::{Digest, ObjectKey};

const PARTIAL_PREFIX: &str = ".objmig-";
const PARTIAL_SUFFIX: &str = ".part";

/// Whether `name` is one of our in-flight partial files.
pub fn is_partial_file(name: &str) -> bool {
    name.strip_prefix(PARTIAL_PREFIX)
        .and_then(|rest| rest.strip_suffix(PARTIAL_SUFFIX))
        .is_some_and(|id| uuid::Uuid::parse_str(id).is_ok())
}

#[derive(Debug, thiserror::Error)]
#[error("object key '{key}' cannot be staged: {reason}")]
pub struct UnsafeKeyError {
    pub key: ObjectKey,
    pub reason: &'static str,
}

/// A file found in the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub key: ObjectKey,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Per-source staging directory.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(staging_root: &Path, source_name: &str) -> Self {
        Self {
            root: staging_root.join(source_name),
        }
    }

    /// Layout rooted directly at `root`, without a per-source component.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic staging path for a key.
    ///
    /// Rejects keys that would escape the staging root or collapse onto another key.
    pub fn path_for(&self, key: &ObjectKey) -> Result<PathBuf, UnsafeKeyError> {
        let raw = key.as_str();
        let unsafe_key = |reason| UnsafeKeyError {
            key: key.clone(),
            reason,
        };

        if raw.is_empty() {
            return Err(unsafe_key("key is empty"));
        }
        if raw.contains('\0') {
            return Err(unsafe_key("key contains a NUL byte"));
        }

        let mut path = self.root.clone();
        for segment in raw.split('/') {
            match segment {
                "" => return Err(unsafe_key("key has an empty path segment")),
                "." | ".." => return Err(unsafe_key("key has a relative path segment")),
                _ => {}
            }
            // Reject anything the platform would not treat as a plain file name
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => path.push(segment),
                _ => return Err(unsafe_key("key segment is not a plain file name")),
            }
        }
        Ok(path)
    }

    /// Create the parent directories of a key's staging path.
    ///
    /// `create_dir_all` tolerates concurrent callers creating overlapping trees.
    pub async fn prepare(&self, key: &ObjectKey) -> io::Result<PathBuf> {
        let path = self
            .path_for(key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }

    /// List every file below the root except in-flight partial files.
    pub async fn scan(&self) -> io::Result<Vec<StagedFile>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            if root.exists() {
                scan_recursive(&root, &root, &mut files)?;
            }
            files.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(files)
        })
        .await
        .map_err(io::Error::other)?
    }
}

fn scan_recursive(base: &Path, current: &Path, files: &mut Vec<StagedFile>) -> io::Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if is_partial_file(&name) {
            continue;
        }

        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            scan_recursive(base, &path, files)?;
        } else if metadata.is_file() {
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(StagedFile {
                key: ObjectKey::new(key),
                path,
                size_bytes: metadata.len(),
            });
        }
    }
    Ok(())
}

/// Writes one staged object, hashing as it goes.
///
/// Content lands in a partial file; [`StagedWriter::finish`] syncs it and renames it
/// over the final path. A writer dropped before `finish` removes its partial file and
/// leaves the final path untouched.
pub struct StagedWriter {
    final_path: PathBuf,
    partial_path: PathBuf,
    file: Option<tokio::fs::File>,
    hasher: ContentHasher,
}

impl StagedWriter {
    pub async fn create(final_path: &Path) -> io::Result<Self> {
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial_path = partial_path_for(final_path);
        let file = tokio::fs::File::create(&partial_path).await?;
        Ok(Self {
            final_path: final_path.to_path_buf(),
            partial_path,
            file: Some(file),
            hasher: ContentHasher::new(),
        })
    }

    fn file(&mut self) -> io::Result<&mut tokio::fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("staged writer already closed"))
    }

    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.hasher.update(chunk);
        self.file()?.write_all(chunk).await
    }

    pub async fn finish(mut self) -> io::Result<Digest> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("staged writer already closed"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&self.partial_path, &self.final_path).await?;
        // Renamed away; nothing left for drop to clean up
        self.partial_path = PathBuf::new();

        let digest = std::mem::take(&mut self.hasher).finalize();
        debug!(
            path = %self.final_path.display(),
            size_bytes = digest.size_bytes,
            "Staged file written"
        );
        Ok(digest)
    }

    pub async fn abort(mut self) {
        self.file = None;
        let partial_path = std::mem::take(&mut self.partial_path);
        if let Err(e) = tokio::fs::remove_file(&partial_path).await {
            debug!(path = %partial_path.display(), error = %e, "Failed to remove partial file");
        }
    }
}

impl Drop for StagedWriter {
    fn drop(&mut self) {
        if self.partial_path.as_os_str().is_empty() {
            return;
        }
        self.file = None;
        match std::fs::remove_file(&self.partial_path) {
            Ok(()) => debug!(path = %self.partial_path.display(), "Removed unfinished partial file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.partial_path.display(), error = %e, "Failed to remove partial file"),
        }
    }
}

/// Fixed-length sibling name, so any final name the filesystem accepts can be staged.
fn partial_path_for(final_path: &Path) -> PathBuf {
    final_path.with_file_name(format!(
        "{PARTIAL_PREFIX}{}{PARTIAL_SUFFIX}",
        uuid::Uuid::now_v7()
    ))
}
