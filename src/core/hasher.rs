//! Content hashing for staged objects.
//!
//! Digests are BLAKE3, hex encoded. Input is consumed in fixed-size chunks so memory
//! use does not depend on object size. MD5 is only computed to check digests imported
//! from legacy ledgers.

use std::io::{self, Read};
use std::path::Path;

use md5::{Digest as _, Md5};

use super::models::{ContentHash, Digest};

/// Read size for hashing
pub const CHUNK_SIZE: usize = 4096;

/// Incremental hasher, also used by backends that hash while they stream.
pub struct ContentHasher {
    inner: blake3::Hasher,
    size_bytes: u64,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
            size_bytes: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
        self.size_bytes += bytes.len() as u64;
    }

    pub fn finalize(self) -> Digest {
        Digest {
            size_bytes: self.size_bytes,
            content_hash: ContentHash::new(self.inner.finalize().to_hex().to_string()),
        }
    }
}

/// Hash everything a reader yields.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<Digest> {
    let mut hasher = ContentHasher::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finalize())
}

pub fn hash_bytes(bytes: &[u8]) -> Digest {
    let mut hasher = ContentHasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Hash a file on the blocking pool.
pub async fn hash_file(path: &Path) -> io::Result<Digest> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        hash_reader(file)
    })
    .await
    .map_err(io::Error::other)?
}

/// Hex MD5 of a file, on the blocking pool.
pub async fn md5_file(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Md5::new();
        let mut buffer = [0u8; CHUNK_SIZE];
        loop {
            match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => hasher.update(&buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hash_is_stable_blake3() {
        let digest = hash_bytes(b"hello world");
        assert_eq!(digest.size_bytes, 11);
        assert_eq!(
            digest.content_hash.as_str(),
            blake3::hash(b"hello world").to_hex().as_str()
        );
    }

    #[test]
    fn test_chunked_reader_matches_one_shot() {
        // Spans several chunks with a ragged tail
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let streamed = hash_reader(&data[..]).unwrap();
        assert_eq!(streamed, hash_bytes(&data));
        assert_eq!(streamed.size_bytes, data.len() as u64);
    }

    #[test]
    fn test_incremental_updates_are_split_independent() {
        let mut a = ContentHasher::new();
        a.update(b"abc");
        a.update(b"def");
        let mut b = ContentHasher::new();
        b.update(b"abcdef");
        assert_eq!(a.finalize(), b.finalize());
    }

    #[tokio::test]
    async fn test_hash_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("object.bin");
        std::fs::write(&path, vec![0xAB; 10 * 1024]).unwrap();

        let digest = hash_file(&path).await.unwrap();
        assert_eq!(digest, hash_bytes(&vec![0xAB; 10 * 1024]));
    }

    #[tokio::test]
    async fn test_md5_file_matches_known_digest() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(
            md5_file(&path).await.unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }

    #[tokio::test]
    async fn test_hash_file_missing() {
        let temp = tempdir().unwrap();
        let err = hash_file(&temp.path().join("nope")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
