use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use xxhash_rust::xxh64::Xxh64;

use crate::{check_cancelled, file_xxh64_hash_str, hashes_match, SophonError};

/// Leading `_`-separated token of a chunk name: the XXH64 hex digest
/// of the compressed chunk bytes
#[inline]
pub fn chunk_name_hash(chunk_name: &str) -> &str {
    chunk_name.split('_').next().unwrap_or(chunk_name)
}

/// Flat directory of downloaded chunks, each stored as a regular file
/// named exactly after its chunk name.
///
/// Concurrent puts on distinct chunk names are safe; the orchestrator never
/// schedules the same chunk twice at once.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    directory: PathBuf
}

impl ChunkStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into()
        }
    }

    #[inline]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[inline]
    pub fn chunk_path(&self, chunk_name: &str) -> PathBuf {
        self.directory.join(chunk_name)
    }

    #[inline]
    pub fn exists(&self, chunk_name: &str) -> bool {
        self.chunk_path(chunk_name).is_file()
    }

    /// Check that the chunk is stored and its bytes hash to the identity
    /// embedded in the chunk name. An invalid blob left by an interrupted or
    /// corrupted download reports `false` so consumers re-fetch it.
    pub fn contains_valid(
        &self,
        chunk_name: &str,
        cancelled: &AtomicBool
    ) -> Result<bool, SophonError> {
        let path = self.chunk_path(chunk_name);

        if !path.is_file() {
            return Ok(false);
        }

        let hash = file_xxh64_hash_str(&path, cancelled)?;

        Ok(hashes_match(&hash, chunk_name_hash(chunk_name)))
    }

    /// Stream the byte source into the store, folding XXH64 on the way, then
    /// compare the digest against the chunk name. A mismatched blob fails
    /// with [`SophonError::ChunkHashMismatch`] but stays on disk, where
    /// later consumers treat it as invalid.
    pub fn put(
        &self,
        chunk_name: &str,
        mut source: impl Read,
        cancelled: &AtomicBool
    ) -> Result<(), SophonError> {
        std::fs::create_dir_all(&self.directory)?;

        let path = self.chunk_path(chunk_name);

        let mut file = File::create(&path)?;
        let mut hasher = Xxh64::new(0);
        let mut buf = vec![0; crate::HASHING_BUFFER_SIZE];

        loop {
            check_cancelled(cancelled)?;

            let read = source.read(&mut buf)?;

            if read == 0 {
                break;
            }

            hasher.update(&buf[..read]);
            file.write_all(&buf[..read])?;
        }

        file.flush()?;

        drop(file);

        let got = format!("{:016x}", hasher.digest());
        let expected = chunk_name_hash(chunk_name);

        if hashes_match(&got, expected) {
            Ok(())
        }
        else {
            Err(SophonError::ChunkHashMismatch {
                expected: expected.to_string(),
                got
            })
        }
    }

    pub fn open_read(&self, chunk_name: &str) -> std::io::Result<File> {
        File::open(self.chunk_path(chunk_name))
    }

    /// Remove the whole store directory with everything in it
    pub fn purge(&self) -> std::io::Result<()> {
        if self.directory.exists() {
            std::fs::remove_dir_all(&self.directory)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_name_for(data: &[u8]) -> String {
        let mut hasher = Xxh64::new(0);

        hasher.update(data);

        format!("{:016x}_{}", hasher.digest(), data.len())
    }

    #[test]
    fn put_and_read_back() -> Result<(), SophonError> {
        let temp = tempfile::tempdir()?;
        let store = ChunkStore::new(temp.path().join("chunks"));
        let cancelled = AtomicBool::new(false);

        let data = b"compressed chunk bytes";
        let name = chunk_name_for(data);

        assert!(!store.exists(&name));

        store.put(&name, &data[..], &cancelled)?;

        assert!(store.contains_valid(&name, &cancelled)?);

        let mut read_back = Vec::new();

        store.open_read(&name)?.read_to_end(&mut read_back)?;

        assert_eq!(read_back, data);

        Ok(())
    }

    #[test]
    fn corrupted_put_is_invalid() -> Result<(), SophonError> {
        let temp = tempfile::tempdir()?;
        let store = ChunkStore::new(temp.path().join("chunks"));
        let cancelled = AtomicBool::new(false);

        let name = chunk_name_for(b"expected bytes");

        let err = store
            .put(&name, &b"different bytes"[..], &cancelled)
            .unwrap_err();

        assert!(matches!(err, SophonError::ChunkHashMismatch { .. }));

        // The blob stays on disk but never passes validation
        assert!(store.exists(&name));
        assert!(!store.contains_valid(&name, &cancelled)?);

        Ok(())
    }

    #[test]
    fn purge_removes_directory() -> Result<(), SophonError> {
        let temp = tempfile::tempdir()?;
        let store = ChunkStore::new(temp.path().join("chunks"));
        let cancelled = AtomicBool::new(false);

        let name = chunk_name_for(b"bytes");

        store.put(&name, &b"bytes"[..], &cancelled)?;
        store.purge()?;

        assert!(!store.directory().exists());

        // Purging an already missing directory is a no-op
        store.purge()?;

        Ok(())
    }
}
