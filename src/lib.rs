use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh64::Xxh64;

use crate::prettify_bytes::prettify_bytes;

pub mod assembler;
pub mod chunk_store;
pub mod diff;
pub mod free_space;
pub mod manifest;
pub mod operation;
pub mod prettify_bytes;
pub mod progress;
pub mod protos;
pub mod schemas;
pub mod verifier;

#[cfg(test)]
mod tests;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod prelude {
    pub use super::chunk_store::ChunkStore;
    pub use super::diff::{diff_builds, AssetDiff, BuildDiff, SophonAsset};
    pub use super::manifest::{decode_build, DecodedBuild, DecodedManifest};
    pub use super::operation::{
        OperationContext, OperationKind, OperationState, PredownloadStatus, SophonEngine
    };
    pub use super::progress::Update;
    pub use super::schemas::{AudioLanguages, Build};
    pub use super::SophonError;
}

pub(crate) const HASHING_BUFFER_SIZE: usize = 64 * 1024;

/// Returns `Err(SophonError::Cancelled)` once the shared flag has been raised.
///
/// Every streaming loop in the crate polls this between buffers so that
/// cancellation is observed without tearing a write in half.
#[inline]
pub(crate) fn check_cancelled(cancelled: &AtomicBool) -> Result<(), SophonError> {
    if cancelled.load(Ordering::Relaxed) {
        Err(SophonError::Cancelled)
    }
    else {
        Ok(())
    }
}

pub(crate) fn ensure_parent(path: impl AsRef<Path>) -> std::io::Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    Ok(())
}

#[inline]
pub fn md5_hash_str(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// Hashes are transported as hex strings of mixed case, compared ASCII
/// case-insensitively everywhere.
#[inline]
pub fn hashes_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

pub fn stream_md5(
    mut reader: impl Read,
    cancelled: &AtomicBool
) -> Result<String, SophonError> {
    let mut hasher = Md5::new();
    let mut buf = vec![0; HASHING_BUFFER_SIZE];

    loop {
        check_cancelled(cancelled)?;

        let read = reader.read(&mut buf)?;

        if read == 0 {
            break;
        }

        hasher.update(&buf[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn stream_xxh64(
    mut reader: impl Read,
    cancelled: &AtomicBool
) -> Result<String, SophonError> {
    let mut hasher = Xxh64::new(0);
    let mut buf = vec![0; HASHING_BUFFER_SIZE];

    loop {
        check_cancelled(cancelled)?;

        let read = reader.read(&mut buf)?;

        if read == 0 {
            break;
        }

        hasher.update(&buf[..read]);
    }

    Ok(format!("{:016x}", hasher.digest()))
}

// MD5 hash calculation without reading the whole file contents into RAM
pub fn file_md5_hash_str(
    file_path: impl AsRef<Path>,
    cancelled: &AtomicBool
) -> Result<String, SophonError> {
    stream_md5(File::open(file_path)?, cancelled)
}

pub fn file_xxh64_hash_str(
    file_path: impl AsRef<Path>,
    cancelled: &AtomicBool
) -> Result<String, SophonError> {
    stream_xxh64(File::open(file_path)?, cancelled)
}

/// Check that the file exists and matches the expected length and MD5 hash
pub fn check_file(
    file_path: impl AsRef<Path>,
    expected_size: u64,
    expected_md5: &str,
    cancelled: &AtomicBool
) -> Result<bool, SophonError> {
    let Ok(fs_metadata) = std::fs::metadata(&file_path)
    else {
        return Ok(false);
    };

    if fs_metadata.len() != expected_size {
        return Ok(false);
    }

    let file_md5 = file_md5_hash_str(&file_path, cancelled)?;

    Ok(hashes_match(&file_md5, expected_md5))
}

pub fn file_region_hash_md5(
    file: &mut File,
    offset: u64,
    length: u64,
    cancelled: &AtomicBool
) -> Result<String, SophonError> {
    file.seek(SeekFrom::Start(offset))?;

    stream_md5(file.take(length), cancelled)
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SophonError {
    /// Specified downloading path is not available in system
    ///
    /// `(path)`
    #[error("Path is not mounted: {0:?}")]
    PathNotMounted(PathBuf),

    /// No free space available under specified path
    #[error("No free space available for specified path: {0:?} (requires {}, available {})", prettify_bytes(*.required), prettify_bytes(*.available))]
    NoSpaceAvailable {
        path: PathBuf,
        required: u64,
        available: u64
    },

    /// Operation context misses the build descriptor needed by the pipeline
    #[error("Operation context is missing the {0} build descriptor")]
    MissingBuildDescriptor(String),

    /// reqwest error
    #[error("reqwest error: {0}")]
    Reqwest(String),

    /// Failed to fetch or decompress a manifest blob
    #[error("Failed to fetch manifest {id}: {message}")]
    ManifestFetchFailed { id: String, message: String },

    /// Decompressed manifest bytes don't hash to the advertised checksum
    #[error("Manifest {id} checksum mismatch: expected `{expected}`, got `{got}`")]
    ManifestChecksumMismatch {
        id: String,
        expected: String,
        got: String
    },

    #[error("Failed to parse manifest protobuf: {0}")]
    ManifestParseFailed(String),

    #[error("Chunk hash mismatch: expected `{expected}`, got `{got}`")]
    ChunkHashMismatch { expected: String, got: String },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Operation cancelled")]
    Cancelled
}

impl SophonError {
    /// Precondition failures abort the pipeline with a user-visible message
    /// but are reported as a controlled stop rather than a failed operation.
    pub fn is_precondition_failure(&self) -> bool {
        matches!(
            self,
            Self::PathNotMounted(_)
                | Self::NoSpaceAvailable { .. }
                | Self::ManifestFetchFailed { .. }
                | Self::ManifestChecksumMismatch { .. }
        )
    }
}

impl From<reqwest::Error> for SophonError {
    #[inline(always)]
    fn from(error: reqwest::Error) -> Self {
        Self::Reqwest(error.to_string())
    }
}

impl From<std::io::Error> for SophonError {
    #[inline(always)]
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value.to_string())
    }
}

impl From<protobuf::Error> for SophonError {
    #[inline(always)]
    fn from(value: protobuf::Error) -> Self {
        Self::ManifestParseFailed(value.to_string())
    }
}
