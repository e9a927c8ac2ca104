use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::protos::SophonManifest::SophonManifestAssetChunk;
use crate::SophonError;

/// Progress messages pushed through the operation updater callback.
///
/// The updater is expected to marshal these onto its own observer thread;
/// the engine never blocks on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Update {
    CheckingFreeSpace(PathBuf),

    /// `(chunks directory)`
    DownloadingStarted(PathBuf),

    DownloadingProgressBytes {
        downloaded_bytes: u64,
        total_bytes: u64
    },

    DownloadingProgressFiles {
        merged_files: u64,
        total_files: u64
    },

    DownloadingFinished,

    DeletingStarted,

    DeletingProgress {
        deleted_files: u64,
        total_files: u64
    },

    DeletingFinished,

    VerifyingStarted,

    VerifyingProgressBytes {
        verified_bytes: u64,
        total_bytes: u64
    },

    VerifyingProgressChunks {
        checked_chunks: u64,
        total_chunks: u64
    },

    VerifyingFinished {
        conflicts: u64
    },

    RepairingStarted,
    RepairingFinished,

    /// `(status file path)`
    PredownloadStarted(PathBuf),
    PredownloadFinished,

    DownloadingError(SophonError)
}

/// Thread-safe aggregator of per-chunk `(bytes, finished)` events
#[derive(Debug)]
pub struct ProgressCounter {
    total_bytes: u64,
    total_chunks: u64,
    bytes: AtomicU64,
    chunks: AtomicU64
}

impl ProgressCounter {
    pub fn new(total_bytes: u64, total_chunks: u64) -> Self {
        Self {
            total_bytes,
            total_chunks,
            bytes: AtomicU64::new(0),
            chunks: AtomicU64::new(0)
        }
    }

    /// Totals over a set of scheduled chunks, counted in decompressed bytes
    pub fn for_chunks<'a>(chunks: impl Iterator<Item = &'a SophonManifestAssetChunk>) -> Self {
        let (total_bytes, total_chunks) = chunks
            .fold((0, 0), |(bytes, count), chunk| {
                (bytes + chunk.ChunkSizeDecompressed, count + 1)
            });

        Self::new(total_bytes, total_chunks)
    }

    /// Record one `(bytes, finished)` event. Skipped chunks report zero bytes
    /// with the finished flag set so the chunk total stays consistent.
    pub fn report(&self, bytes: u64, finished: bool) {
        if bytes > 0 {
            self.bytes.fetch_add(bytes, Ordering::SeqCst);
        }

        if finished {
            self.chunks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    #[inline]
    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Acquire)
    }

    pub fn msg_downloaded_bytes(&self) -> Update {
        Update::DownloadingProgressBytes {
            downloaded_bytes: self.bytes(),
            total_bytes: self.total_bytes
        }
    }

    pub fn msg_verified_bytes(&self) -> Update {
        Update::VerifyingProgressBytes {
            verified_bytes: self.bytes(),
            total_bytes: self.total_bytes
        }
    }

    pub fn msg_verified_chunks(&self) -> Update {
        Update::VerifyingProgressChunks {
            checked_chunks: self.chunks(),
            total_chunks: self.total_chunks
        }
    }
}
