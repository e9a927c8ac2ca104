use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use crate::chunk_store::ChunkStore;
use crate::protos::SophonManifest::{SophonManifestAssetChunk, SophonManifestAssetProperty};
use crate::{check_cancelled, ensure_parent, SophonError};

/// Copy buffer used for decompressed chunk bytes. One buffer lives per
/// worker task, which bounds memory under full parallelism.
pub const COPY_BUFFER_SIZE: usize = 80 * 1024;

/// Builds target files out of store chunks (install) or out of the old file
/// plus downloaded diff chunks (update)
pub struct AssetAssembler<'a> {
    store: &'a ChunkStore,
    game_directory: &'a Path
}

impl<'a> AssetAssembler<'a> {
    pub fn new(store: &'a ChunkStore, game_directory: &'a Path) -> Self {
        Self {
            store,
            game_directory
        }
    }

    #[inline]
    fn target_path(&self, asset: &SophonManifestAssetProperty) -> PathBuf {
        self.game_directory.join(&asset.AssetName)
    }

    /// Assemble the whole asset from store chunks, decompressing each one to
    /// its on-file offset with positional writes
    pub fn merge_asset(
        &self,
        asset: &SophonManifestAssetProperty,
        cancelled: &AtomicBool
    ) -> Result<(), SophonError> {
        let target = self.target_path(asset);

        if asset.is_directory() {
            std::fs::create_dir_all(&target)?;

            return Ok(());
        }

        ensure_parent(&target)?;

        let file = File::create(&target)?;

        file.set_len(asset.AssetSize)?;

        let mut chunks = asset.AssetChunks.iter().collect::<Vec<_>>();

        chunks.sort_by_key(|chunk| chunk.ChunkOnFileOffset);

        let mut buf = vec![0; COPY_BUFFER_SIZE];

        for chunk in chunks {
            self.write_chunk_at(chunk, &file, chunk.ChunkOnFileOffset, &mut buf, cancelled)?;
        }

        tracing::trace!(asset = asset.AssetName, "Assembled asset");

        Ok(())
    }

    /// Assemble the new version of a modified asset into a scratch file next
    /// to the target, then commit it with an atomic rename.
    ///
    /// Byte ranges whose decompressed hash already exists in the old asset
    /// are copied from the old file at their old offsets; everything else is
    /// decompressed from downloaded diff chunks. The old file is only read,
    /// never written, until the final rename replaces it.
    pub fn merge_diff_asset(
        &self,
        old_asset: &SophonManifestAssetProperty,
        new_asset: &SophonManifestAssetProperty,
        cancelled: &AtomicBool
    ) -> Result<(), SophonError> {
        let target = self.target_path(new_asset);

        if new_asset.is_directory() {
            std::fs::create_dir_all(&target)?;

            return Ok(());
        }

        ensure_parent(&target)?;

        let old_file = File::open(self.target_path(old_asset))?;

        let old_regions = old_asset.AssetChunks.iter()
            .map(|chunk| {
                (
                    chunk.ChunkDecompressedHashMd5.to_ascii_lowercase(),
                    (chunk.ChunkOnFileOffset, chunk.ChunkSizeDecompressed)
                )
            })
            .collect::<HashMap<_, _>>();

        let scratch_path = target.with_file_name(format!("{}.tmp", new_asset.AssetHashMd5));
        let scratch = File::create(&scratch_path)?;

        scratch.set_len(new_asset.AssetSize)?;

        let mut chunks = new_asset.AssetChunks.iter().collect::<Vec<_>>();

        chunks.sort_by_key(|chunk| chunk.ChunkOnFileOffset);

        let mut buf = vec![0; COPY_BUFFER_SIZE];

        for chunk in chunks {
            match old_regions.get(&chunk.ChunkDecompressedHashMd5.to_ascii_lowercase()) {
                Some(&(old_offset, length)) => copy_file_region(
                    &old_file,
                    old_offset,
                    length,
                    &scratch,
                    chunk.ChunkOnFileOffset,
                    &mut buf,
                    cancelled
                )?,

                None => self.write_chunk_at(
                    chunk,
                    &scratch,
                    chunk.ChunkOnFileOffset,
                    &mut buf,
                    cancelled
                )?
            }
        }

        drop(old_file);
        drop(scratch);

        std::fs::rename(&scratch_path, &target)?;

        tracing::trace!(asset = new_asset.AssetName, "Assembled diff asset");

        Ok(())
    }

    fn write_chunk_at(
        &self,
        chunk: &SophonManifestAssetChunk,
        file: &File,
        offset: u64,
        buf: &mut [u8],
        cancelled: &AtomicBool
    ) -> Result<(), SophonError> {
        let chunk_file = self.store.open_read(&chunk.ChunkName)?;
        let mut decoder = zstd::Decoder::new(chunk_file)?;

        let mut position = offset;

        loop {
            check_cancelled(cancelled)?;

            let read = decoder.read(buf)?;

            if read == 0 {
                break;
            }

            file.write_all_at(&buf[..read], position)?;

            position += read as u64;
        }

        Ok(())
    }
}

fn copy_file_region(
    src: &File,
    src_offset: u64,
    length: u64,
    dst: &File,
    dst_offset: u64,
    buf: &mut [u8],
    cancelled: &AtomicBool
) -> Result<(), SophonError> {
    let mut copied = 0;

    while copied < length {
        check_cancelled(cancelled)?;

        let want = ((length - copied) as usize).min(buf.len());

        src.read_exact_at(&mut buf[..want], src_offset + copied)?;
        dst.write_all_at(&buf[..want], dst_offset + copied)?;

        copied += want as u64;
    }

    Ok(())
}
