use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::diff::SophonAsset;
use crate::progress::{ProgressCounter, Update};
use crate::{check_cancelled, file_region_hash_md5, hashes_match, SophonError};

/// Stream every asset of the manifest set and collect the ones that need
/// repair. Each chunk region of each file is hashed against the manifest;
/// an asset is a conflict after its first mismatching region, a missing
/// file, or a read error.
///
/// Remaining chunks of a conflicting asset are skipped but still reported
/// as finished with zero bytes so the progress totals stay consistent.
pub fn verify_assets<'a>(
    game_dir: &Path,
    assets: &[SophonAsset<'a>],
    threads: usize,
    cancelled: &AtomicBool,
    updater: impl Fn(Update) + Clone + Send + 'static
) -> Result<Vec<SophonAsset<'a>>, SophonError> {
    let progress = ProgressCounter::for_chunks(
        assets.iter().flat_map(|sophon_asset| sophon_asset.asset.AssetChunks.iter())
    );

    (updater)(progress.msg_verified_bytes());
    (updater)(progress.msg_verified_chunks());

    let pool = Mutex::new(assets.to_vec());

    let (sender, receiver) = std::sync::mpsc::channel();

    // Conflicts are collected over the channel and merged after the join,
    // so no shared list needs locking in the check loop
    let conflicts = std::thread::scope(|scope| {
        let pool = &pool;
        let progress = &progress;

        for _ in 0..threads {
            let sender_clone = sender.clone();
            let updater_clone = updater.clone();

            scope.spawn(move || 'check: loop {
                if cancelled.load(Ordering::Relaxed) {
                    break 'check;
                }

                let next = {
                    let mut pool_lock = pool
                        .lock()
                        .expect("failed to lock files verification pool mutex");

                    let Some(next) = pool_lock.pop()
                    else {
                        break 'check;
                    };

                    next
                };

                tracing::trace!(file_name = next.asset.AssetName, "Checking file");

                match verify_asset(game_dir, &next, progress, cancelled) {
                    Ok(true) => (),

                    Ok(false) => {
                        let _ = sender_clone.send(next);
                    }

                    Err(SophonError::Cancelled) => break 'check,

                    Err(err) => {
                        tracing::error!(
                            ?err,
                            file_name = next.asset.AssetName,
                            "Failed to check file"
                        );

                        let _ = sender_clone.send(next);
                    }
                }

                (updater_clone)(progress.msg_verified_bytes());
                (updater_clone)(progress.msg_verified_chunks());
            });
        }

        drop(sender);

        receiver.into_iter().collect::<Vec<_>>()
    });

    check_cancelled(cancelled)?;

    Ok(conflicts)
}

fn verify_asset(
    game_dir: &Path,
    sophon_asset: &SophonAsset,
    progress: &ProgressCounter,
    cancelled: &AtomicBool
) -> Result<bool, SophonError> {
    let asset = sophon_asset.asset;
    let path = game_dir.join(&asset.AssetName);

    if asset.is_directory() {
        std::fs::create_dir_all(&path)?;

        return Ok(true);
    }

    if !path.is_file() {
        for _ in &asset.AssetChunks {
            progress.report(0, true);
        }

        return Ok(false);
    }

    let mut file = File::open(&path)?;

    for (position, chunk) in asset.AssetChunks.iter().enumerate() {
        check_cancelled(cancelled)?;

        let region_hash = file_region_hash_md5(
            &mut file,
            chunk.ChunkOnFileOffset,
            chunk.ChunkSizeDecompressed,
            cancelled
        )?;

        if !hashes_match(&region_hash, &chunk.ChunkDecompressedHashMd5) {
            tracing::debug!(
                file_name = asset.AssetName,
                chunk = chunk.ChunkName,
                "Chunk region failed the hash check"
            );

            for _ in position..asset.AssetChunks.len() {
                progress.report(0, true);
            }

            return Ok(false);
        }

        progress.report(chunk.ChunkSizeDecompressed, true);
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::md5_hash_str;
    use crate::protos::SophonManifest::{
        SophonManifestAssetChunk, SophonManifestAssetProperty
    };
    use crate::protos::DIRECTORY_ASSET_TYPE;
    use crate::schemas::DownloadInfo;

    use super::*;

    fn chunk_of(data: &[u8], offset: u64) -> SophonManifestAssetChunk {
        let mut chunk = SophonManifestAssetChunk::new();

        chunk.ChunkName = format!("{:016x}_{}", 0, data.len());
        chunk.ChunkDecompressedHashMd5 = md5_hash_str(data);
        chunk.ChunkOnFileOffset = offset;
        chunk.ChunkSizeDecompressed = data.len() as u64;

        chunk
    }

    fn asset_of(name: &str, content: &[u8], chunks: Vec<SophonManifestAssetChunk>) -> SophonManifestAssetProperty {
        let mut asset = SophonManifestAssetProperty::new();

        asset.AssetName = name.to_string();
        asset.AssetHashMd5 = md5_hash_str(content);
        asset.AssetSize = content.len() as u64;
        asset.AssetChunks = chunks;

        asset
    }

    fn download_info() -> DownloadInfo {
        DownloadInfo {
            url_prefix: String::from("http://localhost/chunks"),
            url_suffix: String::new()
        }
    }

    fn collecting_updater() -> (Arc<Mutex<Vec<Update>>>, impl Fn(Update) + Clone + Send + 'static) {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let updates_clone = updates.clone();

        (updates, move |update| {
            updates_clone.lock().unwrap().push(update);
        })
    }

    #[test]
    fn clean_and_broken_assets() -> Result<(), SophonError> {
        let temp = tempfile::tempdir()?;
        let cancelled = AtomicBool::new(false);

        std::fs::write(temp.path().join("good.bin"), b"hello world!")?;
        std::fs::write(temp.path().join("bad.bin"), b"hello morld!")?;

        let good = asset_of("good.bin", b"hello world!", vec![
            chunk_of(b"hello ", 0),
            chunk_of(b"world!", 6)
        ]);

        let bad = asset_of("bad.bin", b"hello world!", vec![
            chunk_of(b"hello ", 0),
            chunk_of(b"world!", 6)
        ]);

        let missing = asset_of("missing.bin", b"hello world!", vec![
            chunk_of(b"hello world!", 0)
        ]);

        let info = download_info();

        let assets = [&good, &bad, &missing]
            .map(|asset| SophonAsset {
                chunk_download: &info,
                asset
            });

        let (updates, updater) = collecting_updater();

        let conflicts = verify_assets(temp.path(), &assets, 2, &cancelled, updater)?;

        let mut conflict_names = conflicts.iter()
            .map(|conflict| conflict.asset.AssetName.as_str())
            .collect::<Vec<_>>();

        conflict_names.sort();

        assert_eq!(conflict_names, ["bad.bin", "missing.bin"]);

        // Every chunk is accounted for even when an asset is skipped early
        let final_chunks = updates.lock().unwrap().iter().rev()
            .find_map(|update| match update {
                Update::VerifyingProgressChunks { checked_chunks, total_chunks } => {
                    Some((*checked_chunks, *total_chunks))
                }

                _ => None
            });

        assert_eq!(final_chunks, Some((5, 5)));

        Ok(())
    }

    #[test]
    fn directory_assets_are_materialized() -> Result<(), SophonError> {
        let temp = tempfile::tempdir()?;
        let cancelled = AtomicBool::new(false);

        let mut dir_asset = SophonManifestAssetProperty::new();

        dir_asset.AssetName = String::from("empty/dir");
        dir_asset.AssetType = DIRECTORY_ASSET_TYPE;

        let info = download_info();

        let assets = [SophonAsset {
            chunk_download: &info,
            asset: &dir_asset
        }];

        let conflicts = verify_assets(temp.path(), &assets, 2, &cancelled, |_| ())?;

        assert!(conflicts.is_empty());
        assert!(temp.path().join("empty/dir").is_dir());

        Ok(())
    }
}
