use std::collections::{HashMap, HashSet};

use crate::hashes_match;
use crate::manifest::{DecodedBuild, DecodedManifest};
use crate::protos::SophonManifest::{SophonManifestAssetChunk, SophonManifestAssetProperty};
use crate::schemas::DownloadInfo;

/// An asset paired with the endpoint its chunks download from
#[derive(Debug, Clone, Copy)]
pub struct SophonAsset<'a> {
    pub chunk_download: &'a DownloadInfo,
    pub asset: &'a SophonManifestAssetProperty
}

/// A modified asset: the old and new manifest records plus the chunks whose
/// decompressed content is new to this build. Chunks that only moved to a
/// different offset are not listed and are copied from the old file at
/// assembly time.
#[derive(Debug, Clone)]
pub struct AssetDiff<'a> {
    pub chunk_download: &'a DownloadInfo,
    pub old: &'a SophonManifestAssetProperty,
    pub new: &'a SophonManifestAssetProperty,
    pub diff_chunks: Vec<&'a SophonManifestAssetChunk>
}

#[derive(Debug, Clone, Default)]
pub struct BuildDiff<'a> {
    pub added: Vec<SophonAsset<'a>>,
    pub modified: Vec<AssetDiff<'a>>,
    pub deleted: Vec<&'a SophonManifestAssetProperty>
}

impl BuildDiff<'_> {
    /// Bytes of new content an update writes to the game volume
    pub fn update_bytes(&self) -> u64 {
        let added = self.added.iter()
            .map(|added| added.asset.AssetSize)
            .sum::<u64>();

        let modified = self.modified.iter()
            .flat_map(|diff| &diff.diff_chunks)
            .map(|chunk| chunk.ChunkSizeDecompressed)
            .sum::<u64>();

        added + modified
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

#[inline]
fn name_key(asset: &SophonManifestAssetProperty) -> String {
    asset.AssetName.to_ascii_lowercase()
}

/// Compute the added / modified / deleted asset sets between two decoded
/// builds. Manifests are paired by their matching field, so a changed
/// voiceover selection cannot misalign the comparison; a remote manifest
/// with no local counterpart is all-added, a local one with no remote
/// counterpart is all-deleted.
pub fn diff_builds<'a>(
    local: &'a DecodedBuild,
    remote: &'a DecodedBuild
) -> BuildDiff<'a> {
    let local_by_field = local.manifests.iter()
        .map(|manifest| (manifest.matching_field.as_str(), manifest))
        .collect::<HashMap<_, _>>();

    let remote_fields = remote.manifests.iter()
        .map(|manifest| manifest.matching_field.as_str())
        .collect::<HashSet<_>>();

    let mut diff = BuildDiff::default();

    for remote_manifest in &remote.manifests {
        match local_by_field.get(remote_manifest.matching_field.as_str()) {
            Some(&local_manifest) => {
                diff_manifests(local_manifest, remote_manifest, &mut diff);
            }

            None => {
                diff.added.extend(remote_manifest.proto.Assets.iter().map(|asset| {
                    SophonAsset {
                        chunk_download: &remote_manifest.chunk_download,
                        asset
                    }
                }));
            }
        }
    }

    for local_manifest in &local.manifests {
        if !remote_fields.contains(local_manifest.matching_field.as_str()) {
            diff.deleted.extend(local_manifest.proto.Assets.iter());
        }
    }

    tracing::info!(
        added = diff.added.len(),
        modified = diff.modified.len(),
        deleted = diff.deleted.len(),
        "Computed build diff"
    );

    diff
}

fn diff_manifests<'a>(
    local: &'a DecodedManifest,
    remote: &'a DecodedManifest,
    diff: &mut BuildDiff<'a>
) {
    let local_by_name = local.proto.Assets.iter()
        .map(|asset| (name_key(asset), asset))
        .collect::<HashMap<_, _>>();

    let remote_names = remote.proto.Assets.iter()
        .map(name_key)
        .collect::<HashSet<_>>();

    for asset in &remote.proto.Assets {
        match local_by_name.get(&name_key(asset)) {
            None => diff.added.push(SophonAsset {
                chunk_download: &remote.chunk_download,
                asset
            }),

            Some(&old) if !hashes_match(&old.AssetHashMd5, &asset.AssetHashMd5) => {
                let old_chunk_hashes = old.AssetChunks.iter()
                    .map(|chunk| chunk.ChunkDecompressedHashMd5.to_ascii_lowercase())
                    .collect::<HashSet<_>>();

                let diff_chunks = asset.AssetChunks.iter()
                    .filter(|chunk| {
                        !old_chunk_hashes.contains(&chunk.ChunkDecompressedHashMd5.to_ascii_lowercase())
                    })
                    .collect::<Vec<_>>();

                diff.modified.push(AssetDiff {
                    chunk_download: &remote.chunk_download,
                    old,
                    new: asset,
                    diff_chunks
                });
            }

            // Same name, same content hash - nothing to do
            Some(_) => ()
        }
    }

    for asset in &local.proto.Assets {
        if !remote_names.contains(&name_key(asset)) {
            diff.deleted.push(asset);
        }
    }
}
