use SophonManifest::{SophonManifestAssetProperty, SophonManifestProto};

include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));

/// Asset type marking an entry as an empty directory instead of a regular file
pub const DIRECTORY_ASSET_TYPE: u32 = 64;

impl SophonManifestProto {
    pub fn total_bytes_decompressed(&self) -> u64 {
        self.Assets.iter()
            .flat_map(|asset| &asset.AssetChunks)
            .map(|asset_chunk| asset_chunk.ChunkSizeDecompressed)
            .sum()
    }

    pub fn total_chunks(&self) -> u64 {
        self.Assets.iter()
            .flat_map(|asset| &asset.AssetChunks)
            .count() as u64
    }

    pub fn total_files(&self) -> u64 {
        self.Assets.len() as u64
    }
}

impl SophonManifestAssetProperty {
    #[inline]
    pub fn is_directory(&self) -> bool {
        self.AssetType == DIRECTORY_ASSET_TYPE
    }
}
