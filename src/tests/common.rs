use std::path::Path;
use std::sync::{Arc, Mutex};

use protobuf::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xxhash_rust::xxh64::xxh64;

use crate::md5_hash_str;
use crate::operation::{OperationContext, OperationKind};
use crate::progress::Update;
use crate::protos::SophonManifest::{
    SophonManifestAssetChunk, SophonManifestAssetProperty, SophonManifestProto
};
use crate::protos::DIRECTORY_ASSET_TYPE;
use crate::schemas::{
    AudioLanguages, Build, BuildManifest, DownloadInfo, Manifest, ManifestStats
};

/// Chunk blobs of an asset keyed by their on-wire chunk name
pub type AssetBlobs = Vec<(String, Vec<u8>)>;

/// Build a manifest asset record out of its decompressed pieces, producing
/// the compressed blobs a chunk server would hand out
pub fn asset_from_pieces(name: &str, pieces: &[&[u8]]) -> (SophonManifestAssetProperty, AssetBlobs) {
    let mut chunks = Vec::new();
    let mut blobs = Vec::new();
    let mut content = Vec::new();
    let mut offset = 0;

    for piece in pieces {
        let compressed = zstd::encode_all(*piece, 3).unwrap();

        let mut chunk = SophonManifestAssetChunk::new();

        chunk.ChunkName = format!("{:016x}_{}", xxh64(&compressed, 0), compressed.len());
        chunk.ChunkDecompressedHashMd5 = md5_hash_str(piece);
        chunk.ChunkOnFileOffset = offset;
        chunk.ChunkSize = compressed.len() as u64;
        chunk.ChunkSizeDecompressed = piece.len() as u64;

        offset += piece.len() as u64;

        blobs.push((chunk.ChunkName.clone(), compressed));
        chunks.push(chunk);

        content.extend_from_slice(piece);
    }

    let mut asset = SophonManifestAssetProperty::new();

    asset.AssetName = name.to_string();
    asset.AssetHashMd5 = md5_hash_str(&content);
    asset.AssetSize = content.len() as u64;
    asset.AssetChunks = chunks;

    (asset, blobs)
}

pub fn directory_record(name: &str) -> (SophonManifestAssetProperty, AssetBlobs) {
    let mut asset = SophonManifestAssetProperty::new();

    asset.AssetName = name.to_string();
    asset.AssetType = DIRECTORY_ASSET_TYPE;

    (asset, Vec::new())
}

/// A wiremock server plus the runtime that drives it. The engine under test
/// is blocking, so the runtime is created manually and kept alive for the
/// whole test.
pub struct MockSophon {
    pub rt: tokio::runtime::Runtime,
    pub server: MockServer
}

impl MockSophon {
    pub fn start() -> Self {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let server = rt.block_on(MockServer::start());

        Self { rt, server }
    }

    /// Serve a one-manifest build: the zstd-compressed manifest protobuf
    /// under `/manifests/{id}` and every chunk blob under `/chunks/{name}`.
    /// Returns the build descriptor pointing at this server.
    pub fn mount_build(
        &self,
        manifest_id: &str,
        tag: &str,
        assets: Vec<(SophonManifestAssetProperty, AssetBlobs)>
    ) -> Build {
        let mut proto = SophonManifestProto::new();
        let mut blobs = Vec::new();

        for (asset, asset_blobs) in assets {
            proto.Assets.push(asset);
            blobs.extend(asset_blobs);
        }

        let total_uncompressed = proto.total_bytes_decompressed();
        let total_chunks = proto.total_chunks();
        let total_files = proto.total_files();

        let proto_bytes = proto.write_to_bytes().unwrap();
        let checksum = md5_hash_str(&proto_bytes);
        let compressed_manifest = zstd::encode_all(&proto_bytes[..], 3).unwrap();

        self.rt.block_on(async {
            Mock::given(method("GET"))
                .and(path(format!("/manifests/{manifest_id}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(compressed_manifest))
                .mount(&self.server)
                .await;

            for (name, blob) in &blobs {
                Mock::given(method("GET"))
                    .and(path(format!("/chunks/{name}")))
                    .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.clone()))
                    .mount(&self.server)
                    .await;
            }
        });

        Build {
            tag: tag.to_string(),
            manifests: vec![BuildManifest {
                matching_field: String::from("game"),
                manifest: Manifest {
                    id: manifest_id.to_string(),
                    checksum
                },
                manifest_download: DownloadInfo {
                    url_prefix: format!("{}/manifests", self.server.uri()),
                    url_suffix: String::new()
                },
                chunk_download: DownloadInfo {
                    url_prefix: format!("{}/chunks", self.server.uri()),
                    url_suffix: String::new()
                },
                stats: ManifestStats {
                    compressed_size: String::from("0"),
                    uncompressed_size: total_uncompressed.to_string(),
                    file_count: total_files.to_string(),
                    chunk_count: total_chunks.to_string()
                }
            }]
        }
    }

    /// How many times each `/chunks/*` path has been requested
    pub fn chunk_request_count(&self) -> usize {
        self.rt
            .block_on(self.server.received_requests())
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path().starts_with("/chunks/"))
            .count()
    }
}

pub fn operation_context(
    kind: OperationKind,
    root: &Path,
    local: Option<Build>,
    remote: Option<Build>
) -> OperationContext {
    OperationContext {
        state: kind,
        game_directory: root.join("game"),
        chunks_directory: root.join("chunks"),
        predownload_status_path: root.join("predownload.json"),
        local_branch: local,
        remote_branch: remote,
        audio_languages: AudioLanguages::default()
    }
}

pub fn collecting_updater() -> (Arc<Mutex<Vec<Update>>>, impl Fn(Update) + Clone + Send + 'static) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let updates_clone = updates.clone();

    (updates, move |update| {
        updates_clone.lock().unwrap().push(update);
    })
}
