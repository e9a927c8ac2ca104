use std::io::Read;
use std::sync::atomic::AtomicBool;

use protobuf::Message;
use reqwest::blocking::Client;

use crate::diff::SophonAsset;
use crate::protos::SophonManifest::SophonManifestProto;
use crate::schemas::{AudioLanguages, Build, BuildManifest, DownloadInfo};
use crate::{check_cancelled, hashes_match, md5_hash_str, SophonError};

/// One decoded manifest together with the endpoint its chunks download from
#[derive(Debug, Clone)]
pub struct DecodedManifest {
    pub matching_field: String,
    pub chunk_download: DownloadInfo,
    pub proto: SophonManifestProto
}

#[derive(Debug, Clone)]
pub struct DecodedBuild {
    pub tag: String,
    pub total_uncompressed_bytes: u64,
    pub manifests: Vec<DecodedManifest>
}

impl DecodedBuild {
    /// Flattened view of every asset paired with its chunk download endpoint
    pub fn assets(&self) -> impl Iterator<Item = SophonAsset<'_>> {
        self.manifests.iter().flat_map(|manifest| {
            manifest.proto.Assets.iter().map(move |asset| SophonAsset {
                chunk_download: &manifest.chunk_download,
                asset
            })
        })
    }
}

/// Fetch one manifest blob, stream it through the zstd decoder into memory,
/// gate it on the advertised checksum and parse the protobuf.
fn decode_manifest(
    client: &Client,
    stub: &BuildManifest,
    cancelled: &AtomicBool
) -> Result<DecodedManifest, SophonError> {
    let manifest_id = &stub.manifest.id;
    let url = stub.manifest_download.download_url(manifest_id);

    tracing::debug!(manifest = manifest_id, url, "Fetching manifest");

    let fetch_failed = |message: String| SophonError::ManifestFetchFailed {
        id: manifest_id.clone(),
        message
    };

    let response = client
        .get(&url)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(|err| fetch_failed(err.to_string()))?;

    let mut decoder = zstd::Decoder::new(response)
        .map_err(|err| fetch_failed(err.to_string()))?;

    let mut proto_bytes = Vec::new();
    let mut buf = vec![0; crate::HASHING_BUFFER_SIZE];

    loop {
        check_cancelled(cancelled)?;

        let read = decoder
            .read(&mut buf)
            .map_err(|err| fetch_failed(err.to_string()))?;

        if read == 0 {
            break;
        }

        proto_bytes.extend_from_slice(&buf[..read]);
    }

    let checksum = md5_hash_str(&proto_bytes);

    if !hashes_match(&checksum, &stub.manifest.checksum) {
        return Err(SophonError::ManifestChecksumMismatch {
            id: manifest_id.clone(),
            expected: stub.manifest.checksum.clone(),
            got: checksum
        });
    }

    let proto = SophonManifestProto::parse_from_bytes(&proto_bytes)?;

    tracing::debug!(
        manifest = manifest_id,
        files = proto.total_files(),
        chunks = proto.total_chunks(),
        "Decoded manifest"
    );

    Ok(DecodedManifest {
        matching_field: stub.matching_field.clone(),
        chunk_download: stub.chunk_download.clone(),
        proto
    })
}

/// Decode every manifest of the build accepted by the language selection.
/// Stubs are decoded serially; only accepted stubs contribute to the
/// uncompressed byte total.
pub fn decode_build(
    client: &Client,
    build: &Build,
    languages: &AudioLanguages,
    cancelled: &AtomicBool
) -> Result<DecodedBuild, SophonError> {
    let mut manifests = Vec::new();
    let mut total_uncompressed_bytes = 0;

    for stub in &build.manifests {
        if !languages.accepts(&stub.matching_field) {
            tracing::trace!(
                matching_field = stub.matching_field,
                "Manifest not selected, skipping"
            );

            continue;
        }

        check_cancelled(cancelled)?;

        manifests.push(decode_manifest(client, stub, cancelled)?);

        total_uncompressed_bytes += stub.stats.uncompressed_bytes();
    }

    tracing::info!(
        tag = build.tag,
        manifests = manifests.len(),
        total_uncompressed_bytes,
        "Decoded build"
    );

    Ok(DecodedBuild {
        tag: build.tag.clone(),
        total_uncompressed_bytes,
        manifests
    })
}
