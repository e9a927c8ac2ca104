use serde::{Deserialize, Serialize};

/// Matching field of the manifest covering the game files themselves,
/// as opposed to one of the voiceover packages
pub const GAME_MATCHING_FIELD: &str = "game";

/// Build descriptor returned by the launcher API for one branch
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub tag: String,
    pub manifests: Vec<BuildManifest>
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub matching_field: String,
    pub manifest: Manifest,
    pub manifest_download: DownloadInfo,
    pub chunk_download: DownloadInfo,
    pub stats: ManifestStats
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub checksum: String
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub url_prefix: String,

    #[serde(default)]
    pub url_suffix: String
}

impl DownloadInfo {
    pub fn download_url(&self, name: &str) -> String {
        format!("{}{}/{}", self.url_prefix, self.url_suffix, name)
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStats {
    pub compressed_size: String,
    pub uncompressed_size: String,
    pub file_count: String,
    pub chunk_count: String
}

impl ManifestStats {
    #[inline]
    pub fn compressed_bytes(&self) -> u64 {
        self.compressed_size.parse().unwrap_or(0)
    }

    #[inline]
    pub fn uncompressed_bytes(&self) -> u64 {
        self.uncompressed_size.parse().unwrap_or(0)
    }
}

/// Voiceover packages selected for installation. The `game` manifest is
/// always accepted; manifests with unknown matching fields never are.
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioLanguages {
    pub zh_cn: bool,
    pub en_us: bool,
    pub ja_jp: bool,
    pub ko_kr: bool
}

impl AudioLanguages {
    pub fn all() -> Self {
        Self {
            zh_cn: true,
            en_us: true,
            ja_jp: true,
            ko_kr: true
        }
    }

    pub fn accepts(&self, matching_field: &str) -> bool {
        match matching_field {
            GAME_MATCHING_FIELD => true,

            "zh-cn" => self.zh_cn,
            "en-us" => self.en_us,
            "ja-jp" => self.ja_jp,
            "ko-kr" => self.ko_kr,

            _ => false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_url() {
        let info = DownloadInfo {
            url_prefix: String::from("https://example.com/chunks"),
            url_suffix: String::new()
        };

        assert_eq!(info.download_url("abc_123"), "https://example.com/chunks/abc_123");

        let info = DownloadInfo {
            url_prefix: String::from("https://example.com"),
            url_suffix: String::from("/blobs")
        };

        assert_eq!(info.download_url("abc_123"), "https://example.com/blobs/abc_123");
    }

    #[test]
    fn language_filter() {
        let languages = AudioLanguages {
            ja_jp: true,
            ..AudioLanguages::default()
        };

        assert!(languages.accepts("game"));
        assert!(languages.accepts("ja-jp"));

        assert!(!languages.accepts("en-us"));
        assert!(!languages.accepts("zh-cn"));
        assert!(!languages.accepts("ko-kr"));
        assert!(!languages.accepts("fr-fr"));
    }
}
