use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{annotation, media_type};
use crate::error::Error;

/// Platform information for a manifest-list entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Content descriptor, used both for list entries and for config/layer blobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Digest of the manifest this entry attests to, if it is an attestation
    pub fn attested_digest(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(annotation::REFERENCE_DIGEST))
            .map(String::as_str)
    }
}

/// Docker manifest list or OCI image index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: i32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ManifestList {
    pub fn new(media_type: &str, manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_type.to_string()),
            manifests,
            annotations: None,
        }
    }
}

/// Docker schema2 or OCI single-platform image manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: i32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Legacy Docker schema1 manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema1Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(rename = "fsLayers", default)]
    pub fs_layers: Vec<FsLayer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

/// The platform fields of an image config blob
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ImageConfig {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context("Failed to parse image config")
    }
}

/// A fetched manifest, classified by media type
#[derive(Debug, Clone)]
pub enum Manifest {
    DockerList(ManifestList),
    OciIndex(ManifestList),
    Schema2(ImageManifest),
    Schema1(Schema1Manifest),
    OciManifest(ImageManifest),
}

impl Manifest {
    /// Parse `raw` according to `media_type`, failing for anything outside
    /// the five supported shapes.
    pub fn parse(raw: &[u8], media_type: &str) -> Result<Self> {
        let manifest = match media_type {
            media_type::DOCKER_MANIFEST_LIST => Manifest::DockerList(
                serde_json::from_slice(raw).context("Failed to parse manifest list")?,
            ),
            media_type::OCI_INDEX => Manifest::OciIndex(
                serde_json::from_slice(raw).context("Failed to parse image index")?,
            ),
            media_type::DOCKER_MANIFEST => Manifest::Schema2(
                serde_json::from_slice(raw).context("Failed to parse schema2 manifest")?,
            ),
            media_type::DOCKER_MANIFEST_SCHEMA1 | media_type::DOCKER_MANIFEST_SCHEMA1_SIGNED => {
                Manifest::Schema1(
                    serde_json::from_slice(raw).context("Failed to parse schema1 manifest")?,
                )
            }
            media_type::OCI_MANIFEST => Manifest::OciManifest(
                serde_json::from_slice(raw).context("Failed to parse OCI manifest")?,
            ),
            other => return Err(Error::UnsupportedManifest(other.to_string()).into()),
        };
        Ok(manifest)
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Manifest::DockerList(_) => media_type::DOCKER_MANIFEST_LIST,
            Manifest::OciIndex(_) => media_type::OCI_INDEX,
            Manifest::Schema2(_) => media_type::DOCKER_MANIFEST,
            Manifest::Schema1(_) => media_type::DOCKER_MANIFEST_SCHEMA1_SIGNED,
            Manifest::OciManifest(_) => media_type::OCI_MANIFEST,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Manifest::DockerList(_) | Manifest::OciIndex(_))
    }

    /// Entries of a list or index; empty for single-platform shapes
    pub fn entries(&self) -> &[Descriptor] {
        match self {
            Manifest::DockerList(list) | Manifest::OciIndex(list) => &list.manifests,
            Manifest::Schema2(_) | Manifest::Schema1(_) | Manifest::OciManifest(_) => &[],
        }
    }

    /// Config digest and layer digests of a single-platform manifest
    pub fn blobs(&self) -> Option<(Option<String>, Vec<String>)> {
        match self {
            Manifest::Schema2(m) | Manifest::OciManifest(m) => Some((
                Some(m.config.digest.clone()),
                m.layers.iter().map(|l| l.digest.clone()).collect(),
            )),
            // schema1 lists layers top-down
            Manifest::Schema1(m) => Some((
                None,
                m.fs_layers.iter().rev().map(|l| l.blob_sum.clone()).collect(),
            )),
            Manifest::DockerList(_) | Manifest::OciIndex(_) => None,
        }
    }
}

/// Guess the media type of a manifest body that arrived without one
/// (OCI layouts, registries that omit the field).
pub fn sniff_media_type(raw: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(raw).ok()?;
    if let Some(media_type) = value.get("mediaType").and_then(|m| m.as_str()) {
        return Some(media_type.to_string());
    }
    if value.get("schemaVersion").and_then(|v| v.as_i64()) == Some(1) {
        return Some(if value.get("signatures").is_some() {
            media_type::DOCKER_MANIFEST_SCHEMA1_SIGNED.to_string()
        } else {
            media_type::DOCKER_MANIFEST_SCHEMA1.to_string()
        });
    }
    if value.get("manifests").is_some() {
        return Some(media_type::OCI_INDEX.to_string());
    }
    if value.get("config").is_some() {
        return Some(media_type::OCI_MANIFEST.to_string());
    }
    None
}

/// Content digest of a manifest or blob
pub fn digest(raw: &[u8]) -> String {
    format!("sha256:{}", sha256::digest(raw))
}

/// Hex part of a digest, used for file and directory names
pub fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map_or(digest, |(_, hex)| hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
        "manifests": [
            {"mediaType": "application/vnd.docker.distribution.manifest.v2+json", "size": 528,
             "digest": "sha256:aaa", "platform": {"architecture": "amd64", "os": "linux"}},
            {"mediaType": "application/vnd.docker.distribution.manifest.v2+json", "size": 528,
             "digest": "sha256:bbb", "platform": {"architecture": "arm", "os": "linux", "variant": "v7"}},
            {"mediaType": "application/vnd.docker.distribution.manifest.v2+json", "size": 528,
             "digest": "sha256:ccc", "platform": {"architecture": "amd64", "os": "windows",
             "os.version": "10.0.17763.5329", "os.features": ["win32k"]}}
        ]
    }"#;

    #[test]
    fn test_parse_manifest_list() {
        let manifest = Manifest::parse(LIST.as_bytes(), media_type::DOCKER_MANIFEST_LIST).unwrap();
        assert!(manifest.is_list());
        let entries = manifest.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].platform.as_ref().unwrap().variant.as_deref(), Some("v7"));
        let windows = entries[2].platform.as_ref().unwrap();
        assert_eq!(windows.os_version.as_deref(), Some("10.0.17763.5329"));
        assert_eq!(windows.os_features.as_deref(), Some(&["win32k".to_string()][..]));
        assert!(manifest.blobs().is_none());
    }

    #[test]
    fn test_parse_unsupported() {
        let err = Manifest::parse(b"{}", "application/vnd.example+json").unwrap_err();
        assert!(matches!(
            crate::error::kind(&err),
            Some(Error::UnsupportedManifest(_))
        ));
    }

    #[test]
    fn test_attestation_entry() {
        let raw = r#"{
            "schemaVersion": 2,
            "manifests": [
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "size": 1,
                 "digest": "sha256:att",
                 "platform": {"architecture": "unknown", "os": "unknown"},
                 "annotations": {"vnd.docker.reference.digest": "sha256:aaa",
                                 "vnd.docker.reference.type": "attestation-manifest"}}
            ]
        }"#;
        let media_type = sniff_media_type(raw.as_bytes()).unwrap();
        assert_eq!(media_type, media_type::OCI_INDEX);
        let manifest = Manifest::parse(raw.as_bytes(), &media_type).unwrap();
        assert_eq!(manifest.entries()[0].attested_digest(), Some("sha256:aaa"));
    }

    #[test]
    fn test_schema1_blobs_bottom_up() {
        let raw = r#"{"schemaVersion": 1, "name": "library/busybox", "tag": "1",
            "architecture": "amd64",
            "fsLayers": [{"blobSum": "sha256:top"}, {"blobSum": "sha256:base"}],
            "signatures": []}"#;
        let media_type = sniff_media_type(raw.as_bytes()).unwrap();
        assert_eq!(media_type, media_type::DOCKER_MANIFEST_SCHEMA1_SIGNED);
        let manifest = Manifest::parse(raw.as_bytes(), &media_type).unwrap();
        let (config, layers) = manifest.blobs().unwrap();
        assert!(config.is_none());
        assert_eq!(layers, vec!["sha256:base", "sha256:top"]);
    }

    #[test]
    fn test_sniff_oci_manifest() {
        let raw = r#"{"schemaVersion": 2,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "size": 2, "digest": "sha256:cfg"},
            "layers": []}"#;
        assert_eq!(
            sniff_media_type(raw.as_bytes()).as_deref(),
            Some(media_type::OCI_MANIFEST)
        );
        assert!(sniff_media_type(b"not json").is_none());
    }

    #[test]
    fn test_digest_hex() {
        assert_eq!(digest_hex("sha256:abc"), "abc");
        assert_eq!(digest_hex("abc"), "abc");
        assert_eq!(
            digest(b"hello"),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
