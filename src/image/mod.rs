//! Records of transferred images and the archive index that persists them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::constants::archive::{INDEX_VERSION, MIN_INDEX_VERSION};
use crate::error::Error;
use crate::manifest::{self, ImageConfig};


/// One architecture/OS variant of an image
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Platform {
    pub arch: String,
    pub os: String,
    pub os_version: String,
    pub os_features: Vec<String>,
    pub variant: String,
}

impl Platform {
    /// Platform of a list entry, with blanks backfilled from the image config
    pub fn from_entry(entry: &manifest::Platform, config: Option<&ImageConfig>) -> Self {
        let mut platform = Self {
            arch: entry.architecture.clone(),
            os: entry.os.clone(),
            os_version: entry.os_version.clone().unwrap_or_default(),
            os_features: entry.os_features.clone().unwrap_or_default(),
            variant: entry.variant.clone().unwrap_or_default(),
        };
        if let Some(config) = config {
            if platform.os_version.is_empty() {
                platform.os_version = config.os_version.clone().unwrap_or_default();
            }
            if platform.os_features.is_empty() {
                platform.os_features = config.os_features.clone().unwrap_or_default();
            }
            if platform.variant.is_empty() {
                platform.variant = config.variant.clone().unwrap_or_default();
            }
        }
        platform
    }

    pub fn from_config(config: &ImageConfig) -> Self {
        Self {
            arch: config.architecture.clone(),
            os: config.os.clone(),
            os_version: config.os_version.clone().unwrap_or_default(),
            os_features: config.os_features.clone().unwrap_or_default(),
            variant: config.variant.clone().unwrap_or_default(),
        }
    }

    /// Whether a list entry leaves out fields that filtering and indexing need
    pub fn needs_backfill(entry: &manifest::Platform) -> bool {
        let windows = entry.os == "windows"
            && (entry.os_version.as_deref().unwrap_or_default().is_empty()
                || entry.os_features.as_ref().map_or(true, |f| f.is_empty()));
        let arm = entry.architecture == "arm" && entry.variant.as_deref().unwrap_or_default().is_empty();
        windows || arm
    }

    pub fn to_manifest_platform(&self) -> manifest::Platform {
        fn non_empty(s: &str) -> Option<String> {
            (!s.is_empty()).then(|| s.to_string())
        }
        manifest::Platform {
            architecture: self.arch.clone(),
            os: self.os.clone(),
            os_version: non_empty(&self.os_version),
            os_features: (!self.os_features.is_empty()).then(|| self.os_features.clone()),
            variant: non_empty(&self.variant),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)?;
        if !self.variant.is_empty() {
            write!(f, "/{}", self.variant)?;
        }
        if !self.os_version.is_empty() {
            write!(f, " ({})", self.os_version)?;
        }
        Ok(())
    }
}

/// Allow-lists for arch, os and variant; an empty list allows everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    pub arch: HashSet<String>,
    pub os: HashSet<String>,
    pub variant: HashSet<String>,
}

impl FilterSet {
    pub fn new<I, S>(arch: I, os: I, variant: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let collect = |values: I| -> HashSet<String> {
            values
                .into_iter()
                .map(Into::into)
                .filter(|v: &String| !v.is_empty())
                .collect()
        };
        Self {
            arch: collect(arch),
            os: collect(os),
            variant: collect(variant),
        }
    }

    pub fn allow(&self, arch: &str, os: &str, variant: &str) -> bool {
        fn allows(set: &HashSet<String>, value: &str) -> bool {
            set.is_empty() || set.contains(value)
        }
        allows(&self.arch, arch) && allows(&self.os, os) && allows(&self.variant, variant)
    }

    pub fn allow_platform(&self, platform: &Platform) -> bool {
        self.allow(&platform.arch, &platform.os, &platform.variant)
    }
}

/// One recorded platform variant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub arch: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default)]
    pub variant: String,
    pub media_type: String,
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub config: String,
    pub manifest: String,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub annotations: std::collections::BTreeMap<String, String>,
}

impl ImageSpec {
    pub fn new(platform: &Platform, media_type: &str, manifest_digest: &str) -> Self {
        Self {
            arch: platform.arch.clone(),
            os: platform.os.clone(),
            os_version: platform.os_version.clone(),
            os_features: platform.os_features.clone(),
            variant: platform.variant.clone(),
            media_type: media_type.to_string(),
            manifest: manifest_digest.to_string(),
            ..Default::default()
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            arch: self.arch.clone(),
            os: self.os.clone(),
            os_version: self.os_version.clone(),
            os_features: self.os_features.clone(),
            variant: self.variant.clone(),
        }
    }

    pub fn is_attestation(&self) -> bool {
        self.annotations
            .contains_key(crate::constants::annotation::REFERENCE_DIGEST)
    }
}

/// One logical multi-arch image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub source: String,
    pub tag: String,
    #[serde(default)]
    pub arch_list: Vec<String>,
    #[serde(default)]
    pub os_list: Vec<String>,
    #[serde(default)]
    pub images: Vec<ImageSpec>,
}

impl Image {
    pub fn new(source: &str, tag: &str) -> Self {
        Self {
            source: source.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    pub fn push(&mut self, spec: ImageSpec) {
        self.images.push(spec);
        self.refresh_lists();
    }

    fn refresh_lists(&mut self) {
        // attestation entries carry arch "unknown" and are left out
        let platforms = self.images.iter().filter(|s| !s.is_attestation());
        let mut arch = BTreeSet::new();
        let mut os = BTreeSet::new();
        for spec in platforms {
            arch.insert(spec.arch.clone());
            os.insert(spec.os.clone());
        }
        self.arch_list = arch.into_iter().collect();
        self.os_list = os.into_iter().collect();
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn spec(&self, digest: &str) -> Option<&ImageSpec> {
        self.images.iter().find(|s| s.manifest == digest)
    }
}

/// Archive index: every image stored in one archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    pub list: Vec<Image>,
    pub version: String,
    #[serde(rename = "time")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip)]
    digests: HashSet<String>,
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

impl Index {
    pub fn new() -> Self {
        Self {
            list: Vec::new(),
            version: INDEX_VERSION.to_string(),
            created_at: chrono::Utc::now(),
            digests: HashSet::new(),
        }
    }

    /// Parse a stored index and check its version can be read
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let mut index: Index =
            serde_json::from_slice(raw).context("Failed to parse archive index")?;
        check_version(&index.version)?;
        index.digests = index
            .list
            .iter()
            .flat_map(|image| image.images.iter().map(|s| s.manifest.clone()))
            .collect();
        Ok(index)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("Failed to serialize archive index")
    }

    pub fn has_digest(&self, digest: &str) -> bool {
        self.digests.contains(digest)
    }

    /// Record `image`. Specs whose manifest digest is already indexed are
    /// dropped; the rest join an existing entry for the same source and tag
    /// or form a new entry. Returns whether anything was added.
    pub fn append(&mut self, image: Image) -> bool {
        let fresh: Vec<ImageSpec> = image
            .images
            .iter()
            .filter(|s| !self.digests.contains(&s.manifest))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return false;
        }

        for spec in &fresh {
            self.digests.insert(spec.manifest.clone());
        }

        match self
            .list
            .iter_mut()
            .find(|i| i.source == image.source && i.tag == image.tag)
        {
            Some(existing) => {
                for spec in fresh {
                    existing.push(spec);
                }
            }
            None => {
                let mut entry = Image::new(&image.source, &image.tag);
                for spec in fresh {
                    entry.push(spec);
                }
                self.list.push(entry);
            }
        }
        true
    }

    /// The recorded spec for a manifest digest
    pub fn spec(&self, digest: &str) -> Option<&ImageSpec> {
        if !self.has_digest(digest) {
            return None;
        }
        self.list.iter().find_map(|image| image.spec(digest))
    }

    /// Stamp the index with this implementation's version and the current time
    pub fn touch(&mut self) {
        self.version = INDEX_VERSION.to_string();
        self.created_at = chrono::Utc::now();
    }
}

/// `vMAJOR.MINOR.PATCH` → numeric triple
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.strip_prefix('v')?.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    // tolerate pre-release suffixes such as `v1.2.0-rc1`
    let patch = parts.next()?.split(['-', '+']).next()?.parse().ok()?;
    Some((major, minor, patch))
}

/// Reject unreadable or too-old index versions; newer ones are accepted
pub fn check_version(version: &str) -> Result<()> {
    let stored =
        parse_version(version).ok_or_else(|| Error::IncompatibleArchive(version.to_string()))?;
    let minimum = parse_version(MIN_INDEX_VERSION)
        .ok_or_else(|| Error::IncompatibleArchive(MIN_INDEX_VERSION.to_string()))?;
    if stored < minimum {
        return Err(Error::IncompatibleArchive(version.to_string()).into());
    }
    Ok(())
}
