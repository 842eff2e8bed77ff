//! In-memory registry used by unit tests.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::layout::Layout;
use super::{CopyOptions, RawManifest, RegistryClient};
use crate::constants::media_type;
use crate::error::Error;
use crate::manifest::{self, Manifest};
use crate::reference::ImageReference;

#[derive(Default)]
pub struct FakeRegistry {
    manifests: Mutex<HashMap<String, RawManifest>>,
    configs: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    copies: Mutex<Vec<(String, String)>>,
    pushes: Mutex<Vec<String>>,
    config_requests: Mutex<Vec<String>>,
    inspections: AtomicUsize,
}

pub struct Arch<'a> {
    pub os: &'a str,
    pub arch: &'a str,
    pub variant: &'a str,
}

pub const fn arch<'a>(os: &'a str, arch: &'a str, variant: &'a str) -> Arch<'a> {
    Arch { os, arch, variant }
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, key: String, data: Vec<u8>, media_type: &str) -> String {
        let digest = manifest::digest(&data);
        self.manifests.lock().unwrap().insert(
            key,
            RawManifest {
                data,
                media_type: media_type.to_string(),
                digest: digest.clone(),
            },
        );
        digest
    }

    fn repository(reference: &str) -> String {
        let parsed = ImageReference::parse(reference).unwrap();
        format!("{}/{}", parsed.registry, parsed.repository())
    }

    /// Register a single-platform schema2 image; returns its digest
    pub fn add_image(&self, reference: &str, platform: Arch) -> String {
        let digest = self.add_child(&Self::repository(reference), &platform);
        let raw = self.get(&format!("{}@{}", Self::repository(reference), digest));
        let key = ImageReference::parse(reference).unwrap().to_string();
        self.manifests.lock().unwrap().insert(key, raw);
        digest
    }

    /// Images in different repositories never share content
    fn add_child(&self, repository: &str, platform: &Arch) -> String {
        let os_version = if platform.os == "windows" {
            r#","os.version":"10.0.17763.1""#
        } else {
            ""
        };
        let config = format!(
            r#"{{"architecture":"{}","os":"{}","variant":"{}"{}}}"#,
            platform.arch, platform.os, platform.variant, os_version
        );
        let config_digest = manifest::digest(config.as_bytes());
        let body = format!(
            r#"{{"schemaVersion":2,"mediaType":"{}","config":{{"mediaType":"application/vnd.docker.container.image.v1+json","digest":"{}","size":{}}},"layers":[{{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","digest":"sha256:{}","size":1}}]}}"#,
            media_type::DOCKER_MANIFEST,
            config_digest,
            config.len(),
            sha256::digest(format!(
                "{}/{}/{}/{}",
                repository, platform.os, platform.arch, platform.variant
            )),
        );
        let digest = manifest::digest(body.as_bytes());
        self.store(
            format!("{}@{}", repository, digest),
            body.into_bytes(),
            media_type::DOCKER_MANIFEST,
        );
        self.configs
            .lock()
            .unwrap()
            .insert(digest.clone(), config.into_bytes());
        digest
    }

    /// Register a Docker manifest list. Entries never carry os.version, so
    /// Windows entries need their config. Returns child digests in list order.
    pub fn add_list(&self, reference: &str, platforms: &[Arch]) -> Vec<String> {
        self.add_index(reference, media_type::DOCKER_MANIFEST_LIST, platforms, false)
    }

    /// Register a list or index, optionally with one attestation entry per
    /// platform
    pub fn add_index(
        &self,
        reference: &str,
        list_type: &str,
        platforms: &[Arch],
        attestations: bool,
    ) -> Vec<String> {
        let repository = Self::repository(reference);
        let mut entries = Vec::new();
        let mut digests = Vec::new();
        for platform in platforms {
            let digest = self.add_child(&repository, platform);
            let mut fields = format!(r#""architecture":"{}","os":"{}""#, platform.arch, platform.os);
            if !platform.variant.is_empty() {
                fields.push_str(&format!(r#","variant":"{}""#, platform.variant));
            }
            entries.push(format!(
                r#"{{"mediaType":"{}","digest":"{}","size":100,"platform":{{{}}}}}"#,
                media_type::DOCKER_MANIFEST,
                digest,
                fields
            ));
            digests.push(digest.clone());
            if attestations {
                let attestation =
                    self.add_child(&repository, &arch("unknown", "unknown", platform.arch));
                entries.push(format!(
                    r#"{{"mediaType":"{}","digest":"{}","size":100,"platform":{{"architecture":"unknown","os":"unknown"}},"annotations":{{"vnd.docker.reference.digest":"{}","vnd.docker.reference.type":"attestation-manifest"}}}}"#,
                    media_type::OCI_MANIFEST,
                    attestation,
                    digest
                ));
                digests.push(attestation);
            }
        }
        let body = format!(
            r#"{{"schemaVersion":2,"mediaType":"{}","manifests":[{}]}}"#,
            list_type,
            entries.join(",")
        );
        let key = ImageReference::parse(reference).unwrap().to_string();
        let list_digest = self.store(key, body.clone().into_bytes(), list_type);
        self.store(
            format!("{}@{}", repository, list_digest),
            body.into_bytes(),
            list_type,
        );
        digests
    }

    /// Register a schema1 image; returns the digest the registry reports
    pub fn add_schema1(&self, reference: &str, architecture: &str) -> String {
        let body = format!(
            r#"{{"schemaVersion":1,"name":"legacy","tag":"v1","architecture":"{}","fsLayers":[{{"blobSum":"sha256:{}"}}]}}"#,
            architecture,
            sha256::digest("legacy layer")
        );
        let key = ImageReference::parse(reference).unwrap().to_string();
        self.store(key, body.into_bytes(), media_type::DOCKER_MANIFEST_SCHEMA1)
    }

    /// Make every copy whose source is pinned to `digest` fail
    pub fn fail_copy(&self, digest: &str) {
        self.failing.lock().unwrap().insert(digest.to_string());
    }

    /// Make every manifest request to `registry` fail as if it were down
    pub fn make_unreachable(&self, registry: &str) {
        self.unreachable.lock().unwrap().insert(registry.to_string());
    }

    pub fn has(&self, reference: &str) -> bool {
        self.manifests.lock().unwrap().contains_key(reference)
    }

    pub fn get(&self, reference: &str) -> RawManifest {
        self.manifests.lock().unwrap()[reference].clone()
    }

    pub fn copies(&self) -> Vec<(String, String)> {
        self.copies.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.pushes.lock().unwrap().clone()
    }

    /// References whose config was fetched, in request order
    pub fn config_requests(&self) -> Vec<String> {
        self.config_requests.lock().unwrap().clone()
    }

    pub fn inspections(&self) -> usize {
        self.inspections.load(Ordering::SeqCst)
    }

    fn lookup(&self, reference: &ImageReference) -> Result<RawManifest> {
        if self.unreachable.lock().unwrap().contains(&reference.registry) {
            bail!("connection refused: {}", reference.registry);
        }
        self.manifests
            .lock()
            .unwrap()
            .get(&reference.to_string())
            .cloned()
            .ok_or_else(|| Error::ManifestUnknown(reference.to_string()).into())
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn inspect_manifest(&self, reference: &ImageReference) -> Result<RawManifest> {
        self.inspections.fetch_add(1, Ordering::SeqCst);
        if reference.kind.is_local() {
            return Layout::open(reference)?.read_manifest(reference.digest.as_deref());
        }
        self.lookup(reference)
    }

    async fn inspect_config(&self, reference: &ImageReference) -> Result<Vec<u8>> {
        self.config_requests.lock().unwrap().push(reference.to_string());
        let raw = self.lookup(reference)?;
        self.configs
            .lock()
            .unwrap()
            .get(&raw.digest)
            .cloned()
            .with_context(|| format!("no config for {}", reference))
    }

    async fn copy(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        options: &CopyOptions,
    ) -> Result<()> {
        if let Some(digest) = &source.digest {
            if self.failing.lock().unwrap().contains(digest) {
                bail!("blob upload failed for {}", digest);
            }
        }
        let mut raw = if source.kind.is_local() {
            Layout::open(source)?.read_manifest(source.digest.as_deref())?
        } else {
            self.lookup(source)?
        };
        if let Some(forced) = &options.force_media_type {
            if matches!(Manifest::parse(&raw.data, &raw.media_type)?, Manifest::Schema1(_)) {
                // conversion yields a new manifest with a new digest
                let mut data = raw.data.clone();
                data.extend_from_slice(b" ");
                raw = RawManifest {
                    digest: manifest::digest(&data),
                    data,
                    media_type: forced.clone(),
                };
            }
        }
        self.copies
            .lock()
            .unwrap()
            .push((source.to_string(), destination.to_string()));
        if destination.kind.is_local() {
            Layout::open(destination)?.write_manifest(&raw.data, &raw.media_type)?;
        } else {
            self.manifests
                .lock()
                .unwrap()
                .insert(destination.to_string(), raw);
        }
        Ok(())
    }

    async fn push_manifest(
        &self,
        destination: &ImageReference,
        data: &[u8],
        media_type: &str,
    ) -> Result<String> {
        self.pushes.lock().unwrap().push(destination.to_string());
        Ok(self.store(destination.to_string(), data.to_vec(), media_type))
    }
}
