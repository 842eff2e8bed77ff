//! Image endpoint references.
//!
//! A reference names either a repository in a registry (optionally through
//! the local daemon) or an image stored in a directory on disk:
//!
//! - `nginx`, `docker.io/library/nginx:1.25`, `docker://localhost:5000/app@sha256:...`
//! - `docker-daemon:nginx:latest`
//! - `oci:/var/lib/images/nginx` (OCI image layout)
//! - `dir:/tmp/nginx` (plain directory: `manifest.json` plus blobs)

use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::constants::reference::{DEFAULT_PROJECT, DEFAULT_REGISTRY, DEFAULT_TAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Registry,
    Daemon,
    Directory,
    OciLayout,
}

impl Kind {
    pub fn is_registry(self) -> bool {
        matches!(self, Kind::Registry | Kind::Daemon)
    }

    pub fn is_local(self) -> bool {
        matches!(self, Kind::Directory | Kind::OciLayout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub kind: Kind,
    pub registry: String,
    pub project: String,
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
    pub directory: Option<PathBuf>,
}

impl ImageReference {
    /// Parse a reference, applying the built-in registry defaults.
    pub fn parse(reference: &str) -> Result<Self> {
        Self::parse_with_defaults(reference, DEFAULT_REGISTRY, DEFAULT_PROJECT)
    }

    /// Parse a reference, filling in `registry` and `project` when the
    /// reference is a registry kind that omits them.
    pub fn parse_with_defaults(reference: &str, registry: &str, project: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            bail!("Empty image reference");
        }

        if let Some(path) = reference.strip_prefix("oci:") {
            return Self::local(Kind::OciLayout, path);
        }
        if let Some(path) = reference.strip_prefix("dir:") {
            return Self::local(Kind::Directory, path);
        }
        if let Some(rest) = reference.strip_prefix("docker-daemon:") {
            let mut parsed = Self::remote(rest, registry, project)?;
            parsed.kind = Kind::Daemon;
            return Ok(parsed);
        }

        let rest = reference.strip_prefix("docker://").unwrap_or(reference);
        Self::remote(rest, registry, project)
    }

    /// Reference to an image stored at `path` on disk.
    pub fn local(kind: Kind, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !kind.is_local() {
            bail!("{:?} is not a local reference kind", kind);
        }
        if path.as_os_str().is_empty() {
            bail!("Missing directory in local image reference");
        }
        Ok(Self {
            kind,
            registry: String::new(),
            project: String::new(),
            name: String::new(),
            tag: None,
            digest: None,
            directory: Some(path.to_path_buf()),
        })
    }

    fn remote(reference: &str, default_registry: &str, default_project: &str) -> Result<Self> {
        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => {
                if !digest.contains(':') {
                    bail!("Invalid digest in image reference: {}", reference);
                }
                (rest, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
        let (path, tag) = match rest[last_slash..].find(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], Some(rest[split + 1..].to_string()))
            }
            None => (rest, None),
        };
        if matches!(&tag, Some(t) if t.is_empty()) {
            bail!("Empty tag in image reference: {}", reference);
        }

        let mut components: Vec<&str> = path.split('/').collect();
        if components.iter().any(|c| c.is_empty()) {
            bail!("Invalid image reference: {}", reference);
        }

        let registry = if components.len() > 1 && looks_like_registry(components[0]) {
            components.remove(0).to_string()
        } else {
            default_registry.to_string()
        };

        let (project, name) = if components.len() == 1 {
            (default_project.to_string(), components[0].to_string())
        } else {
            (components[0].to_string(), components[1..].join("/"))
        };

        if name.chars().any(|c| c.is_ascii_uppercase()) {
            bail!("Repository name must be lowercase: {}", reference);
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            kind: Kind::Registry,
            registry,
            project,
            name,
            tag,
            digest,
            directory: None,
        })
    }

    /// `project/name`
    pub fn repository(&self) -> String {
        if self.project.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.project, self.name)
        }
    }

    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Tag the reference addresses. A reference pinned to a digest without
    /// a tag has none; one with neither means `latest`.
    pub fn tag_name(&self) -> Option<&str> {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => Some(tag),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_TAG),
        }
    }

    /// Same repository, pinned to `digest`.
    pub fn with_digest(&self, digest: &str) -> Self {
        let mut reference = self.clone();
        reference.digest = Some(digest.to_string());
        reference
    }

    /// Same repository under a different registry.
    pub fn with_registry(&self, registry: &str) -> Self {
        let mut reference = self.clone();
        reference.registry = registry.to_string();
        reference
    }

    /// Same repository under a different project.
    pub fn with_project(&self, project: &str) -> Self {
        let mut reference = self.clone();
        reference.project = project.to_string();
        reference
    }

    /// Registry reference without a digest pin, addressing the tag. `None`
    /// for a digest-only reference.
    pub fn tagged(&self) -> Option<Self> {
        let tag = self.tag_name()?.to_string();
        let mut reference = self.clone();
        reference.digest = None;
        reference.tag = Some(tag);
        Some(reference)
    }

    pub fn directory(&self) -> Result<&Path> {
        self.directory
            .as_deref()
            .with_context(|| format!("{} does not name a directory", self))
    }
}

fn looks_like_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

impl FromStr for ImageReference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::OciLayout | Kind::Directory => {
                let prefix = if self.kind == Kind::OciLayout { "oci" } else { "dir" };
                let dir = self.directory.as_deref().unwrap_or(Path::new(""));
                write!(f, "{}:{}", prefix, dir.display())
            }
            Kind::Registry | Kind::Daemon => {
                if self.kind == Kind::Daemon {
                    write!(f, "docker-daemon:")?;
                }
                write!(f, "{}/{}", self.registry, self.repository())?;
                match &self.digest {
                    Some(digest) => write!(f, "@{}", digest),
                    None => write!(f, ":{}", self.tag()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let reference = ImageReference::parse("nginx").unwrap();
        assert_eq!(reference.kind, Kind::Registry);
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.project, "library");
        assert_eq!(reference.name, "nginx");
        assert_eq!(reference.tag(), "latest");
        assert_eq!(reference.to_string(), "docker.io/library/nginx:latest");
    }

    #[test]
    fn test_parse_with_port_and_tag() {
        let reference = ImageReference::parse("localhost:5000/myapp:v1.0").unwrap();
        assert_eq!(reference.registry, "localhost:5000");
        assert_eq!(reference.project, "library");
        assert_eq!(reference.name, "myapp");
        assert_eq!(reference.tag(), "v1.0");
    }

    #[test]
    fn test_parse_nested_repository() {
        let reference =
            ImageReference::parse("docker://quay.io/org/team/tool:2.1").unwrap();
        assert_eq!(reference.registry, "quay.io");
        assert_eq!(reference.project, "org");
        assert_eq!(reference.name, "team/tool");
        assert_eq!(reference.repository(), "org/team/tool");
    }

    #[test]
    fn test_parse_digest() {
        let digest = "sha256:0000000000000000000000000000000000000000000000000000000000000001";
        let reference = ImageReference::parse(&format!("rancher/shell@{}", digest)).unwrap();
        assert_eq!(reference.digest.as_deref(), Some(digest));
        assert!(reference.tag.is_none());
        assert_eq!(
            reference.to_string(),
            format!("docker.io/rancher/shell@{}", digest)
        );
    }

    #[test]
    fn test_parse_daemon() {
        let reference = ImageReference::parse("docker-daemon:busybox:1.36").unwrap();
        assert_eq!(reference.kind, Kind::Daemon);
        assert_eq!(reference.tag(), "1.36");
        assert_eq!(
            reference.to_string(),
            "docker-daemon:docker.io/library/busybox:1.36"
        );
    }

    #[test]
    fn test_parse_local_kinds() {
        let oci = ImageReference::parse("oci:/tmp/layout").unwrap();
        assert_eq!(oci.kind, Kind::OciLayout);
        assert_eq!(oci.directory().unwrap(), Path::new("/tmp/layout"));
        assert!(oci.registry.is_empty());
        assert_eq!(oci.to_string(), "oci:/tmp/layout");

        let dir = ImageReference::parse("dir:/tmp/plain").unwrap();
        assert_eq!(dir.kind, Kind::Directory);
        assert!(ImageReference::parse("oci:").is_err());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
        assert!(ImageReference::parse("docker.io//nginx").is_err());
        assert!(ImageReference::parse("Nginx").is_err());
        assert!(ImageReference::parse("nginx@abc").is_err());
    }

    #[test]
    fn test_rewrite_destination() {
        let source = ImageReference::parse("docker.io/rancher/rancher:v2.9.0").unwrap();
        let destination = source.with_registry("harbor.local").with_project("mirror");
        assert_eq!(destination.to_string(), "harbor.local/mirror/rancher:v2.9.0");
        let pinned = destination.with_digest("sha256:abc");
        assert_eq!(pinned.to_string(), "harbor.local/mirror/rancher@sha256:abc");
        assert_eq!(
            pinned.tagged().unwrap().to_string(),
            "harbor.local/mirror/rancher:v2.9.0"
        );
    }

    #[test]
    fn test_digest_only_reference_has_no_tag() {
        let digest = "sha256:0000000000000000000000000000000000000000000000000000000000000001";
        let pinned = ImageReference::parse(&format!("nginx@{}", digest)).unwrap();
        assert_eq!(pinned.tag_name(), None);
        assert!(pinned.tagged().is_none());

        let bare = ImageReference::parse("nginx").unwrap();
        assert_eq!(bare.tag_name(), Some("latest"));
        assert_eq!(bare.tagged().unwrap().to_string(), "docker.io/library/nginx:latest");

        let both = ImageReference::parse(&format!("nginx:1.25@{}", digest)).unwrap();
        assert_eq!(both.tag_name(), Some("1.25"));
    }
}
