/// Manifest and config media types
pub mod media_type {
    /// Docker manifest list (fat manifest)
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Docker schema2 image manifest
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

    /// Docker schema1 image manifest (legacy)
    pub const DOCKER_MANIFEST_SCHEMA1: &str =
        "application/vnd.docker.distribution.manifest.v1+json";

    /// Signed Docker schema1 image manifest (legacy)
    pub const DOCKER_MANIFEST_SCHEMA1_SIGNED: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";

    /// OCI image index
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

    /// OCI image manifest
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

    /// OCI layout header
    pub const OCI_LAYOUT_HEADER: &str = "application/vnd.oci.layout.header.v1+json";

    /// Every manifest type a registry may hand back for a reference
    pub const ACCEPTED: &[&str] = &[
        DOCKER_MANIFEST_LIST,
        OCI_INDEX,
        DOCKER_MANIFEST,
        OCI_MANIFEST,
        DOCKER_MANIFEST_SCHEMA1_SIGNED,
        DOCKER_MANIFEST_SCHEMA1,
    ];
}

/// Annotation keys
pub mod annotation {
    /// Marks an index entry as an attestation for the referenced digest
    pub const REFERENCE_DIGEST: &str = "vnd.docker.reference.digest";

    /// Kind of reference an attestation entry carries
    pub const REFERENCE_TYPE: &str = "vnd.docker.reference.type";

    /// Tag recorded in an OCI layout index
    pub const REF_NAME: &str = "org.opencontainers.image.ref.name";
}

/// Reference defaults applied to registry kinds
pub mod reference {
    /// Registry used when a reference names none
    pub const DEFAULT_REGISTRY: &str = "docker.io";

    /// Project used for single-component Docker Hub names
    pub const DEFAULT_PROJECT: &str = "library";

    /// Default container image tag
    pub const DEFAULT_TAG: &str = "latest";
}

/// Part splitting limits
pub mod part {
    /// Smallest allowed part size (1 MiB)
    pub const MIN_SIZE: u64 = 1 << 20;

    /// Largest allowed part size (100 GiB)
    pub const MAX_SIZE: u64 = 100 << 30;

    /// Highest number of parts one logical file may span
    pub const MAX_PARTS: u64 = 65_535;

    /// Suffix inserted between a logical name and its part number
    pub const SUFFIX: &str = ".part";
}

/// Archive container layout
pub mod archive {
    /// Reserved entry holding the serialized index
    pub const INDEX_ENTRY: &str = "index.json";

    /// Directory holding one entry per platform variant
    pub const IMAGES_DIR: &str = "images";

    /// Index version written by this implementation
    pub const INDEX_VERSION: &str = "v1.1.0";

    /// Oldest index version that can still be read
    pub const MIN_INDEX_VERSION: &str = "v1.0.0";
}

/// Worker pool sizing
pub mod jobs {
    /// Default number of workers
    pub const DEFAULT: usize = 1;

    /// Upper bound on concurrent workers
    pub const MAX: usize = 20;
}
