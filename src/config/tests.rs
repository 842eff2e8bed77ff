#[cfg(test)]
mod tests {
    use super::super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.default_registry, "docker.io");
        assert_eq!(config.default_project, "library");
        assert_eq!(config.jobs, 1);
        assert!(config.timeout().is_none());
        assert!(config.registries.is_empty());
    }

    #[test]
    fn test_archive_config_default() {
        let archive = ArchiveConfig::default();
        assert_eq!(archive.part_size, 0);
        assert_eq!(archive.compression, Compression::None);
    }

    #[test]
    fn test_workers_clamped() {
        let mut config = Config::default();
        config.jobs = 0;
        assert_eq!(config.workers(), 1);
        config.jobs = 64;
        assert_eq!(config.workers(), 20);
        config.jobs = 7;
        assert_eq!(config.workers(), 7);
    }

    #[test]
    fn test_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
default_registry = "registry.example.com"
jobs = 5
timeout_secs = 600
insecure_registries = ["localhost:5000"]

[archive]
part_size = 1073741824
compression = "gzip"

[registries."registry.example.com"]
username = "admin"
password = "hunter2"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.default_registry, "registry.example.com");
        assert_eq!(config.default_project, "library");
        assert_eq!(config.jobs, 5);
        assert_eq!(config.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.archive.part_size, 1 << 30);
        assert_eq!(config.archive.compression, Compression::Gzip);
        assert_eq!(config.insecure_registries, vec!["localhost:5000"]);
        let auth = &config.registries["registry.example.com"];
        assert_eq!(auth.username.as_deref(), Some("admin"));
    }

    #[test]
    fn test_from_file_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "jobs = [[[").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
