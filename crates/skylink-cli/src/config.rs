//! Configuration file handling for the Skylink CLI.

use anyhow::Context;
use skylink_core::ClientConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// TOML persistence for [`ClientConfig`]
pub trait ConfigFile: Sized {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self>;

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()>;

    /// Load `path` if it exists, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self>;
}

impl ConfigFile for ClientConfig {
    fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("no configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

/// Get default config path
#[must_use]
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("skylink/config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = ClientConfig::default();
        config.relay.host = "relay.example.net".into();
        config.auth.secret = "s3cret".into();
        config.transport.primary = "rpc".into();
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded.relay.host, "relay.example.net");
        assert_eq!(loaded.auth.secret, "s3cret");
        assert_eq!(loaded.transport.primary, "rpc");
        assert_eq!(loaded.switch.failure_threshold, config.switch.failure_threshold);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[relay]\nhost = \"edge.example.net\"\n\n[auth]\ntype = \"keycloak\"\n\n[auth.keycloak]\nserver_url = \"https://id.example.net\"\nrealm = \"skylink\"\nclient_id = \"cli\"\n",
        )
        .unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.relay.host, "edge.example.net");
        assert_eq!(config.relay.ports.datagram, 9090);
        assert_eq!(config.auth.auth_type, "keycloak");
        assert_eq!(config.auth.keycloak.realm, "skylink");
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(ClientConfig::load(&path).is_err());

        let config = ClientConfig::load_or_default(&path).unwrap();
        assert_eq!(config.relay.host, "relay.local");
        assert!(!path.exists());
    }

    #[test]
    fn test_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[relay\nhost = 1").unwrap();
        let err = ClientConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }
}
