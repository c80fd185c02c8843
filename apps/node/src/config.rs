//! Node configuration management.
//!
//! Configuration is stored as TOML at `$XDG_CONFIG_HOME/syndro/node.toml`,
//! falling back to `~/.config/syndro/node.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use syndro_parallel::{ApprovalMode, CollisionPolicy};
use syndro_transfer::{ParallelConfig, SecretKey};

/// Default data channel port.
pub const DEFAULT_PORT: u16 = 47820;

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Stable identifier sent as the sender id.
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Display name of this node (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Where received files are saved.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Data channel listen port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared token peers present when connecting.
    #[serde(default = "syndro_data_channel::generate_token")]
    pub token: String,

    #[serde(default)]
    pub approval: ApprovalMode,

    #[serde(default)]
    pub collision: CollisionPolicy,

    /// Pre-shared AES-256 key as 64 hex characters. Enables chunk encryption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,

    #[serde(default)]
    pub parallel: ParallelConfig,
}

fn default_device_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Syndro Node".into())
}

fn default_download_dir() -> PathBuf {
    home_dir().join("Downloads").join("Syndro")
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            name: default_name(),
            download_dir: default_download_dir(),
            port: default_port(),
            token: syndro_data_channel::generate_token(),
            approval: ApprovalMode::default(),
            collision: CollisionPolicy::default(),
            psk: None,
            parallel: ParallelConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the default location), creating
    /// it with defaults if missing.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            config.parallel.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            tracing::info!(path = %path.display(), "created default configuration");
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix; the file holds the token and key.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Parses the pre-shared key, if one is configured.
    pub fn secret_key(&self) -> anyhow::Result<Option<SecretKey>> {
        match self.psk.as_deref() {
            Some(hex_key) => Ok(Some(SecretKey::from_hex(hex_key)?)),
            None => Ok(None),
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

/// Returns the configuration file path.
pub fn config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".config"));
    base.join("syndro").join("node.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.name.is_empty());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.token.len(), 32);
        assert_eq!(config.approval, ApprovalMode::AutoAccept);
        assert!(config.psk.is_none());
        assert!(config.parallel.enabled);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = Config {
            name: "Desk".into(),
            port: 9000,
            approval: ApprovalMode::Manual,
            psk: Some("ab".repeat(32)),
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.name, "Desk");
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.approval, ApprovalMode::Manual);
        assert_eq!(parsed.device_id, config.device_id);
        assert_eq!(parsed.token, config.token);
        assert_eq!(parsed.parallel, config.parallel);
        assert!(parsed.secret_key().unwrap().is_some());
    }

    #[test]
    fn config_partial_toml() {
        let toml_str = r#"
name = "Laptop"
approval = "manual"

[parallel]
connections = 2
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.name, "Laptop");
        assert_eq!(config.approval, ApprovalMode::Manual);
        assert_eq!(config.parallel.connections, 2);
        assert_eq!(
            config.parallel.chunk_size,
            ParallelConfig::default().chunk_size
        );
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn bad_psk_is_an_error() {
        let config = Config {
            psk: Some("not-hex".into()),
            ..Config::default()
        };
        assert!(config.secret_key().is_err());
    }

    #[test]
    fn load_creates_then_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("node.toml");

        let created = Config::load(Some(&path)).unwrap();
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.device_id, created.device_id);
        assert_eq!(loaded.token, created.token);
    }

    #[test]
    fn config_path_ends_with_node_toml() {
        let path = config_path();
        assert!(path.ends_with("syndro/node.toml"));
    }
}
