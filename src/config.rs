use crate::errors::*;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "windnf.conf";
pub const DB_FILE: &str = "windnf.db";

/// On-disk configuration, two sections. A missing file is created with
/// defaults on first run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: General,
    pub network: Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct General {
    /// Download backend selector; only the native client is supported.
    pub downloader: String,
    pub db_path: PathBuf,
    pub download_path: PathBuf,
    /// Legacy key, inverted into `network.verify_ssl` when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_ssl_verify: Option<bool>,
}

impl Default for General {
    fn default() -> Self {
        General {
            downloader: "native".to_string(),
            db_path: PathBuf::new(),
            download_path: PathBuf::from("."),
            skip_ssl_verify: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    pub timeout_connect: u64,
    pub timeout_read: u64,
    pub retries: u32,
    pub use_sspi: bool,
    pub verify_ssl: bool,
    pub ca_bundle: String,
    pub proxy_url: String,
}

impl Default for Network {
    fn default() -> Self {
        Network {
            timeout_connect: 10,
            timeout_read: 60,
            retries: 3,
            use_sspi: true,
            verify_ssl: true,
            ca_bundle: String::new(),
            proxy_url: String::new(),
        }
    }
}

impl Config {
    /// Load from the platform config directory, writing a default file on
    /// first run.
    pub fn load() -> Result<Self> {
        let dir = config_dir()?;
        Self::load_from(&dir.join(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = fs::read_to_string(path)?;
            toml::from_str::<Config>(&text)?
        } else {
            warn!("Config file {path:?} not found, writing defaults");
            let config = Config::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, toml::to_string_pretty(&config)?)?;
            config
        };
        config.apply_legacy_keys();
        Ok(config)
    }

    fn apply_legacy_keys(&mut self) {
        if let Some(skip) = self.general.skip_ssl_verify.take() {
            self.network.verify_ssl = !skip;
        }
    }

    /// Database location: configured path, or `windnf.db` next to the config.
    pub fn db_path(&self) -> Result<PathBuf> {
        if self.general.db_path.as_os_str().is_empty() {
            Ok(config_dir()?.join(DB_FILE))
        } else {
            Ok(self.general.db_path.clone())
        }
    }

    pub fn proxy_url(&self) -> Option<&str> {
        non_empty(&self.network.proxy_url)
    }

    pub fn ca_bundle(&self) -> Option<&str> {
        non_empty(&self.network.ca_bundle)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

fn config_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "windnf").ok_or_else(|| {
        Error::InvalidArgument("cannot determine a config directory for this platform".to_string())
    })?;
    Ok(dirs.config_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.general.downloader, "native");
        assert_eq!(config.network.timeout_connect, 10);
        assert_eq!(config.network.timeout_read, 60);
        assert_eq!(config.network.retries, 3);
        assert!(config.network.use_sspi);
        assert!(config.network.verify_ssl);
        assert_eq!(config.proxy_url(), None);
        assert_eq!(config.ca_bundle(), None);
    }

    #[test]
    fn test_parse_sections() {
        let text = r#"
[general]
downloader = "native"
db_path = "C:/data/windnf.db"
download_path = "C:/downloads"

[network]
timeout_connect = 5
timeout_read = 120
retries = 7
use_sspi = false
verify_ssl = true
ca_bundle = "C:/certs/corp.pem"
proxy_url = "http://proxy.corp.example:8080"
"#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.general.db_path, PathBuf::from("C:/data/windnf.db"));
        assert_eq!(config.network.timeout_read, 120);
        assert_eq!(config.network.retries, 7);
        assert!(!config.network.use_sspi);
        assert_eq!(config.ca_bundle(), Some("C:/certs/corp.pem"));
        assert_eq!(config.proxy_url(), Some("http://proxy.corp.example:8080"));
    }

    #[test]
    fn test_missing_sections_fall_back() {
        let config: Config = toml::from_str("[general]\ndownloader = \"native\"\n").unwrap();
        assert_eq!(config.network.retries, 3);
        assert_eq!(config.general.download_path, PathBuf::from("."));
    }

    #[test]
    fn test_legacy_skip_ssl_verify_inverts() {
        let mut config: Config =
            toml::from_str("[general]\nskip_ssl_verify = true\n[network]\nverify_ssl = true\n")
                .unwrap();
        config.apply_legacy_keys();
        assert!(!config.network.verify_ssl);
        assert_eq!(config.general.skip_ssl_verify, None);
    }

    #[test]
    fn test_round_trip_written_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let written = Config::load_from(&path).unwrap();
        assert!(path.exists());
        let reread = Config::load_from(&path).unwrap();
        assert_eq!(written.network.retries, reread.network.retries);
        assert_eq!(written.general.downloader, reread.general.downloader);
    }
}
