use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Path segment in front of the peer id: `/<ws_prefix>/<peer_id>`
    #[serde(default = "default_ws_prefix")]
    pub ws_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetsConfig {
    /// Directory mounted at /static
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    /// Entry page served at /, relative to static_dir
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:10500".to_string()
}

fn default_ws_prefix() -> String {
    "ws".to_string()
}

fn default_cert_path() -> PathBuf {
    get_sigrelay_dir().join("cert.crt")
}

fn default_key_path() -> PathBuf {
    get_sigrelay_dir().join("cert.key")
}

fn default_static_dir() -> PathBuf {
    get_sigrelay_dir().join("static")
}

fn default_index_file() -> String {
    "index-local.html".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ws_prefix: default_ws_prefix(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            static_dir: default_static_dir(),
            index_file: default_index_file(),
        }
    }
}

impl Config {
    /// Load config from ~/.sigrelay/config.toml, or create default if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from a specific file, creating it with defaults if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    /// Path to the entry page
    pub fn index_path(&self) -> PathBuf {
        self.assets.static_dir.join(&self.assets.index_file)
    }
}

impl TlsConfig {
    /// Fail unless both the certificate and the key are present
    pub fn ensure_present(&self) -> Result<()> {
        if self.cert_path.exists() && self.key_path.exists() {
            return Ok(());
        }
        anyhow::bail!(
            "SSL certificates not found! Provide a certificate and key at:\n  - {}\n  - {}",
            self.cert_path.display(),
            self.key_path.display()
        )
    }
}

/// Get the sigrelay directory (~/.sigrelay)
pub fn get_sigrelay_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sigrelay")
}

/// Get the config file path (~/.sigrelay/config.toml)
pub fn get_config_path() -> PathBuf {
    get_sigrelay_dir().join("config.toml")
}
