use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use gatelink_core::UserKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "gatelink-client.toml";

/// Everything the client needs to start a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Real master server (host:port), reachable by TCP and UDP
    pub master_addr: String,
    /// Relay HTTP base URL
    pub server_url: String,
    /// Access key (16-character base32); empty means not configured
    #[serde(default)]
    pub user_key: UserKey,
}

impl ClientConfig {
    /// True once the user has pasted in an access key
    pub fn has_key(&self) -> bool {
        !self.user_key.is_zero()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            master_addr: "master.gatelink.net:28004".to_string(),
            server_url: "http://localhost:8080".to_string(),
            user_key: UserKey::default(),
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    ProjectDirs::from("net", "gatelink", "Gatelink")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
        .ok_or_else(|| anyhow!("no home directory to hold {CONFIG_FILE_NAME}"))
}

/// Read the config, falling back to defaults when none has been written yet
pub fn load(path: &Path) -> Result<ClientConfig> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ClientConfig::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("cannot read {}", path.display()));
        }
    };

    toml::from_str(&raw).with_context(|| format!("{} is not a valid client config", path.display()))
}

pub fn save(path: &Path, cfg: &ClientConfig, overwrite: bool) -> Result<()> {
    if !overwrite && path.exists() {
        anyhow::bail!("{} already exists; pass --force to replace it", path.display());
    }

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    }

    let raw = toml::to_string_pretty(cfg).context("client config did not serialize")?;
    fs::write(path, raw).with_context(|| format!("cannot write {}", path.display()))
}
