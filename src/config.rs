use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    #[serde(default = "default_watch_dir")]
    pub watch_dir: PathBuf,
    #[serde(default)]
    pub extra_dir: Option<PathBuf>,
    /// Search root for closest-match image reuse. Defaults to the output
    /// root when unset.
    #[serde(default)]
    pub sibling_root: Option<PathBuf>,
    #[serde(default = "default_cdn_base")]
    pub cdn_base: String,
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            watch_dir: default_watch_dir(),
            extra_dir: None,
            sibling_root: None,
            cdn_base: default_cdn_base(),
            poll_secs: default_poll_secs(),
            workers: default_workers(),
        }
    }
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn sibling_root(&self) -> &PathBuf {
        self.sibling_root.as_ref().unwrap_or(&self.output_root)
    }
}

fn default_output_root() -> PathBuf {
    PathBuf::from("output")
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from("inbox")
}

fn default_cdn_base() -> String {
    "https://shared.fastly.steamstatic.com".to_string()
}

fn default_poll_secs() -> u64 {
    5
}

fn default_workers() -> usize {
    4
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("statsmith"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.output_root, PathBuf::from("output"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.poll_secs, 5);
        assert!(config.cdn_base.starts_with("https://"));
    }

    #[test]
    fn sibling_root_falls_back_to_output_root() {
        let mut config = AppConfig::default();
        assert_eq!(config.sibling_root(), &PathBuf::from("output"));
        config.sibling_root = Some(PathBuf::from("elsewhere"));
        assert_eq!(config.sibling_root(), &PathBuf::from("elsewhere"));
    }
}
