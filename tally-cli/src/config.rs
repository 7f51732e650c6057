use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tally_ingest::DuplicatePolicy;
use tally_sync::SyncConfig;

use crate::state::ensure_tally_home;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub parser: ParserSection,
    pub sync: SyncSection,
    pub ingest: IngestSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserSection {
    /// last-wins | first-wins | require-consistent
    pub duplicate_policy: DuplicatePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    /// IANA timezone of local timestamps in SMS exports
    pub timezone: String,
    /// Account id assigned to transactions recorded from SMS
    pub default_account: Option<String>,
}

impl Default for SyncSection {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        Self {
            retry_base_ms: defaults.retry_base.as_millis() as u64,
            retry_max_ms: defaults.retry_max.as_millis() as u64,
            max_retries: defaults.max_retries,
        }
    }
}

impl SyncSection {
    pub fn to_sync_config(&self) -> SyncConfig {
        SyncConfig {
            retry_base: Duration::from_millis(self.retry_base_ms),
            retry_max: Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms)),
            max_retries: self.max_retries,
        }
    }
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            timezone: "Asia/Kolkata".to_string(),
            default_account: None,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    Ok(ensure_tally_home()?.join("config.toml"))
}

pub fn load_config() -> Result<Config> {
    let p = config_path()?;
    if !p.exists() {
        return Ok(Config::default());
    }
    let s = fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?;
    toml::from_str(&s).context("parse config.toml")
}

pub fn save_config(cfg: &Config) -> Result<()> {
    let p = config_path()?;
    let s = toml::to_string_pretty(cfg).context("serialize config")?;
    fs::write(&p, s).with_context(|| format!("write {}", p.display()))?;
    Ok(())
}

pub fn init_config() -> Result<()> {
    let p = config_path()?;
    if p.exists() {
        println!("Config already exists: {}", p.display());
        return Ok(());
    }
    save_config(&Config::default())?;
    println!("Wrote {}", p.display());
    Ok(())
}
