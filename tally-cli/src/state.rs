use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tally_sync::{CacheMode, InMemoryStore, StoreSnapshot};
use tracing::debug;

/// `$TALLY_HOME`, or `~/.tally`.
pub fn tally_home() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("TALLY_HOME") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".tally"))
}

pub fn ensure_tally_home() -> Result<PathBuf> {
    let dir = tally_home()?;
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir)
}

pub fn store_path() -> Result<PathBuf> {
    Ok(ensure_tally_home()?.join("store.json"))
}

/// Load the persisted store, or an empty one on first use.
pub fn open_store() -> Result<Arc<InMemoryStore>> {
    let p = store_path()?;
    if !p.exists() {
        debug!(path = %p.display(), "no store file yet, starting empty");
        return Ok(Arc::new(InMemoryStore::new()));
    }
    let s = fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?;
    let snapshot: StoreSnapshot =
        serde_json::from_str(&s).with_context(|| format!("parse {}", p.display()))?;
    let store = InMemoryStore::from_snapshot(snapshot, CacheMode::Warm)
        .with_context(|| format!("load {}", p.display()))?;
    Ok(Arc::new(store))
}

pub fn save_store(store: &InMemoryStore) -> Result<()> {
    let p = store_path()?;
    let json = serde_json::to_string_pretty(&store.snapshot()).context("serialize store")?;
    fs::write(&p, json).with_context(|| format!("write {}", p.display()))?;
    Ok(())
}
