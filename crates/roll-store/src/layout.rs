use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::config::RollConfig;
use crate::error::Result;
use crate::store::Store;

const DB_FILE: &str = "roll.db";
const CONFIG_FILE: &str = "roll.toml";

/// `~/.rollcall`, falling back to the working directory when no home is set.
pub fn default_base_dir() -> PathBuf {
    dirs_home().join(".rollcall")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// The data directory.
///
/// Layout:
/// ```text
/// ~/.rollcall/
/// ├── roll.db      (SQLite, WAL)
/// └── roll.toml    (optional)
/// ```
#[derive(Clone, Debug)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Use `base`, or the default location, creating it if needed.
    pub fn open(base: Option<&Path>) -> Result<Self> {
        let root = base.map(PathBuf::from).unwrap_or_else(default_base_dir);
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn load_config(&self) -> Result<RollConfig> {
        RollConfig::load(&self.config_path())
    }

    /// Open `roll.db` with the dimension, lock wait and pool size from `config`.
    pub fn open_store(&self, config: &RollConfig) -> Result<Store> {
        Ok(
            Store::open_with_connections(&self.db_path(), config.storage.connections)?
                .with_dimension(config.matcher.dimension)
                .with_lock_wait(config.lock_wait()),
        )
    }
}
