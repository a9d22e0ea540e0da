//! Configuration for the media root, task engine tuning, journal flushing and
//! replication.
//!
//! Library types receive explicit values; only the binary reads the global
//! configuration through [`get`].

use std::{
   fs,
   path::{Path, PathBuf},
   sync::OnceLock,
   time::Duration,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{Result, instance::Role};

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Server settings. Every field has a default, so a partial file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub media_root: PathBuf,
   pub root_alias: String,
   pub cache_dir:  PathBuf,
   pub data_dir:   PathBuf,

   pub worker_count:            usize,
   pub retry_drain_interval_ms: u64,
   pub upload_chunk_timeout_ms: u64,

   pub journal_flush_threshold:   usize,
   pub journal_flush_interval_ms: u64,

   pub broadcast_flush_interval_ms: u64,

   pub server_name:          String,
   pub role:                 Role,
   pub core_address:         Option<String>,
   pub api_key:              Option<String>,
   pub backup_interval_secs: u64,

   pub ignore_filenames: Vec<String>,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         media_root: base_dir().join("media"),
         root_alias: "MEDIA".to_string(),
         cache_dir: base_dir().join("cache"),
         data_dir: base_dir().join("data"),
         worker_count: num_cpus::get().clamp(2, 16),
         retry_drain_interval_ms: 1000,
         upload_chunk_timeout_ms: 10_000,
         journal_flush_threshold: 100,
         journal_flush_interval_ms: 10_000,
         broadcast_flush_interval_ms: 100,
         server_name: "strata".to_string(),
         role: Role::Uninitialized,
         core_address: None,
         api_key: None,
         backup_interval_secs: 3600,
         ignore_filenames: vec![".DS_Store".to_string()],
      }
   }
}

impl Config {
   /// Reads `~/.strata/config.toml` (written with defaults on first use) and
   /// `STRATA_*` variables. A broken file falls back to the defaults.
   pub fn load() -> Self {
      let path = config_file_path();
      if !path.exists()
         && let Err(e) = write_defaults(path)
      {
         tracing::debug!(path = %path.display(), "could not write default config: {e}");
      }
      Self::load_from(path)
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   /// Loads a config from an explicit file, for tools and tests that must not
   /// touch the user's home directory.
   pub fn load_from(path: &Path) -> Result<Self> {
      let cfg = Figment::from(Serialized::defaults(Self::default()))
         .merge(Toml::file(path))
         .merge(Env::prefixed("STRATA_").lowercase(true))
         .extract()?;
      Ok(cfg)
   }

   pub fn to_toml(&self) -> Result<String> {
      Ok(toml::to_string_pretty(self)?)
   }

   pub fn retry_drain_interval(&self) -> Duration {
      Duration::from_millis(self.retry_drain_interval_ms.max(1))
   }

   pub fn upload_chunk_timeout(&self) -> Duration {
      Duration::from_millis(self.upload_chunk_timeout_ms.max(1))
   }

   pub fn journal_flush_interval(&self) -> Duration {
      Duration::from_millis(self.journal_flush_interval_ms.max(1))
   }

   pub fn broadcast_flush_interval(&self) -> Duration {
      Duration::from_millis(self.broadcast_flush_interval_ms.max(1))
   }

   pub fn backup_interval(&self) -> Duration {
      Duration::from_secs(self.backup_interval_secs.max(1))
   }

   /// Worker thread count, never below one.
   pub fn workers(&self) -> usize {
      self.worker_count.max(1)
   }
}

/// The process-wide configuration, loaded on first use.
pub fn get() -> &'static Config {
   CONFIG.get_or_init(Config::load)
}

/// `~/.strata`, or `.strata` below the working directory when no home
/// directory can be found.
pub fn base_dir() -> &'static PathBuf {
   static BASE: OnceLock<PathBuf> = OnceLock::new();
   BASE.get_or_init(|| {
      let home = BaseDirs::new()
         .map(|d| d.home_dir().to_path_buf())
         .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
         .unwrap_or_else(|| PathBuf::from("."));
      home.join(".strata")
   })
}

pub fn config_file_path() -> &'static PathBuf {
   static PATH: OnceLock<PathBuf> = OnceLock::new();
   PATH.get_or_init(|| base_dir().join("config.toml"))
}

fn write_defaults(path: &Path) -> Result<()> {
   if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
   }
   fs::write(path, Config::default().to_toml()?)?;
   Ok(())
}
