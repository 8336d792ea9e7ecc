//! Worker configuration, loadable from TOML with env overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Queue name jobs are published under (default: "default")
  pub name: String,

  /// Bounded poll interval for the dequeue/notification loops in
  /// milliseconds (default: 10s). Loops also wake eagerly on store
  /// notifications; this is the fallback cadence.
  pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      name: "default".to_string(),
      poll_interval_ms: 10_000,
    }
  }
}

/// Configuration for one realm worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmConfig {
  /// Base URL of the realm served by this worker
  pub realm_url: String,

  /// Directory holding the realm's files
  pub realm_dir: PathBuf,

  /// Index database file; defaults to <data dir>/index.db when unset
  #[serde(skip_serializing_if = "Option::is_none")]
  pub db_path: Option<PathBuf>,

  #[serde(default)]
  pub queue: QueueConfig,
}

impl Default for RealmConfig {
  fn default() -> Self {
    Self {
      realm_url: "http://localhost:4201/".to_string(),
      realm_dir: PathBuf::from("."),
      db_path: None,
      queue: QueueConfig::default(),
    }
  }
}

impl RealmConfig {
  /// Load config from a TOML file, falling back to defaults when the file
  /// does not exist.
  pub fn load(path: &Path) -> Result<Self> {
    if !path.exists() {
      return Ok(Self::default());
    }
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = RealmConfig::default();
    assert_eq!(config.queue.name, "default");
    assert_eq!(config.queue.poll_interval_ms, 10_000);
    assert!(config.db_path.is_none());
  }

  #[test]
  fn test_load_missing_file_uses_defaults() {
    let config = RealmConfig::load(Path::new("/nonexistent/realmdex.toml")).unwrap();
    assert_eq!(config.realm_url, "http://localhost:4201/");
  }

  #[test]
  fn test_load_partial_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("realmdex.toml");
    std::fs::write(&path, "realm_url = \"http://demo.example/realm/\"\n[queue]\nname = \"demo\"\n").unwrap();

    let config = RealmConfig::load(&path).unwrap();
    assert_eq!(config.realm_url, "http://demo.example/realm/");
    assert_eq!(config.queue.name, "demo");
    // untouched fields keep defaults
    assert_eq!(config.queue.poll_interval_ms, 10_000);
  }
}
