use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Worker configuration: namespace roles, generation tag, precache manifest
/// and routing hints. Tests build isolated instances instead of sharing
/// process-wide names.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Generation tag distinguishing this deployment from its predecessor
  /// (e.g. "v3"). Namespace names are suffixed with it.
  pub generation: String,
  /// The page origin; requests to any other origin are cross-origin.
  pub origin: String,
  /// Critical assets precached on install, as origin-relative paths.
  pub static_manifest: Vec<String>,
  /// Path prefixes treated as static assets regardless of destination.
  pub static_prefixes: Vec<String>,
  /// Same-origin path prefixes served stale-while-revalidate (slow-moving
  /// content like food and exercise banks).
  pub revalidate_prefixes: Vec<String>,
  /// Attempt cap per queued mutation before it is abandoned.
  pub max_retries: u32,
  /// Override for the on-disk store location (defaults to the platform data
  /// directory).
  pub data_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      generation: "v1".to_string(),
      origin: "https://app.fitsync.local".to_string(),
      static_manifest: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/app.js".to_string(),
        "/styles/main.css".to_string(),
        "/manifest.json".to_string(),
        "/icons/icon-192.png".to_string(),
      ],
      static_prefixes: vec![
        "/styles/".to_string(),
        "/icons/".to_string(),
        "/fonts/".to_string(),
        "/app.js".to_string(),
      ],
      revalidate_prefixes: vec!["/api/foods".to_string(), "/api/exercises".to_string()],
      max_retries: 3,
      data_dir: None,
    }
  }
}

impl WorkerConfig {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fitsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fitsync/config.yaml
  ///
  /// Unlike most tools' configs, a missing file is not an error: the
  /// defaults describe a complete worker.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fitsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fitsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: WorkerConfig = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn static_namespace(&self) -> String {
    format!("static-{}", self.generation)
  }

  pub fn dynamic_namespace(&self) -> String {
    format!("dynamic-{}", self.generation)
  }

  pub fn data_namespace(&self) -> String {
    format!("data-{}", self.generation)
  }

  /// The only namespaces allowed to survive activation of this generation.
  pub fn expected_namespaces(&self) -> [String; 3] {
    [
      self.static_namespace(),
      self.dynamic_namespace(),
      self.data_namespace(),
    ]
  }

  fn store_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("fitsync"))
  }

  pub fn cache_db_path(&self) -> Result<PathBuf> {
    Ok(self.store_dir()?.join("cache.db"))
  }

  pub fn queue_db_path(&self) -> Result<PathBuf> {
    Ok(self.store_dir()?.join("queue.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_namespaces_carry_generation() {
    let config = WorkerConfig {
      generation: "v7".to_string(),
      ..Default::default()
    };
    assert_eq!(config.static_namespace(), "static-v7");
    assert_eq!(config.dynamic_namespace(), "dynamic-v7");
    assert_eq!(config.data_namespace(), "data-v7");
  }

  #[test]
  fn test_default_retry_cap() {
    assert_eq!(WorkerConfig::default().max_retries, 3);
  }

  #[test]
  fn test_parse_partial_yaml() {
    let config: WorkerConfig = serde_yaml::from_str(
      "generation: v2\norigin: https://fit.example.com\nmax_retries: 5\n",
    )
    .unwrap();
    assert_eq!(config.generation, "v2");
    assert_eq!(config.max_retries, 5);
    // Unspecified fields keep their defaults.
    assert!(!config.static_manifest.is_empty());
  }
}
