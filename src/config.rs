use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::schema::{CollectionDecl, Schema};

const DEFAULT_LOG_FILTER: &str = "usedb=info";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Collection shapes, keyed by collection name
  #[serde(default)]
  pub collections: BTreeMap<String, CollectionDecl>,
  #[serde(default)]
  pub binding: BindingConfig,
  #[serde(default)]
  pub log: LogConfig,
}

/// Which transport the connection talks to.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BindingConfig {
  /// In-process documents, optionally seeded from a JSON file
  Memory { seed: Option<PathBuf> },
  /// SQLite database (defaults to $XDG_DATA_HOME/usedb/bindings.db)
  Sqlite { path: Option<PathBuf> },
  /// Remote service; the bearer token comes from USEDB_TOKEN
  Http { url: String },
}

impl Default for BindingConfig {
  fn default() -> Self {
    Self::Memory { seed: None }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Write logs to $XDG_DATA_HOME/usedb/usedb.log instead of stderr
  #[serde(default)]
  pub file: bool,
  /// tracing filter directive, overridden by RUST_LOG
  #[serde(default = "default_log_filter")]
  pub filter: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      file: false,
      filter: default_log_filter(),
    }
  }
}

fn default_log_filter() -> String {
  DEFAULT_LOG_FILTER.to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./usedb.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/usedb/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/usedb/config.yaml\n\
                 or pass --config."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("usedb.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("usedb").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let mut config = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
    config.resolve_relative_paths(path.parent().unwrap_or(Path::new(".")));

    Ok(config)
  }

  pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Seed and database paths are relative to the config file.
  fn resolve_relative_paths(&mut self, base: &Path) {
    let path = match &mut self.binding {
      BindingConfig::Memory { seed: Some(path) } | BindingConfig::Sqlite { path: Some(path) } => path,
      _ => return,
    };
    if path.is_relative() {
      *path = base.join(&*path);
    }
  }

  /// Build the schema registry from the declared collections.
  pub fn schema(&self) -> Result<Schema> {
    Schema::from_decls(&self.collections).map_err(|e| eyre!("Invalid collection schema: {}", e))
  }

  /// Get the bearer token for the HTTP binding, if set.
  ///
  /// Checks USEDB_TOKEN.
  pub fn get_token() -> Option<String> {
    std::env::var("USEDB_TOKEN").ok().filter(|t| !t.is_empty())
  }
}
