use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Bucket name. Bumping the version suffix is how clients drop old assets.
pub const DEFAULT_CACHE_NAME: &str = "sgpc-cash-v24";

/// Scope the relative asset URLs resolve against when none is configured.
pub const DEFAULT_SCOPE: &str = "http://localhost:8080/";

pub const DEFAULT_FALLBACK: &str = "./index.html";

const DEFAULT_PRECACHE: &[&str] = &[
  "./",
  "./index.html",
  "./manifest.json",
  "./developer.jpg",
  "./icon-192.png",
  "./icon-512.png",
  // Google Fonts stylesheet + CDN libraries
  "https://fonts.googleapis.com/css2?family=Noto+Sans+Gurmukhi:wght@400;500;600;700&display=swap",
  "https://cdn.tailwindcss.com",
  "https://unpkg.com/react@18/umd/react.development.js",
  "https://unpkg.com/react-dom@18/umd/react-dom.development.js",
  "https://unpkg.com/@babel/standalone/babel.min.js",
  "https://cdnjs.cloudflare.com/ajax/libs/FileSaver.js/2.0.5/FileSaver.min.js",
];

const DEFAULT_RUNTIME_HOSTS: &[&str] = &[
  "fonts.googleapis.com",
  "fonts.gstatic.com",
  "unpkg.com",
  "cdn.tailwindcss.com",
  "cdnjs.cloudflare.com",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Name of the one bucket that survives activation
  pub cache_name: String,
  /// URL of the worker scope; its origin is the "same origin" for runtime caching
  pub scope: String,
  /// Assets added at install, in order. Relative entries resolve against `scope`.
  pub precache: Vec<String>,
  /// Document served when the network fails and the request is not cached
  pub fallback: String,
  /// Substrings that make a cross-origin URL eligible for runtime caching
  pub runtime_cache_hosts: Vec<String>,
  /// SQLite cache database (defaults to the user data directory)
  pub database: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      cache_name: DEFAULT_CACHE_NAME.to_string(),
      scope: DEFAULT_SCOPE.to_string(),
      precache: DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect(),
      fallback: DEFAULT_FALLBACK.to_string(),
      runtime_cache_hosts: DEFAULT_RUNTIME_HOSTS.iter().map(|s| s.to_string()).collect(),
      database: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sgpc-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/sgpc-sw/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("sgpc-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("sgpc-sw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Check the fields that every lifecycle step depends on.
  pub fn validate(&self) -> Result<()> {
    if self.cache_name.trim().is_empty() {
      return Err(eyre!("cache_name must not be empty"));
    }
    self.scope_url()?;
    Ok(())
  }

  pub fn scope_url(&self) -> Result<Url> {
    Url::parse(&self.scope).map_err(|e| eyre!("Invalid scope URL '{}': {}", self.scope, e))
  }

  /// Path of the SQLite cache database.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(p) = &self.database {
      return Ok(p.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("sgpc-sw").join("cache.db"))
  }
}
