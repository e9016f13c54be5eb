use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::SqliteStorage;
use crate::proxy::ProxyOptions;
use crate::query::{OracleRestQueryHandler, QueryHandler, SimpleQueryHandler};
use crate::shred::{IdAttribute, JsonProcessor};
use crate::strategy::{BackgroundFetch, CacheFirstStrategy, CacheIfOfflineStrategy, FetchStrategy};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// SQLite database (defaults to <data dir>/offline-proxy/store.db)
  pub database: Option<PathBuf>,
  /// Start in offline mode
  pub offline: bool,
  pub fetch_strategy: FetchStrategyKind,
  pub background_fetch: BackgroundFetch,
  pub request_timeout_secs: u64,
  pub resource: Option<ResourceConfig>,
  pub logging: LoggingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      database: None,
      offline: false,
      fetch_strategy: FetchStrategyKind::default(),
      background_fetch: BackgroundFetch::default(),
      request_timeout_secs: 30,
      resource: None,
      logging: LoggingConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStrategyKind {
  #[default]
  CacheIfOffline,
  CacheFirst,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
  #[default]
  Simple,
  OracleRest,
  Binary,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QueryKind {
  #[default]
  None,
  Simple,
  OracleRest,
}

/// The REST resource whose payloads are shredded into a local store.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
  pub store: String,
  #[serde(default)]
  pub dialect: Dialect,
  /// A single field, or a list for composite keys
  #[serde(default = "default_id_attribute")]
  pub id_attribute: IdAttribute,
  #[serde(default)]
  pub query: QueryKind,
  #[serde(default)]
  pub ignore_params: Vec<String>,
  /// Honor limit/offset in the simple query handler
  #[serde(default)]
  pub paging: bool,
}

fn default_id_attribute() -> IdAttribute {
  IdAttribute::from("id")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive, overridden by RUST_LOG
  pub level: String,
  /// Log to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl ResourceConfig {
  pub fn json_processor(&self) -> JsonProcessor {
    match self.dialect {
      Dialect::Simple => JsonProcessor::simple(&self.store, self.id_attribute.clone()),
      Dialect::OracleRest => JsonProcessor::oracle_rest(&self.store, self.id_attribute.clone()),
      Dialect::Binary => JsonProcessor::binary(&self.store),
    }
  }

  pub fn query_handler(&self) -> Option<Arc<dyn QueryHandler>> {
    match self.query {
      QueryKind::None => None,
      QueryKind::Simple => Some(Arc::new(
        SimpleQueryHandler::new(&self.store)
          .ignore_params(self.ignore_params.iter())
          .with_paging(self.paging),
      )),
      QueryKind::OracleRest => Some(Arc::new(OracleRestQueryHandler::new(&self.store))),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-proxy.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-proxy/config.yaml
  ///
  /// Defaults apply when no file is found.
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
      None => {
        tracing::debug!("no configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offline-proxy.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-proxy").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn fetch_strategy(&self) -> Arc<dyn FetchStrategy> {
    match self.fetch_strategy {
      FetchStrategyKind::CacheIfOffline => Arc::new(CacheIfOfflineStrategy),
      FetchStrategyKind::CacheFirst => Arc::new(CacheFirstStrategy::new(self.background_fetch, None)),
    }
  }

  /// Proxy options for the configured strategy and resource.
  pub fn proxy_options(&self) -> ProxyOptions {
    let mut options = ProxyOptions::default().with_fetch_strategy(self.fetch_strategy());
    if let Some(resource) = &self.resource {
      options = options.with_json_processor(resource.json_processor());
      if let Some(handler) = resource.query_handler() {
        options = options.with_query_handler(handler);
      }
    }
    options
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_gives_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert!(!config.offline);
    assert_eq!(config.fetch_strategy, FetchStrategyKind::CacheIfOffline);
    assert_eq!(config.background_fetch, BackgroundFetch::Enabled);
    assert_eq!(config.request_timeout(), Duration::from_secs(30));
    assert_eq!(config.logging.level, "info");
    assert!(config.proxy_options().json_processor.is_none());
  }

  #[test]
  fn test_full_file() {
    let config = Config::from_yaml(
      r#"
database: /tmp/proxy.db
offline: true
fetch_strategy: cache-first
background_fetch: disabled
request_timeout_secs: 5
resource:
  store: orders
  dialect: oracle-rest
  id_attribute: [region, number]
  query: oracle-rest
logging:
  level: debug
  file: /tmp/proxy.log
"#,
    )
    .unwrap();

    assert!(config.offline);
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/proxy.db"));
    assert_eq!(config.fetch_strategy, FetchStrategyKind::CacheFirst);
    assert_eq!(config.background_fetch, BackgroundFetch::Disabled);

    let resource = config.resource.as_ref().unwrap();
    assert_eq!(resource.dialect, Dialect::OracleRest);
    assert_eq!(
      resource.id_attribute,
      IdAttribute::Composite(vec!["region".to_string(), "number".to_string()])
    );

    let options = config.proxy_options();
    assert_eq!(options.json_processor.as_ref().map(|p| p.store_name()), Some("orders"));
    assert!(options.query_handler.is_some());
  }

  #[test]
  fn test_resource_defaults() {
    let config = Config::from_yaml("resource:\n  store: items\n").unwrap();
    let resource = config.resource.unwrap();
    assert_eq!(resource.dialect, Dialect::Simple);
    assert_eq!(resource.id_attribute, IdAttribute::from("id"));
    assert!(resource.query_handler().is_none());
  }

  #[test]
  fn test_unknown_strategy_is_rejected() {
    assert!(Config::from_yaml("fetch_strategy: sometimes").is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/offline-proxy.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
