//! Configuration loader and validator for the supplier→marketplace sync engine.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub marketplace: Marketplace,
    pub sources: BTreeMap<String, SourceConfig>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    /// Directory where an audit copy of every built feed document is kept.
    pub feeds_dir: String,
    /// Seconds between feed status checks while a submission is processing.
    pub status_poll_secs: u64,
    /// Process-wide back-off after the marketplace throttles a request.
    pub throttle_backoff_secs: u64,
}

/// Marketplace (listing API) credentials and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Marketplace {
    pub seller_id: String,
    pub marketplace_id: String,
    pub endpoint: String,
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

/// Which supplier endpoint shape a source speaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    BestBuy,
    Vitacost,
}

/// Per-source tuning. One instance of the reconcile engine and the submission
/// engine is constructed from each entry; nothing reads configuration through
/// globals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub provider: ProviderKind,
    pub api_base_url: String,
    pub requests_per_second: u32,
    pub concurrency: usize,
    /// Ceiling on the quantity reported downstream.
    pub stock_level: i64,
    /// Raw stock strictly below this is listed as out of stock.
    #[serde(default = "default_low_stock_cutoff")]
    pub low_stock_cutoff: i64,
    pub omd_handling_days: i64,
    /// Fallback supplier handling contribution when no delivery window is
    /// present in a snapshot.
    pub provider_handling_days: i64,
    /// Non-zero marker written to `update_flag` on changed rows. Must be
    /// disjoint across sources sharing the table.
    pub update_flag_value: i64,
    /// Nominal batch size for feed submission; clamped to the marketplace's
    /// hard per-feed ceiling at run time.
    pub batch_size: usize,
}

fn default_low_stock_cutoff() -> i64 {
    4
}

impl Config {
    /// Ensure required directories exist (creates `app.feeds_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.feeds_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.feeds_dir)
    }

    pub fn source(&self, source_id: &str) -> Result<&SourceConfig, ConfigError> {
        self.sources
            .get(source_id)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown source '{source_id}'")))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    fn invalid(msg: impl Into<String>) -> ConfigError {
        ConfigError::Invalid(msg.into())
    }

    if cfg.app.feeds_dir.trim().is_empty() {
        return Err(invalid("app.feeds_dir must be non-empty"));
    }
    if cfg.app.status_poll_secs == 0 {
        return Err(invalid("app.status_poll_secs must be > 0"));
    }

    if cfg.marketplace.seller_id.trim().is_empty() {
        return Err(invalid("marketplace.seller_id must be non-empty"));
    }
    if cfg.marketplace.marketplace_id.trim().is_empty() {
        return Err(invalid("marketplace.marketplace_id must be non-empty"));
    }
    if cfg.marketplace.endpoint.trim().is_empty() {
        return Err(invalid("marketplace.endpoint must be non-empty"));
    }
    if cfg.marketplace.refresh_token.trim().is_empty() {
        return Err(invalid("marketplace.refresh_token must be non-empty"));
    }

    if cfg.sources.is_empty() {
        return Err(invalid("at least one source must be configured"));
    }

    let mut seen_flags: BTreeMap<i64, &str> = BTreeMap::new();
    for (id, src) in &cfg.sources {
        if src.api_base_url.trim().is_empty() {
            return Err(invalid(format!("sources.{id}.api_base_url must be non-empty")));
        }
        if src.requests_per_second == 0 {
            return Err(invalid(format!("sources.{id}.requests_per_second must be > 0")));
        }
        if src.concurrency == 0 {
            return Err(invalid(format!("sources.{id}.concurrency must be > 0")));
        }
        if src.stock_level <= 0 {
            return Err(invalid(format!("sources.{id}.stock_level must be > 0")));
        }
        if src.low_stock_cutoff < 0 {
            return Err(invalid(format!("sources.{id}.low_stock_cutoff must be >= 0")));
        }
        if src.omd_handling_days < 0 || src.provider_handling_days < 0 {
            return Err(invalid(format!("sources.{id} handling days must be >= 0")));
        }
        if src.batch_size == 0 {
            return Err(invalid(format!("sources.{id}.batch_size must be > 0")));
        }
        if src.update_flag_value == 0 {
            return Err(invalid(format!("sources.{id}.update_flag_value must be non-zero")));
        }
        // Flag values partition the shared table; a collision would let one
        // source extract or reset another source's pending rows.
        if let Some(other) = seen_flags.insert(src.update_flag_value, id) {
            return Err(invalid(format!(
                "sources.{id}.update_flag_value {} collides with source '{other}'",
                src.update_flag_value
            )));
        }
    }

    Ok(())
}

/// Canonical example configuration, used by tests and `--print-example`.
pub fn example() -> &'static str {
    r#"app:
  feeds_dir: "./feeds"
  status_poll_secs: 30
  throttle_backoff_secs: 300

marketplace:
  seller_id: "YOUR_SELLER_ID"
  marketplace_id: "ATVPDKIKX0DER"
  endpoint: "https://sellingpartnerapi-na.amazon.com"
  auth_url: "https://api.amazon.com/auth/o2/token"
  client_id: "YOUR_CLIENT_ID"
  client_secret: "YOUR_CLIENT_SECRET"
  refresh_token: "YOUR_REFRESH_TOKEN"

sources:
  bestbuy:
    provider: best_buy
    api_base_url: "http://bb-proxy.internal:3005/bb/api"
    requests_per_second: 2
    concurrency: 5
    stock_level: 20
    low_stock_cutoff: 4
    omd_handling_days: 1
    provider_handling_days: 3
    update_flag_value: 4
    batch_size: 5000
  vitacost:
    provider: vitacost
    api_base_url: "http://vc-proxy.internal:3010/vc/api"
    requests_per_second: 1
    concurrency: 5
    stock_level: 15
    omd_handling_days: 1
    provider_handling_days: 2
    update_flag_value: 7
    batch_size: 5000
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sources["vitacost"].low_stock_cutoff, 4); // default applies
    }

    #[test]
    fn rejects_zero_flag_value() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sources.get_mut("bestbuy").unwrap().update_flag_value = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("update_flag_value")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn rejects_colliding_flag_values() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sources.get_mut("vitacost").unwrap().update_flag_value = 4;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("collides")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn rejects_empty_marketplace_ids() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.marketplace.seller_id = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.marketplace.marketplace_id = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_source_tuning() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sources.get_mut("bestbuy").unwrap().concurrency = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sources.get_mut("bestbuy").unwrap().stock_level = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_feeds_dir() {
        let td = tempdir().unwrap();
        let feeds_path = td.path().join("feeds");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.feeds_dir = feeds_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(feeds_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.sources["bestbuy"].update_flag_value, 4);
        assert!(cfg.source("nope").is_err());
    }
}
