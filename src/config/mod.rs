//! Root configuration: environment variables override the config file,
//! which overrides built-in defaults. Unlike the TOML layout this proxy's
//! ancestor used, the on-disk format here is JSON, loaded from
//! `~/.relayplane/config.json` (overridable via `RELAYPLANE_CONFIG_PATH`).
//! A primary config file that's missing or fails to parse falls back to
//! its `.bak` (restoring it over the primary); if the backup is also
//! unusable, startup proceeds on built-in defaults rather than refusing
//! to start - credentials live in a separate file untouched by any of
//! this, so a config reset never loses them. A config file that parses
//! but contains a semantically invalid value (unknown cache mode, bad
//! bind address) is still a fatal startup error - that's a typo worth
//! surfacing, not data loss worth working around.

mod credentials;

pub use credentials::{Credentials, CredentialsError};

use crate::alerts::AlertConfig;
use crate::anomaly::AnomalyConfig;
use crate::budget::{BreachAction, BudgetConfig};
use crate::cache::{CacheConfig, CacheMode};
use crate::cooldown::CooldownConfig;
use crate::downgrade::DowngradeConfig;
use crate::router::RouterConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_dir: PathBuf,
    pub router: RouterConfig,
    pub cache: CacheConfig,
    pub budget: BudgetConfig,
    pub anomaly: AnomalyConfig,
    pub downgrade: DowngradeConfig,
    pub alerts: AlertConfig,
    pub cooldown: CooldownConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4100".parse().unwrap(),
            log_dir: PathBuf::from("./logs"),
            router: RouterConfig::default(),
            cache: CacheConfig::default(),
            budget: BudgetConfig::default(),
            anomaly: AnomalyConfig::default(),
            downgrade: DowngradeConfig::default(),
            alerts: AlertConfig::default(),
            cooldown: CooldownConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// On-disk format: only the scalar knobs a user would plausibly want to
// hand-edit are exposed here. Structural tables (router aliases, the
// downgrade mapping, cascade model lists) stay compiled-in defaults, same
// split the ancestor config drew between file-configurable scalars and
// the fixed client/provider tables.
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    bind_addr: Option<String>,
    log_dir: Option<String>,
    router: Option<FileRouterConfig>,
    cache: Option<FileCacheConfig>,
    budget: Option<FileBudgetConfig>,
    anomaly: Option<FileAnomalyConfig>,
    downgrade: Option<FileDowngradeConfig>,
    alerts: Option<FileAlertConfig>,
    cooldown: Option<FileCooldownConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct FileRouterConfig {
    mode: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileCacheConfig {
    enabled: Option<bool>,
    mode: Option<String>,
    only_when_deterministic: Option<bool>,
    memory_budget_bytes: Option<u64>,
    exact_ttl_seconds: Option<i64>,
    aggressive_ttl_seconds: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct FileBudgetConfig {
    daily_limit_usd: Option<f64>,
    hourly_limit_usd: Option<f64>,
    per_request_limit_usd: Option<f64>,
    thresholds: Option<Vec<u32>>,
    on_breach: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileAnomalyConfig {
    window_seconds: Option<i64>,
    token_explosion_usd: Option<f64>,
    velocity_count_threshold: Option<usize>,
    velocity_rate_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct FileDowngradeConfig {
    enabled: Option<bool>,
    threshold_percent: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct FileAlertConfig {
    cooldown_seconds: Option<u64>,
    max_history: Option<usize>,
    webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileCooldownConfig {
    allowed_fails: Option<u32>,
    window_seconds: Option<u64>,
    cooldown_seconds: Option<u64>,
}

/// Only raised for a file-read failure that isn't "missing" (e.g. a
/// permissions error) or a config value that parsed as JSON but is
/// semantically invalid - a corrupt/unparseable JSON file recovers via
/// the `.bak` fallback in `load_file_config` instead of erroring.
#[derive(Debug)]
pub enum ConfigError {
    Read(std::io::Error),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "could not read config file: {e}"),
            ConfigError::InvalidValue(msg) => write!(f, "invalid config value: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// `~/.relayplane/config.json`, overridable via `RELAYPLANE_CONFIG_PATH`.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("RELAYPLANE_CONFIG_PATH") {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|p| p.join(".relayplane").join("config.json"))
    }

    fn credentials_path() -> Option<PathBuf> {
        Self::config_path().and_then(|p| p.parent().map(|dir| dir.join("credentials.json")))
    }

    pub fn load_credentials(&self) -> Result<Credentials, CredentialsError> {
        let Some(path) = Self::credentials_path() else {
            return Ok(Credentials::default());
        };
        Credentials::load(&path)
    }

    /// Loads file config (if present) layered under environment variables,
    /// layered under built-in defaults. A config file that exists but
    /// fails to parse is a fatal `ConfigError`, not a silent fallback.
    pub fn load() -> Result<Self, ConfigError> {
        let file = Self::load_file_config()?;
        let defaults = Self::default();
        Self::merge(defaults, file)
    }

    /// Missing primary -> defaults. Unparseable primary -> restore `.bak`
    /// over it and retry; if the backup is missing or also unparseable,
    /// fall back to defaults rather than failing startup. A read error
    /// that isn't "file not found" (e.g. a permissions problem) is still
    /// surfaced, since silently ignoring that hides an operator mistake
    /// rather than recovering from file corruption.
    fn load_file_config() -> Result<FileConfig, ConfigError> {
        let Some(path) = Self::config_path() else {
            return Ok(FileConfig::default());
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(file) => Ok(file),
                Err(e) => {
                    tracing::warn!("config file is not valid JSON ({e}), attempting to restore from .bak");
                    Self::load_from_backup(&path)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(e) => Err(ConfigError::Read(e)),
        }
    }

    fn load_from_backup(primary: &PathBuf) -> Result<FileConfig, ConfigError> {
        let bak_path = primary.with_extension("json.bak");
        let Ok(contents) = std::fs::read_to_string(&bak_path) else {
            tracing::warn!("no usable config backup found, starting from built-in defaults");
            return Ok(FileConfig::default());
        };
        match serde_json::from_str(&contents) {
            Ok(file) => {
                let _ = std::fs::copy(&bak_path, primary);
                Ok(file)
            }
            Err(e) => {
                tracing::warn!("config backup is also unparseable ({e}), starting from built-in defaults");
                Ok(FileConfig::default())
            }
        }
    }

    fn merge(mut base: Config, file: FileConfig) -> Result<Config, ConfigError> {
        if let Some(bind) = std::env::var("RELAYPLANE_BIND").ok().or(file.bind_addr) {
            base.bind_addr = bind
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("bind_addr '{bind}' is not a valid address")))?;
        }
        if let Some(log_dir) = std::env::var("RELAYPLANE_LOG_DIR").ok().or(file.log_dir) {
            base.log_dir = PathBuf::from(log_dir);
        }

        if let Some(router) = file.router {
            if let Some(mode) = router.mode {
                base.router.mode = parse_router_mode(&mode)?;
            }
        }

        if let Some(cache) = file.cache {
            if let Some(v) = cache.enabled {
                base.cache.enabled = v;
            }
            if let Some(mode) = cache.mode {
                base.cache.mode = match mode.as_str() {
                    "exact" => CacheMode::Exact,
                    "aggressive" => CacheMode::Aggressive,
                    other => return Err(ConfigError::InvalidValue(format!("unknown cache mode '{other}'"))),
                };
            }
            if let Some(v) = cache.only_when_deterministic {
                base.cache.only_when_deterministic = v;
            }
            if let Some(v) = cache.memory_budget_bytes {
                base.cache.memory_budget_bytes = v;
            }
            if let Some(v) = cache.exact_ttl_seconds {
                base.cache.exact_ttl_seconds = v;
            }
            if let Some(v) = cache.aggressive_ttl_seconds {
                base.cache.aggressive_ttl_seconds = v;
            }
        }

        if let Some(budget) = file.budget {
            if let Some(v) = budget.daily_limit_usd {
                base.budget.daily_limit_usd = v;
            }
            if let Some(v) = budget.hourly_limit_usd {
                base.budget.hourly_limit_usd = v;
            }
            if let Some(v) = budget.per_request_limit_usd {
                base.budget.per_request_limit_usd = Some(v);
            }
            if let Some(v) = budget.thresholds {
                base.budget.thresholds = v;
            }
            if let Some(action) = budget.on_breach {
                base.budget.on_breach = match action.as_str() {
                    "block" => BreachAction::Block,
                    "warn" => BreachAction::Warn,
                    "downgrade" => BreachAction::Downgrade,
                    "alert" => BreachAction::Alert,
                    other => return Err(ConfigError::InvalidValue(format!("unknown breach action '{other}'"))),
                };
            }
        }
        if let Ok(v) = std::env::var("RELAYPLANE_DAILY_LIMIT_USD") {
            base.budget.daily_limit_usd = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("RELAYPLANE_DAILY_LIMIT_USD must be a number".to_string()))?;
        }

        if let Some(anomaly) = file.anomaly {
            if let Some(v) = anomaly.window_seconds {
                base.anomaly.window_seconds = v;
            }
            if let Some(v) = anomaly.token_explosion_usd {
                base.anomaly.token_explosion_usd = v;
            }
            if let Some(v) = anomaly.velocity_count_threshold {
                base.anomaly.velocity_count_threshold = v;
            }
            if let Some(v) = anomaly.velocity_rate_multiplier {
                base.anomaly.velocity_rate_multiplier = v;
            }
        }

        if let Some(downgrade) = file.downgrade {
            if let Some(v) = downgrade.enabled {
                base.downgrade.enabled = v;
            }
            if let Some(v) = downgrade.threshold_percent {
                base.downgrade.threshold_percent = v;
            }
        }

        if let Some(alerts) = file.alerts {
            if let Some(v) = alerts.cooldown_seconds {
                base.alerts.cooldown_seconds = v;
            }
            if let Some(v) = alerts.max_history {
                base.alerts.max_history = v;
            }
            base.alerts.webhook_url = alerts.webhook_url;
        }
        if let Ok(url) = std::env::var("RELAYPLANE_WEBHOOK_URL") {
            base.alerts.webhook_url = Some(url);
        }

        if let Some(cooldown) = file.cooldown {
            if let Some(v) = cooldown.allowed_fails {
                base.cooldown.allowed_fails = v;
            }
            if let Some(v) = cooldown.window_seconds {
                base.cooldown.window_seconds = v;
            }
            if let Some(v) = cooldown.cooldown_seconds {
                base.cooldown.cooldown_seconds = v;
            }
        }

        Ok(base)
    }

    /// Atomic write: `.tmp` then rename, with a single rotating `.bak`
    /// of whatever was previously on disk.
    pub fn persist_template(&self) -> Result<(), std::io::Error> {
        let Some(path) = Self::config_path() else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no config path available"));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            let _ = std::fs::copy(&path, path.with_extension("json.bak"));
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, self.to_json_template())?;
        std::fs::rename(&tmp_path, &path)
    }

    pub fn to_json_template(&self) -> String {
        serde_json::json!({
            "bind_addr": self.bind_addr.to_string(),
            "log_dir": self.log_dir.to_string_lossy(),
            "router": {"mode": router_mode_name(&self.router.mode)},
            "cache": {
                "enabled": self.cache.enabled,
                "mode": if self.cache.mode == CacheMode::Exact {"exact"} else {"aggressive"},
                "memory_budget_bytes": self.cache.memory_budget_bytes,
            },
            "budget": {
                "daily_limit_usd": self.budget.daily_limit_usd,
                "hourly_limit_usd": self.budget.hourly_limit_usd,
                "per_request_limit_usd": self.budget.per_request_limit_usd,
                "thresholds": self.budget.thresholds,
            },
        })
        .to_string()
    }
}

fn parse_router_mode(s: &str) -> Result<crate::router::RouterMode, ConfigError> {
    use crate::router::RouterMode;
    match s {
        "passthrough" => Ok(RouterMode::Passthrough),
        "complexity" => Ok(RouterMode::Complexity),
        "cascade" => Ok(RouterMode::Cascade),
        other => Err(ConfigError::InvalidValue(format!("unknown router mode '{other}'"))),
    }
}

pub fn router_mode_name(mode: &crate::router::RouterMode) -> &'static str {
    use crate::router::RouterMode;
    match mode {
        RouterMode::Passthrough => "passthrough",
        RouterMode::Complexity => "complexity",
        RouterMode::Cascade => "cascade",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_without_a_file() {
        let config = Config::merge(Config::default(), FileConfig::default()).unwrap();
        assert_eq!(config.budget.daily_limit_usd, 50.0);
    }

    #[test]
    fn file_overrides_default_budget() {
        let file = FileConfig {
            budget: Some(FileBudgetConfig {
                daily_limit_usd: Some(12.5),
                hourly_limit_usd: None,
                thresholds: None,
                on_breach: None,
            }),
            ..FileConfig::default()
        };
        let config = Config::merge(Config::default(), file).unwrap();
        assert_eq!(config.budget.daily_limit_usd, 12.5);
        assert_eq!(config.budget.hourly_limit_usd, Config::default().budget.hourly_limit_usd);
    }

    #[test]
    fn invalid_cache_mode_is_rejected() {
        let file = FileConfig {
            cache: Some(FileCacheConfig { mode: Some("sometimes".to_string()), ..FileCacheConfig::default() }),
            ..FileConfig::default()
        };
        assert!(Config::merge(Config::default(), file).is_err());
    }

    fn temp_config_path(label: &str) -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("relayplane-config-test-{label}-{}-{n}.json", std::process::id()))
    }

    #[test]
    fn unparseable_primary_restores_from_backup() {
        let primary = temp_config_path("restore-primary");
        let backup = primary.with_extension("json.bak");
        std::fs::write(&backup, r#"{"budget": {"daily_limit_usd": 42.0}}"#).unwrap();
        std::fs::write(&primary, "{ this is not json").unwrap();

        let file = Config::load_from_backup(&primary).unwrap();
        assert_eq!(file.budget.unwrap().daily_limit_usd, Some(42.0));
        // Restoring should have copied the backup back over the primary.
        let restored = std::fs::read_to_string(&primary).unwrap();
        assert_eq!(restored, std::fs::read_to_string(&backup).unwrap());

        let _ = std::fs::remove_file(&primary);
        let _ = std::fs::remove_file(&backup);
    }

    #[test]
    fn missing_backup_falls_back_to_defaults_not_an_error() {
        let primary = temp_config_path("no-backup");
        let file = Config::load_from_backup(&primary).unwrap();
        assert!(file.budget.is_none());
    }

    #[test]
    fn unparseable_backup_also_falls_back_to_defaults() {
        let primary = temp_config_path("bad-backup");
        let backup = primary.with_extension("json.bak");
        std::fs::write(&backup, "{ also not json").unwrap();

        let file = Config::load_from_backup(&primary).unwrap();
        assert!(file.budget.is_none());

        let _ = std::fs::remove_file(&backup);
    }
}
