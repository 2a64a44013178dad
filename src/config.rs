//! Configuration for payledger.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PAYLEDGER_HOME, PAYLEDGER_LEDGER, PAYLEDGER_GATEWAY_URL)
//! 2. Config file (.payledger/config.yaml)
//! 3. Defaults (~/.payledger)
//!
//! Config file discovery:
//! - Searches current directory and parents for .payledger/config.yaml
//! - Paths in config file are relative to the .payledger/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{BreakerConfig, BusinessRules, IdempotencyConfig, RetryPolicy};
use crate::domain::reference::{DEFAULT_REFERENCE_DIGITS, MAX_REFERENCE_DIGITS};
use crate::domain::ReferenceMapper;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub rules: RulesSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .payledger/)
    pub home: Option<String>,
    /// Ledger database file (relative to .payledger/)
    pub ledger: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    pub url: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub reference_digits: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerSection {
    pub failure_threshold: Option<u32>,
    pub cooldown_seconds: Option<u64>,
    pub monitor_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulesSection {
    pub multi_capture: Option<bool>,
    pub reference_collision_window_hours: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// Ledger database file
    pub ledger: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub gateway: GatewaySettings,
    pub breaker: BreakerSettings,
    pub retry: RetryPolicy,
    pub idempotency: IdempotencyConfig,
    pub rules: BusinessRules,
    /// Window inside which a merchant's references must be unique
    pub reference_collision_window: Duration,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Base URL of the HTTP gateway (required for gateway operations)
    pub url: Option<String>,
    /// Per-attempt timeout
    pub timeout: Duration,
    pub reference_digits: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(30),
            reference_digits: DEFAULT_REFERENCE_DIGITS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub monitor_interval: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

impl ResolvedConfig {
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            cooldown: self.breaker.cooldown,
        }
    }

    pub fn reference_mapper(&self) -> ReferenceMapper {
        ReferenceMapper::new(self.gateway.reference_digits)
    }

    /// Gateway URL, or an error naming how to set one
    pub fn gateway_url(&self) -> Result<&str> {
        self.gateway.url.as_deref().context(
            "No gateway URL configured (set PAYLEDGER_GATEWAY_URL or gateway.url in .payledger/config.yaml)",
        )
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".payledger").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    resolve_config(find_config_file())
}

fn resolve_config(config_file: Option<PathBuf>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".payledger");

    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    // Relative paths in the file are anchored at .payledger/
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let home = if let Ok(env_home) = std::env::var("PAYLEDGER_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = file.paths.home {
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let ledger = if let Ok(env_ledger) = std::env::var("PAYLEDGER_LEDGER") {
        PathBuf::from(env_ledger)
    } else if let Some(ref ledger_path) = file.paths.ledger {
        resolve_path(config_dir, ledger_path)
    } else {
        home.join("ledger.db")
    };

    let defaults = GatewaySettings::default();
    let gateway = GatewaySettings {
        url: std::env::var("PAYLEDGER_GATEWAY_URL")
            .ok()
            .or(file.gateway.url),
        timeout: file
            .gateway
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
        reference_digits: file
            .gateway
            .reference_digits
            .unwrap_or(defaults.reference_digits)
            .clamp(1, MAX_REFERENCE_DIGITS),
    };

    let defaults = BreakerSettings::default();
    let breaker = BreakerSettings {
        failure_threshold: file
            .breaker
            .failure_threshold
            .unwrap_or(defaults.failure_threshold)
            .max(1),
        cooldown: file
            .breaker
            .cooldown_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.cooldown),
        monitor_interval: file
            .breaker
            .monitor_interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.monitor_interval),
    };

    let rules = BusinessRules {
        multi_capture: file
            .rules
            .multi_capture
            .unwrap_or(BusinessRules::default().multi_capture),
    };
    let window_hours = file.rules.reference_collision_window_hours.unwrap_or(24);

    Ok(ResolvedConfig {
        home,
        ledger,
        config_file,
        gateway,
        breaker,
        retry: file.retry,
        idempotency: file.idempotency,
        rules,
        reference_collision_window: Duration::from_secs(window_hours * 3600),
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the payledger home directory
pub fn payledger_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the ledger database path
pub fn ledger_path() -> Result<PathBuf> {
    Ok(config()?.ledger.clone())
}
