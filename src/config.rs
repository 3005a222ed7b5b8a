use std::collections::HashSet;
use std::path::Path;

use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::{ExchangeKind, MarketType};

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_data_dir() -> String {
    "./data".into()
}

fn default_database_path() -> String {
    "./data/app.db".into()
}

fn default_cache_dir() -> String {
    "./data/cache".into()
}

fn default_historical_candles() -> usize {
    200
}

fn default_true() -> bool {
    true
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    512
}

fn default_llm_requests_per_second() -> u32 {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_work_item_deadline_secs() -> u64 {
    60
}

fn default_llm_model() -> String {
    "deepseek-chat".into()
}

fn default_llm_timeout_secs() -> u64 {
    45
}

fn default_alert_poll_secs() -> u64 {
    15
}

fn default_free_subscription_limit() -> usize {
    3
}

fn default_free_alert_limit() -> usize {
    3
}

fn default_premium_subscription_limit() -> usize {
    25
}

fn default_premium_alert_limit() -> usize {
    25
}

fn default_signal_memory_ttl_minutes() -> i64 {
    60
}

fn default_signal_check_interval_minutes() -> i64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_historical_candles")]
    pub historical_candles: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            data_dir: default_data_dir(),
            database_path: default_database_path(),
            cache_dir: default_cache_dir(),
            historical_candles: default_historical_candles(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub market_type: Option<String>,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Name of the environment variable holding the API key, if private
    /// endpoints are ever required. Public kline endpoints do not need one.
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_requests_per_second")]
    pub requests_per_second: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_llm_model(),
            api_key_env: Some("DEEPSEEK_API_KEY".into()),
            timeout_secs: default_llm_timeout_secs(),
            requests_per_second: default_llm_requests_per_second(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token_env: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_work_item_deadline_secs")]
    pub work_item_deadline_secs: u64,
    #[serde(default = "default_alert_poll_secs")]
    pub alert_poll_secs: u64,
    #[serde(default = "default_signal_memory_ttl_minutes")]
    pub signal_memory_ttl_minutes: i64,
    #[serde(default = "default_signal_check_interval_minutes")]
    pub signal_check_interval_minutes: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            worker_pool_size: default_worker_pool_size(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            work_item_deadline_secs: default_work_item_deadline_secs(),
            alert_poll_secs: default_alert_poll_secs(),
            signal_memory_ttl_minutes: default_signal_memory_ttl_minutes(),
            signal_check_interval_minutes: default_signal_check_interval_minutes(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_free_subscription_limit")]
    pub free_subscription_limit: usize,
    #[serde(default = "default_free_alert_limit")]
    pub free_alert_limit: usize,
    #[serde(default = "default_premium_subscription_limit")]
    pub premium_subscription_limit: usize,
    #[serde(default = "default_premium_alert_limit")]
    pub premium_alert_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            free_subscription_limit: default_free_subscription_limit(),
            free_alert_limit: default_free_alert_limit(),
            premium_subscription_limit: default_premium_subscription_limit(),
            premium_alert_limit: default_premium_alert_limit(),
        }
    }
}

pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    // .env is optional; a missing file is not an error, matching dotenvy's
    // own "load if present" convention.
    let _ = dotenvy::dotenv();

    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let mut config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Environment variables override file config, the same direction the
/// teacher's CLI flags override file defaults.
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(value) = std::env::var("TELEGRAM_SIGNAL_CHECK_INTERVAL") {
        match value.parse::<i64>() {
            Ok(minutes) => config.orchestrator.signal_check_interval_minutes = minutes,
            Err(_) => tracing::warn!(
                value,
                "TELEGRAM_SIGNAL_CHECK_INTERVAL is not a valid integer, ignoring"
            ),
        }
    }
}

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_exchange_names(config)?;
    validate_exchange_market_types(config)?;
    validate_exchange_names_unique(config)?;
    validate_rate_limits(config)?;
    validate_limits(config)?;
    Ok(())
}

fn validate_exchange_names(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    for exchange in &config.exchanges {
        if ExchangeKind::from_str(&exchange.name).is_none() {
            return Err(Report::new(ConfigError::Validation {
                field: format!("exchanges: unknown exchange \"{}\"", exchange.name),
            }));
        }
    }
    Ok(())
}

fn validate_exchange_market_types(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    for exchange in &config.exchanges {
        if let Some(kind) = &exchange.market_type {
            if MarketType::from_str(kind).is_none() {
                return Err(Report::new(ConfigError::Validation {
                    field: format!(
                        "exchanges[\"{}\"].market_type \"{}\" is not valid",
                        exchange.name, kind
                    ),
                }));
            }
        }
    }
    Ok(())
}

fn validate_exchange_names_unique(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let mut seen = HashSet::new();
    for exchange in &config.exchanges {
        if !seen.insert(exchange.name.as_str()) {
            return Err(Report::new(ConfigError::Validation {
                field: format!("exchanges: duplicate entry \"{}\"", exchange.name),
            }));
        }
    }
    Ok(())
}

fn validate_rate_limits(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    for exchange in &config.exchanges {
        if exchange.requests_per_second == 0 {
            return Err(Report::new(ConfigError::Validation {
                field: format!(
                    "exchanges[\"{}\"].requests_per_second must be > 0",
                    exchange.name
                ),
            }));
        }
    }
    if config.llm.requests_per_second == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "llm.requests_per_second must be > 0".into(),
        }));
    }
    if config.orchestrator.worker_pool_size == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "orchestrator.worker_pool_size must be > 0".into(),
        }));
    }
    Ok(())
}

fn validate_limits(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let limits = &config.limits;
    if limits.premium_subscription_limit < limits.free_subscription_limit {
        return Err(Report::new(ConfigError::Validation {
            field: "limits.premium_subscription_limit must be >= free_subscription_limit".into(),
        }));
    }
    if limits.premium_alert_limit < limits.free_alert_limit {
        return Err(Report::new(ConfigError::Validation {
            field: "limits.premium_alert_limit must be >= free_alert_limit".into(),
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> AppConfig {
        toml::from_str(toml).expect("parse failed")
    }

    #[test]
    fn defaults_applied_when_fields_omitted() {
        let config = parse("");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.data_dir, "./data");
        assert_eq!(config.orchestrator.worker_pool_size, 8);
        assert_eq!(config.llm.model, "deepseek-chat");
        assert!(config.exchanges.is_empty());
        assert_eq!(config.limits.free_subscription_limit, 3);
    }

    #[test]
    fn invalid_exchange_name_rejected() {
        let toml = r#"
[[exchanges]]
name = "upbit"
requests_per_second = 10
"#;
        let config = parse(toml);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn duplicate_exchange_name_rejected() {
        let toml = r#"
[[exchanges]]
name = "binance"
requests_per_second = 10

[[exchanges]]
name = "binance"
requests_per_second = 5
"#;
        let config = parse(toml);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn zero_requests_per_second_rejected() {
        let toml = r#"
[[exchanges]]
name = "binance"
requests_per_second = 0
"#;
        let config = parse(toml);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn premium_limit_below_free_limit_rejected() {
        let toml = r#"
[limits]
free_subscription_limit = 10
premium_subscription_limit = 5
"#;
        let config = parse(toml);
        assert!(validate(&config).is_err());
    }
}
