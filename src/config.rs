use config::{Case, Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Longest accepted window or reset interval
const MAX_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database URL (SQLite connection string)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Maximum pooled database connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// API key for admin endpoints (optional - if not set, no auth required)
    #[serde(default)]
    pub admin_api_key: Option<String>,

    /// Daily quota policy
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Reset job configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaConfig {
    /// Selections per window for new records
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Window length in seconds
    #[serde(default = "default_day_secs")]
    pub interval_secs: u64,

    /// Extra attempts after an optimistic write conflict
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Records fetched per page during reset passes
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            interval_secs: default_day_secs(),
            max_conflict_retries: default_max_conflict_retries(),
            scan_page_size: default_scan_page_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Whether the reset job runs
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between reset passes (ignored when `cron` is set)
    #[serde(default = "default_day_secs")]
    pub interval_secs: u64,

    /// Cron expression (e.g., "0 0 0 * * *" for midnight daily)
    #[serde(default)]
    pub cron: Option<String>,

    /// IANA timezone for `cron` (e.g., "Asia/Jakarta")
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_day_secs(),
            cron: None,
            timezone: default_timezone(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_database_url() -> String {
    "sqlite:data/daily_quota.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_capacity() -> u32 {
    10
}

fn default_day_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_conflict_retries() -> u32 {
    3
}

fn default_scan_page_size() -> u32 {
    500
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = Config::builder()
            // Start with default values
            .set_default("host", default_host())?
            .set_default("port", default_port())?
            // Load from config file if present
            .add_source(File::with_name("config").required(false))
            .add_source(File::with_name("config.local").required(false))
            // Override with environment variables (prefixed with DAILY_QUOTA_)
            // Convert SCREAMING_SNAKE_CASE env vars to snake_case config keys
            .add_source(
                Environment::with_prefix("DAILY_QUOTA")
                    .prefix_separator("_")
                    .separator("__")
                    .convert_case(Case::Snake)
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.quota.capacity == 0 {
            return Err(ConfigError::Message(
                "quota.capacity must be at least 1".to_string(),
            ));
        }
        if self.quota.interval_secs == 0 {
            return Err(ConfigError::Message(
                "quota.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.quota.interval_secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::Message(format!(
                "quota.interval_secs must be at most {} (one year)",
                MAX_INTERVAL_SECS
            )));
        }
        if self.scheduler.interval_secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::Message(format!(
                "scheduler.interval_secs must be at most {} (one year)",
                MAX_INTERVAL_SECS
            )));
        }
        Ok(())
    }

    /// Window length as a chrono duration
    pub fn quota_interval(&self) -> chrono::Duration {
        i64::try_from(self.quota.interval_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::seconds(default_day_secs() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Result<AppConfig, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.quota.capacity, 10);
        assert_eq!(config.quota.interval_secs, 86400);
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.interval_secs, 86400);
        assert!(config.scheduler.cron.is_none());
        assert_eq!(config.quota_interval(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_overrides() {
        let config = parse(
            r#"
            admin_api_key = "secret"

            [quota]
            capacity = 25
            interval_secs = 3600

            [scheduler]
            cron = "0 0 0 * * *"
            timezone = "Asia/Jakarta"
            "#,
        )
        .unwrap();
        assert_eq!(config.admin_api_key.as_deref(), Some("secret"));
        assert_eq!(config.quota.capacity, 25);
        assert_eq!(config.quota_interval(), chrono::Duration::hours(1));
        assert_eq!(config.scheduler.timezone, "Asia/Jakarta");
    }

    #[test]
    fn test_rejects_zero_capacity() {
        assert!(parse("[quota]\ncapacity = 0").is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        assert!(parse("[quota]\ninterval_secs = 0").is_err());
    }

    #[test]
    fn test_rejects_oversized_intervals() {
        assert!(parse("[quota]\ninterval_secs = 10000000000000").is_err());
        assert!(parse("[scheduler]\ninterval_secs = 10000000000000").is_err());

        let config = parse("[quota]\ninterval_secs = 31622400").unwrap();
        assert_eq!(config.quota_interval(), chrono::Duration::days(366));
    }
}
