use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use domain::models::ReadinessThresholds;
use domain::services::{AggregationRules, PipelineSettings, RetryPolicy};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Allowed CORS origins. Empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Connection settings for the carbon-credit registry.
#[derive(Clone, Deserialize)]
pub struct RegistryConfig {
    pub base_url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Upper bound on each registry call, in seconds.
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,

    /// Policy block tag that accepts energy reports.
    #[serde(default = "default_tag_name")]
    pub tag_name: String,
}

// Keep the password out of logs.
impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .field("tag_name", &self.tag_name)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,

    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,

    #[serde(default = "default_true")]
    pub jitter_enabled: bool,

    /// Jitter spread as a fraction of the computed delay.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            exponential_base: default_exponential_base(),
            jitter_enabled: true,
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_min_completeness")]
    pub min_completeness_percent: f64,

    #[serde(default = "default_min_integrity")]
    pub min_integrity_score: f64,

    #[serde(default = "default_min_readings")]
    pub min_readings: u32,

    #[serde(default = "default_min_energy")]
    pub min_energy_kwh: f64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            min_completeness_percent: default_min_completeness(),
            min_integrity_score: default_min_integrity(),
            min_readings: default_min_readings(),
            min_energy_kwh: default_min_energy(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_rated_capacity")]
    pub rated_capacity_w: f64,

    #[serde(default = "default_nominal_voltage")]
    pub nominal_voltage: f64,

    #[serde(default = "default_nominal_frequency")]
    pub nominal_frequency: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            rated_capacity_w: default_rated_capacity(),
            nominal_voltage: default_nominal_voltage(),
            nominal_frequency: default_nominal_frequency(),
        }
    }
}

/// Background job settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Whether background jobs run at all.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_submissions: usize,

    /// UTC hour after which the previous day is submitted.
    #[serde(default = "default_daily_hour")]
    pub daily_submission_hour: u32,

    #[serde(default)]
    pub default_policy_id: String,

    /// When non-empty, only these devices are submitted.
    #[serde(default)]
    pub enabled_devices: Vec<String>,

    #[serde(default)]
    pub excluded_devices: Vec<String>,

    #[serde(default = "default_progress_poll_minutes")]
    pub progress_poll_minutes: u64,

    #[serde(default = "default_retry_failed_max_age")]
    pub retry_failed_max_age_hours: i64,

    /// Polling gives up on a PROCESSING record after this long.
    #[serde(default = "default_max_processing_hours")]
    pub max_processing_hours: i64,

    #[serde(default = "default_max_resubmissions")]
    pub max_resubmissions: u32,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Records examined per job run.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent_submissions: default_max_concurrent(),
            daily_submission_hour: default_daily_hour(),
            default_policy_id: String::new(),
            enabled_devices: Vec::new(),
            excluded_devices: Vec::new(),
            progress_poll_minutes: default_progress_poll_minutes(),
            retry_failed_max_age_hours: default_retry_failed_max_age(),
            max_processing_hours: default_max_processing_hours(),
            max_resubmissions: default_max_resubmissions(),
            retention_days: default_retention_days(),
            batch_size: default_batch_size(),
        }
    }
}

impl SchedulerConfig {
    /// Whether the daily job should submit this device.
    pub fn device_selected(&self, device_id: &str) -> bool {
        let excluded: BTreeSet<&str> = self.excluded_devices.iter().map(String::as_str).collect();
        if excluded.contains(device_id) {
            return false;
        }
        self.enabled_devices.is_empty() || self.enabled_devices.iter().any(|d| d == device_id)
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_registry_timeout() -> u64 {
    30
}
fn default_tag_name() -> String {
    "renewable_energy".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    60.0
}
fn default_exponential_base() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}
fn default_jitter_fraction() -> f64 {
    0.1
}
fn default_min_completeness() -> f64 {
    80.0
}
fn default_min_integrity() -> f64 {
    0.7
}
fn default_min_readings() -> u32 {
    100
}
fn default_min_energy() -> f64 {
    0.1
}
fn default_rated_capacity() -> f64 {
    5000.0
}
fn default_nominal_voltage() -> f64 {
    220.0
}
fn default_nominal_frequency() -> f64 {
    50.0
}
fn default_max_concurrent() -> usize {
    5
}
fn default_daily_hour() -> u32 {
    1
}
fn default_progress_poll_minutes() -> u64 {
    15
}
fn default_retry_failed_max_age() -> i64 {
    24
}
fn default_max_processing_hours() -> i64 {
    72
}
fn default_max_resubmissions() -> u32 {
    3
}
fn default_retention_days() -> i64 {
    90
}
fn default_batch_size() -> i64 {
    100
}

/// Configuration validation error
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Loading order (later sources override earlier):
    /// 1. config/default.toml - base configuration with defaults
    /// 2. config/local.toml - local overrides (optional, not in git)
    /// 3. Environment variables with ER__ prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("ER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .with_list_parse_key("scheduler.enabled_devices")
                    .with_list_parse_key("scheduler.excluded_devices")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Self = config.try_deserialize()?;
        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    /// Load configuration for testing with custom overrides.
    ///
    /// Defaults are embedded so tests do not depend on the working directory.
    pub fn load_for_test(overrides: &[(&str, &str)]) -> Result<Self, config::ConfigError> {
        let defaults = r#"
            [server]
            host = "0.0.0.0"
            port = 8080
            request_timeout_secs = 30

            [database]
            url = ""
            max_connections = 20
            min_connections = 5
            connect_timeout_secs = 10
            idle_timeout_secs = 600

            [logging]
            level = "info"
            format = "json"

            [registry]
            base_url = "http://localhost:3000"
            username = "test"
            password = "test"
            timeout_secs = 5
            tag_name = "renewable_energy"

            [retry]
            max_retries = 3
            base_delay_secs = 1.0
            max_delay_secs = 60.0
            exponential_base = 2.0
            jitter_enabled = true
            jitter_fraction = 0.1

            [readiness]
            min_completeness_percent = 80.0
            min_integrity_score = 0.7
            min_readings = 100
            min_energy_kwh = 0.1

            [aggregation]
            rated_capacity_w = 5000.0
            nominal_voltage = 220.0
            nominal_frequency = 50.0

            [scheduler]
            enabled = false
            max_concurrent_submissions = 5
            daily_submission_hour = 1
            default_policy_id = "policy-test"
        "#;

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(defaults, config::FileFormat::Toml));

        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }

        // Validation is left to the caller so tests can build partial configs.
        builder.build()?.try_deserialize()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "ER__DATABASE__URL environment variable must be set".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "Server port cannot be 0".to_string(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigValidationError::InvalidValue(
                "min_connections cannot exceed max_connections".to_string(),
            ));
        }

        let base_url = self.registry.base_url.trim();
        if base_url.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "ER__REGISTRY__BASE_URL environment variable must be set".to_string(),
            ));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigValidationError::InvalidValue(
                "registry.base_url must start with http:// or https://".to_string(),
            ));
        }
        if self.registry.username.is_empty() || self.registry.password.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "ER__REGISTRY__USERNAME and ER__REGISTRY__PASSWORD must be set".to_string(),
            ));
        }
        if self.registry.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "registry.timeout_secs must be positive".to_string(),
            ));
        }

        let retry = &self.retry;
        if !(retry.base_delay_secs.is_finite() && retry.base_delay_secs >= 0.0)
            || !(retry.max_delay_secs.is_finite() && retry.max_delay_secs >= retry.base_delay_secs)
        {
            return Err(ConfigValidationError::InvalidValue(
                "retry delays must be non-negative and max_delay_secs >= base_delay_secs"
                    .to_string(),
            ));
        }
        if !(retry.exponential_base.is_finite() && retry.exponential_base >= 1.0) {
            return Err(ConfigValidationError::InvalidValue(
                "retry.exponential_base must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter_fraction) {
            return Err(ConfigValidationError::InvalidValue(
                "retry.jitter_fraction must be within [0, 1]".to_string(),
            ));
        }

        if self.aggregation.rated_capacity_w <= 0.0 {
            return Err(ConfigValidationError::InvalidValue(
                "aggregation.rated_capacity_w must be positive".to_string(),
            ));
        }

        let scheduler = &self.scheduler;
        if scheduler.max_concurrent_submissions == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "scheduler.max_concurrent_submissions must be at least 1".to_string(),
            ));
        }
        if scheduler.daily_submission_hour > 23 {
            return Err(ConfigValidationError::InvalidValue(
                "scheduler.daily_submission_hour must be within 0..=23".to_string(),
            ));
        }
        if scheduler.enabled && scheduler.default_policy_id.trim().is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "scheduler.default_policy_id is required when the scheduler is enabled"
                    .to_string(),
            ));
        }
        if scheduler.progress_poll_minutes == 0 || scheduler.batch_size <= 0 {
            return Err(ConfigValidationError::InvalidValue(
                "scheduler.progress_poll_minutes and scheduler.batch_size must be positive"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }

    pub fn pool_config(&self) -> persistence::db::DatabaseConfig {
        persistence::db::DatabaseConfig {
            url: self.database.url.clone(),
            max_connections: self.database.max_connections,
            min_connections: self.database.min_connections,
            connect_timeout_secs: self.database.connect_timeout_secs,
            idle_timeout_secs: self.database.idle_timeout_secs,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_secs_f64(self.retry.base_delay_secs),
            max_delay: Duration::from_secs_f64(self.retry.max_delay_secs),
            exponential_base: self.retry.exponential_base,
            jitter_enabled: self.retry.jitter_enabled,
            jitter_fraction: self.retry.jitter_fraction,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            call_timeout: Duration::from_secs(self.registry.timeout_secs),
            max_processing_age: chrono::Duration::hours(self.scheduler.max_processing_hours),
            max_resubmissions: self.scheduler.max_resubmissions,
        }
    }

    pub fn readiness_thresholds(&self) -> ReadinessThresholds {
        ReadinessThresholds {
            min_completeness_percent: self.readiness.min_completeness_percent,
            min_integrity_score: self.readiness.min_integrity_score,
            min_readings: self.readiness.min_readings,
            min_energy_kwh: self.readiness.min_energy_kwh,
        }
    }

    pub fn aggregation_rules(&self) -> AggregationRules {
        AggregationRules::for_grid(
            self.aggregation.nominal_voltage,
            self.aggregation.nominal_frequency,
        )
        .with_rated_capacity(self.aggregation.rated_capacity_w)
    }
}
