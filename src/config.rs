use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

const CONFIG_DIR: &str = "config";
const DEFAULT_ENV: &str = "dev";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Application configuration. Every field maps to one environment
/// variable (uppercased field name) and carries a built-in default, so
/// the service boots with no environment at all.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    // Server
    pub app_port: u16,
    pub env_name: String,
    pub service_name: String,
    #[validate(custom = "validate_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,

    // Backend
    pub aws_region: String,
    pub dynamodb_table: String,
    #[serde(default)]
    pub dynamodb_endpoint: Option<String>,
    pub eventbridge_enabled: bool,
    pub eventbridge_bus_name: String,
    pub eventbridge_source: String,
    #[serde(default)]
    pub event_channel_capacity: Option<usize>,

    // Limits
    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,
    pub max_request_size: usize,

    // Idempotency
    pub idempotency_enabled: bool,
    #[validate(custom = "validate_duration")]
    pub idempotency_ttl: String,
    #[serde(default)]
    pub idempotency_required: bool,
    #[serde(default = "default_idempotency_backend")]
    pub idempotency_backend: String,
    #[serde(default)]
    pub redis_url: Option<String>,

    // Resilience
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_failure_threshold: usize,
    pub circuit_breaker_success_threshold: usize,
    #[validate(custom = "validate_duration")]
    pub circuit_breaker_timeout: String,
    pub retry_max_attempts: u32,
    #[validate(custom = "validate_duration")]
    pub retry_initial_delay: String,
    #[validate(custom = "validate_duration")]
    pub retry_max_delay: String,
    #[validate(custom = "validate_duration")]
    pub dynamodb_read_timeout: String,
    #[validate(custom = "validate_duration")]
    pub dynamodb_write_timeout: String,

    // Shutdown
    #[validate(custom = "validate_duration")]
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

fn default_idempotency_backend() -> String {
    "in-memory".to_string()
}

fn default_shutdown_timeout() -> String {
    "30s".to_string()
}

impl AppConfig {
    pub fn idempotency_ttl(&self) -> Duration {
        duration_or(&self.idempotency_ttl, Duration::from_secs(24 * 3600))
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        duration_or(&self.circuit_breaker_timeout, Duration::from_secs(30))
    }

    pub fn retry_initial_delay(&self) -> Duration {
        duration_or(&self.retry_initial_delay, Duration::from_millis(100))
    }

    pub fn retry_max_delay(&self) -> Duration {
        duration_or(&self.retry_max_delay, Duration::from_secs(5))
    }

    pub fn dynamodb_read_timeout(&self) -> Duration {
        duration_or(&self.dynamodb_read_timeout, Duration::from_millis(500))
    }

    pub fn dynamodb_write_timeout(&self) -> Duration {
        duration_or(&self.dynamodb_write_timeout, Duration::from_secs(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        duration_or(&self.shutdown_timeout, Duration::from_secs(30))
    }

    pub fn event_channel_capacity(&self) -> usize {
        self.event_channel_capacity.unwrap_or(1024)
    }
}

fn duration_or(value: &str, fallback: Duration) -> Duration {
    parse_duration(value).unwrap_or(fallback)
}

/// Parses durations like `100ms`, `30s`, `5m`, `24h`. A bare number is
/// seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (number, unit) = match value.find(|c: char| c.is_ascii_alphabetic()) {
        Some(index) => value.split_at(index),
        None => (value, "s"),
    };
    let number: f64 = number.trim().parse().ok()?;
    if number < 0.0 {
        return None;
    }
    let duration = match unit.trim() {
        "ms" => Duration::from_secs_f64(number / 1000.0),
        "s" => Duration::from_secs_f64(number),
        "m" => Duration::from_secs_f64(number * 60.0),
        "h" => Duration::from_secs_f64(number * 3600.0),
        _ => return None,
    };
    Some(duration)
}

fn validate_duration(value: &str) -> Result<(), ValidationError> {
    parse_duration(value)
        .map(|_| ())
        .ok_or_else(|| ValidationError::new("invalid_duration"))
}

fn validate_log_level(value: &str) -> Result<(), ValidationError> {
    match value {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")),
    }
}

/// Loads configuration: built-in defaults, then optional
/// `config/{default,<env>}.toml` files, then environment variables.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("ENV_NAME").unwrap_or_else(|_| DEFAULT_ENV.to_string());
    if Path::new(CONFIG_DIR).exists() {
        info!(environment = %run_env, "layering configuration files");
    }

    let builder = Config::builder()
        .set_default("app_port", 8080)?
        .set_default("env_name", DEFAULT_ENV)?
        .set_default("service_name", "cart-service")?
        .set_default("log_level", "info")?
        .set_default("aws_region", "us-east-1")?
        .set_default("dynamodb_table", "carts")?
        .set_default("eventbridge_enabled", true)?
        .set_default("eventbridge_bus_name", "default")?
        .set_default("eventbridge_source", "cart-service")?
        .set_default("rate_limit_rps", 100)?
        .set_default("rate_limit_burst", 200)?
        .set_default("max_request_size", 1_048_576)?
        .set_default("idempotency_enabled", true)?
        .set_default("idempotency_ttl", "24h")?
        .set_default("circuit_breaker_enabled", true)?
        .set_default("circuit_breaker_failure_threshold", 5)?
        .set_default("circuit_breaker_success_threshold", 3)?
        .set_default("circuit_breaker_timeout", "30s")?
        .set_default("retry_max_attempts", 3)?
        .set_default("retry_initial_delay", "100ms")?
        .set_default("retry_max_delay", "5s")?
        .set_default("dynamodb_read_timeout", "500ms")?
        .set_default("dynamodb_write_timeout", "1s")?
        .add_source(File::with_name(&format!("{CONFIG_DIR}/default")).required(false))
        .add_source(File::with_name(&format!("{CONFIG_DIR}/{run_env}")).required(false))
        .add_source(Environment::default());

    let config = builder.build()?;
    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("configuration validation failed: {e:?}");
        AppConfigError::Validation(e)
    })?;

    Ok(app_config)
}

/// Initializes the tracing subscriber with the configured default level.
/// `RUST_LOG` overrides when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("cart_api={level},tower_http=info");
    let filter = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(EnvFilter::new(filter)).json().try_init();
    } else {
        let _ = fmt().with_env_filter(EnvFilter::new(filter)).try_init();
    }
}
