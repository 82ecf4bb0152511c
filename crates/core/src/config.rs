use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub experiments: ExperimentsConfig,
    pub signals: SignalsConfig,
    pub logging: LoggingConfig,
    pub environment: Environment,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ExperimentsConfig {
    pub store_timeout_ms: u64,
    pub default_event_limit: u32,
    pub debug_assignment_limit: u32,
    pub default_candidates: Vec<f64>,
}

impl ExperimentsConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[derive(Clone, Debug)]
pub struct SignalsConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<SecretString>,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_multiplier: u32,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// Detailed error messages are only returned to callers in development.
    pub fn exposes_error_details(&self) -> bool {
        matches!(self, Self::Development)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub environment: Option<Environment>,
    pub store_timeout_ms: Option<u64>,
    pub signals_enabled: Option<bool>,
    pub signals_webhook_url: Option<String>,
    pub signals_webhook_secret: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://pricewise.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            experiments: ExperimentsConfig {
                store_timeout_ms: 2_000,
                default_event_limit: 50_000,
                debug_assignment_limit: 1_000,
                default_candidates: vec![19.99, 29.99],
            },
            signals: SignalsConfig {
                enabled: false,
                webhook_url: None,
                webhook_secret: None,
                queue_capacity: 1_024,
                max_retries: 3,
                retry_base_delay_ms: 200,
                retry_backoff_multiplier: 2,
                request_timeout_secs: 5,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            environment: Environment::Development,
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::Validation(format!(
                "unsupported environment `{other}` (expected development|production)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("pricewise.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(experiments) = patch.experiments {
            if let Some(store_timeout_ms) = experiments.store_timeout_ms {
                self.experiments.store_timeout_ms = store_timeout_ms;
            }
            if let Some(default_event_limit) = experiments.default_event_limit {
                self.experiments.default_event_limit = default_event_limit;
            }
            if let Some(debug_assignment_limit) = experiments.debug_assignment_limit {
                self.experiments.debug_assignment_limit = debug_assignment_limit;
            }
            if let Some(default_candidates) = experiments.default_candidates {
                self.experiments.default_candidates = default_candidates;
            }
        }

        if let Some(signals) = patch.signals {
            if let Some(enabled) = signals.enabled {
                self.signals.enabled = enabled;
            }
            if let Some(webhook_url) = signals.webhook_url {
                self.signals.webhook_url = Some(webhook_url);
            }
            if let Some(webhook_secret_value) = signals.webhook_secret {
                self.signals.webhook_secret = Some(secret_value(webhook_secret_value));
            }
            if let Some(queue_capacity) = signals.queue_capacity {
                self.signals.queue_capacity = queue_capacity;
            }
            if let Some(max_retries) = signals.max_retries {
                self.signals.max_retries = max_retries;
            }
            if let Some(retry_base_delay_ms) = signals.retry_base_delay_ms {
                self.signals.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(retry_backoff_multiplier) = signals.retry_backoff_multiplier {
                self.signals.retry_backoff_multiplier = retry_backoff_multiplier;
            }
            if let Some(request_timeout_secs) = signals.request_timeout_secs {
                self.signals.request_timeout_secs = request_timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(environment) = patch.environment {
            self.environment = environment;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PRICEWISE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("PRICEWISE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("PRICEWISE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("PRICEWISE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PRICEWISE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PRICEWISE_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("PRICEWISE_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("PRICEWISE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("PRICEWISE_EXPERIMENTS_STORE_TIMEOUT_MS") {
            self.experiments.store_timeout_ms =
                parse_u64("PRICEWISE_EXPERIMENTS_STORE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_EXPERIMENTS_DEFAULT_EVENT_LIMIT") {
            self.experiments.default_event_limit =
                parse_u32("PRICEWISE_EXPERIMENTS_DEFAULT_EVENT_LIMIT", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_EXPERIMENTS_DEBUG_ASSIGNMENT_LIMIT") {
            self.experiments.debug_assignment_limit =
                parse_u32("PRICEWISE_EXPERIMENTS_DEBUG_ASSIGNMENT_LIMIT", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_EXPERIMENTS_DEFAULT_CANDIDATES") {
            self.experiments.default_candidates =
                parse_f64_list("PRICEWISE_EXPERIMENTS_DEFAULT_CANDIDATES", &value)?;
        }

        if let Some(value) = read_env("PRICEWISE_SIGNALS_ENABLED") {
            self.signals.enabled = parse_bool("PRICEWISE_SIGNALS_ENABLED", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_SIGNALS_WEBHOOK_URL") {
            self.signals.webhook_url = Some(value);
        }
        if let Some(value) = read_env("PRICEWISE_SIGNALS_WEBHOOK_SECRET") {
            self.signals.webhook_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("PRICEWISE_SIGNALS_QUEUE_CAPACITY") {
            self.signals.queue_capacity =
                parse_u32("PRICEWISE_SIGNALS_QUEUE_CAPACITY", &value)? as usize;
        }
        if let Some(value) = read_env("PRICEWISE_SIGNALS_MAX_RETRIES") {
            self.signals.max_retries = parse_u32("PRICEWISE_SIGNALS_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_SIGNALS_RETRY_BASE_DELAY_MS") {
            self.signals.retry_base_delay_ms =
                parse_u64("PRICEWISE_SIGNALS_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_SIGNALS_RETRY_BACKOFF_MULTIPLIER") {
            self.signals.retry_backoff_multiplier =
                parse_u32("PRICEWISE_SIGNALS_RETRY_BACKOFF_MULTIPLIER", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_SIGNALS_REQUEST_TIMEOUT_SECS") {
            self.signals.request_timeout_secs =
                parse_u64("PRICEWISE_SIGNALS_REQUEST_TIMEOUT_SECS", &value)?;
        }

        let log_level =
            read_env("PRICEWISE_LOGGING_LEVEL").or_else(|| read_env("PRICEWISE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PRICEWISE_LOGGING_FORMAT").or_else(|| read_env("PRICEWISE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        if let Some(value) = read_env("PRICEWISE_ENVIRONMENT") {
            self.environment = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(environment) = overrides.environment {
            self.environment = environment;
        }
        if let Some(store_timeout_ms) = overrides.store_timeout_ms {
            self.experiments.store_timeout_ms = store_timeout_ms;
        }
        if let Some(enabled) = overrides.signals_enabled {
            self.signals.enabled = enabled;
        }
        if let Some(webhook_url) = overrides.signals_webhook_url {
            self.signals.webhook_url = Some(webhook_url);
        }
        if let Some(webhook_secret) = overrides.signals_webhook_secret {
            self.signals.webhook_secret = Some(secret_value(webhook_secret));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_experiments(&self.experiments)?;
        validate_signals(&self.signals)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("pricewise.toml"), PathBuf::from("config/pricewise.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_experiments(experiments: &ExperimentsConfig) -> Result<(), ConfigError> {
    if experiments.store_timeout_ms == 0 || experiments.store_timeout_ms > 60_000 {
        return Err(ConfigError::Validation(
            "experiments.store_timeout_ms must be in range 1..=60000".to_string(),
        ));
    }

    if experiments.default_event_limit == 0 {
        return Err(ConfigError::Validation(
            "experiments.default_event_limit must be greater than zero".to_string(),
        ));
    }

    if experiments.debug_assignment_limit == 0 {
        return Err(ConfigError::Validation(
            "experiments.debug_assignment_limit must be greater than zero".to_string(),
        ));
    }

    let usable = experiments
        .default_candidates
        .iter()
        .filter(|value| value.is_finite() && **value >= 0.0)
        .count();
    if usable == 0 || usable != experiments.default_candidates.len() {
        return Err(ConfigError::Validation(
            "experiments.default_candidates must be a non-empty list of finite prices >= 0"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_signals(signals: &SignalsConfig) -> Result<(), ConfigError> {
    if signals.queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "signals.queue_capacity must be greater than zero".to_string(),
        ));
    }

    if signals.request_timeout_secs == 0 || signals.request_timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "signals.request_timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    if signals.retry_backoff_multiplier == 0 {
        return Err(ConfigError::Validation(
            "signals.retry_backoff_multiplier must be greater than zero".to_string(),
        ));
    }

    if let Some(url) = &signals.webhook_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "signals.webhook_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if signals.enabled {
        if signals.webhook_url.is_none() {
            return Err(ConfigError::Validation(
                "signals.enabled is true but signals.webhook_url is not configured".to_string(),
            ));
        }

        let missing_secret = signals
            .webhook_secret
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing_secret {
            return Err(ConfigError::Validation(
                "signals.webhook_secret is required when signals are enabled".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

fn parse_f64_list(key: &str, value: &str) -> Result<Vec<f64>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.parse::<f64>().map_err(|_| invalid_override(key, value)))
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    experiments: Option<ExperimentsPatch>,
    signals: Option<SignalsPatch>,
    logging: Option<LoggingPatch>,
    environment: Option<Environment>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ExperimentsPatch {
    store_timeout_ms: Option<u64>,
    default_event_limit: Option<u32>,
    debug_assignment_limit: Option<u32>,
    default_candidates: Option<Vec<f64>>,
}

#[derive(Debug, Default, Deserialize)]
struct SignalsPatch {
    enabled: Option<bool>,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    queue_capacity: Option<usize>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_backoff_multiplier: Option<u32>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
