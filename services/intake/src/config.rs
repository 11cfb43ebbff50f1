use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the intake service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Telegram MTProto session configuration
    pub telegram: TelegramConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Lambda configuration
    pub lambda: LambdaConfig,
    /// Submission ledger configuration
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// User notification configuration
    #[serde(default)]
    pub notifier: NotifierConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Submission processing configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Enable the Prometheus exporter
    #[serde(default)]
    pub metrics_enabled: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Telegram MTProto session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// API ID from my.telegram.org
    pub api_id: i32,
    /// API hash from my.telegram.org
    pub api_hash: String,
    /// Phone number of the receiving account (informational)
    pub phone: Option<String>,
    /// Session file path
    #[serde(default = "default_session_path")]
    pub session_path: PathBuf,
    /// Sign in as a bot when the session is not authorized
    pub bot_sign_in_token: Option<String>,
    /// Maximum number of reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    /// Base delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Download chunk size in bytes (multiple of 4 KiB, at most 512 KiB)
    #[serde(default = "default_download_chunk_size")]
    pub download_chunk_size: i32,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for uploaded videos
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix for uploaded videos
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Part size for multipart uploads in bytes (8MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Lambda configuration for the processing function
#[derive(Debug, Clone, Deserialize)]
pub struct LambdaConfig {
    /// Name or ARN of the video processor function
    pub function_name: String,
    /// AWS region (defaults to the S3 region)
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack)
    pub endpoint_url: Option<String>,
}

/// Ledger backend selection
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    #[default]
    Postgres,
    Memory,
}

/// Submission ledger configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Storage backend
    #[serde(default)]
    pub backend: LedgerBackend,
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Telegram Bot API notification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Bot token; notifications are skipped when absent
    pub bot_token: Option<String>,
    /// Bot API base URL
    #[serde(default = "default_bot_api_base")]
    pub api_base: String,
    /// Request timeout in seconds
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
    /// Also send received/started/welcome messages
    #[serde(default)]
    pub progress_updates: bool,
}

/// API configuration for health and submission endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Per-dependency timeout for /health probes in milliseconds
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
}

/// Submission processing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Submissions processed concurrently
    #[serde(default = "default_max_concurrent_submissions")]
    pub max_concurrent_submissions: usize,
}

// Default value functions
fn default_service_name() -> String {
    "intake-service".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_session_path() -> PathBuf {
    PathBuf::from("sessions/intake.session")
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60000
}

fn default_download_chunk_size() -> i32 {
    512 * 1024
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "temp_videos".to_string()
}

fn default_part_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_bot_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_notify_timeout_secs() -> u64 {
    10
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_health_check_timeout_ms() -> u64 {
    2000
}

fn default_max_concurrent_submissions() -> usize {
    4
}

/// S3 rejects multipart parts smaller than this (except the last one)
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

impl Config {
    /// Load configuration from `.env`, config files and environment
    pub fn load() -> anyhow::Result<Self> {
        // A missing .env is normal in containers
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/intake").required(false))
            .add_source(config::File::with_name("/etc/intake/intake").required(false))
            // Override with environment variables
            // INTAKE__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("INTAKE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.telegram.api_id <= 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "telegram.api_id".to_string(),
                message: "must be a positive integer".to_string(),
            });
        }
        if self.telegram.api_hash.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "telegram.api_hash".to_string(),
            ));
        }
        let chunk = self.telegram.download_chunk_size;
        if chunk <= 0 || chunk % 4096 != 0 || chunk > 512 * 1024 {
            return Err(ConfigValidationError::InvalidValue {
                field: "telegram.download_chunk_size".to_string(),
                message: "must be a multiple of 4096 no larger than 524288".to_string(),
            });
        }
        if self.s3.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }
        if self.lambda.function_name.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "lambda.function_name".to_string(),
            ));
        }
        if self.ledger.backend == LedgerBackend::Postgres {
            if self.ledger.url.is_empty() {
                return Err(ConfigValidationError::MissingField("ledger.url".to_string()));
            }
            normalize_database_url(&self.ledger.url)?;
        }
        if self.pipeline.max_concurrent_submissions == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.max_concurrent_submissions".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

impl TelegramConfig {
    /// Get base reconnection delay as Duration.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Get maximum reconnection delay as Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl LedgerConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl S3Config {
    /// Part size clamped to the S3 minimum
    pub fn effective_part_size(&self) -> usize {
        self.part_size_bytes.max(MIN_PART_SIZE)
    }
}

impl NotifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ApiConfig {
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

/// Rewrite SQLAlchemy-style async URLs into plain PostgreSQL URLs.
pub fn normalize_database_url(url: &str) -> Result<String, ConfigValidationError> {
    if let Some(rest) = url.strip_prefix("postgresql+asyncpg://") {
        Ok(format!("postgresql://{}", rest))
    } else if url.starts_with("postgresql://") || url.starts_with("postgres://") {
        Ok(url.to_string())
    } else {
        Err(ConfigValidationError::InvalidValue {
            field: "ledger.url".to_string(),
            message: format!(
                "unsupported database URL scheme: {}",
                url.split("://").next().unwrap_or(url)
            ),
        })
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_enabled: false,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::default(),
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_bot_api_base(),
            timeout_secs: default_notify_timeout_secs(),
            progress_updates: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: false,
            cors_origins: Vec::new(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_submissions: default_max_concurrent_submissions(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
