use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Main configuration for the transcript processor
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Work queue configuration
    pub queue: QueueConfig,
    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Result persistence configuration
    #[serde(default)]
    pub results: ResultsConfig,
    /// Analysis service configuration
    pub analysis: AnalysisConfig,
    /// Bulk upload worker configuration
    pub upload_worker: UploadWorkerConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Seconds between queue drain cycles
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
}

/// Work queue (SQS) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue URL
    pub queue_url: String,
    /// AWS region of the queue
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack, ElasticMQ, etc.)
    pub endpoint_url: Option<String>,
    /// Long-poll wait in seconds (0-20)
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,
    /// Messages requested per receive (1-10)
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    /// Message group for FIFO queues
    #[serde(default = "default_message_group_id")]
    pub message_group_id: String,
    /// Upper bound on messages handled by one drain cycle
    #[serde(default = "default_max_messages_per_drain")]
    pub max_messages_per_drain: usize,
    /// Deadline for download, analysis and persistence of one message
    #[serde(default = "default_message_timeout_secs")]
    pub message_timeout_secs: u64,
}

/// Object storage (S3) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Static access key; falls back to the default provider chain when unset
    pub access_key_id: Option<String>,
    /// Static secret key, required together with `access_key_id`
    pub secret_access_key: Option<String>,
    /// Local directory for staged downloads
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// How much of a processing result gets persisted
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistMode {
    /// Result JSON only, local
    JsonOnly,
    /// Result JSON plus summary/quiz text, with the text files mirrored remotely
    #[default]
    Full,
}

/// Result persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsConfig {
    /// Root of the local result tree
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Persistence mode
    #[serde(default)]
    pub mode: PersistMode,
}

/// Analysis service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Bearer token for the service
    pub api_key: String,
    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_analysis_base_url")]
    pub base_url: String,
    /// Model name
    #[serde(default = "default_analysis_model")]
    pub model: String,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion token limit
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// HTTP timeout in seconds
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
    /// Word limit requested for the summary
    #[serde(default = "default_summary_word_limit")]
    pub summary_word_limit: u32,
    /// Number of quiz questions requested
    #[serde(default = "default_question_count")]
    pub question_count: u32,
    /// Options per question requested
    #[serde(default = "default_options_per_question")]
    pub options_per_question: u32,
}

/// Bulk upload worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadWorkerConfig {
    /// Destination bucket for directory mirrors
    pub bucket: String,
    /// Pause after each directory upload
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Queue each acknowledged result directory for mirroring
    #[serde(default)]
    pub mirror_results: bool,
}

// Default value functions
fn default_service_name() -> String {
    "transcript-processor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_drain_interval_secs() -> u64 {
    60
}

fn default_region() -> String {
    "ap-south-1".to_string()
}

fn default_wait_time_secs() -> u64 {
    10
}

fn default_max_messages() -> u32 {
    1
}

fn default_message_group_id() -> String {
    "default".to_string()
}

fn default_max_messages_per_drain() -> usize {
    1000
}

fn default_message_timeout_secs() -> u64 {
    600
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("Data")
}

fn default_analysis_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_analysis_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_analysis_timeout_secs() -> u64 {
    120
}

fn default_summary_word_limit() -> u32 {
    100
}

fn default_question_count() -> u32 {
    10
}

fn default_options_per_question() -> u32 {
    4
}

fn default_cooldown_secs() -> u64 {
    20
}

/// S3 rejects multipart parts smaller than this, except the last one
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/processor").required(false))
            .add_source(
                config::File::with_name("/etc/transcript-processor/processor").required(false),
            )
            // Override with environment variables
            // PROCESSOR__QUEUE__QUEUE_URL -> queue.queue_url
            .add_source(
                config::Environment::with_prefix("PROCESSOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check required values and provider limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.queue_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("queue.queue_url".into()));
        }
        if self.analysis.api_key.trim().is_empty() {
            return Err(ConfigError::MissingRequired("analysis.api_key".into()));
        }
        if self.upload_worker.bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired("upload_worker.bucket".into()));
        }

        match (&self.storage.access_key_id, &self.storage.secret_access_key) {
            (Some(_), None) => {
                return Err(ConfigError::MissingRequired(
                    "storage.secret_access_key".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(ConfigError::MissingRequired("storage.access_key_id".into()))
            }
            _ => {}
        }

        if self.queue.wait_time_secs > 20 {
            return Err(ConfigError::InvalidValue {
                key: "queue.wait_time_secs".into(),
                message: format!("{} exceeds the 20 second maximum", self.queue.wait_time_secs),
            });
        }
        if !(1..=10).contains(&self.queue.max_messages) {
            return Err(ConfigError::InvalidValue {
                key: "queue.max_messages".into(),
                message: format!("{} is outside 1..=10", self.queue.max_messages),
            });
        }
        for (key, value) in [
            ("service.drain_interval_secs", self.service.drain_interval_secs),
            ("queue.max_messages_per_drain", self.queue.max_messages_per_drain as u64),
            ("queue.message_timeout_secs", self.queue.message_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: "must be greater than zero".into(),
                });
            }
        }
        if self.storage.part_size_bytes < MIN_PART_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "storage.part_size_bytes".into(),
                message: format!("must be at least {} bytes", MIN_PART_SIZE),
            });
        }

        Ok(())
    }

    /// Long-poll wait as Duration
    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.queue.wait_time_secs)
    }

    /// Per-message processing deadline as Duration
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.message_timeout_secs)
    }

    /// Interval between drain cycles as Duration
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.service.drain_interval_secs)
    }

    /// Cooldown after each directory upload as Duration
    pub fn upload_cooldown(&self) -> Duration {
        Duration::from_secs(self.upload_worker.cooldown_secs)
    }
}

impl AnalysisConfig {
    /// Per-request HTTP timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            drain_interval_secs: default_drain_interval_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            staging_dir: default_staging_dir(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            mode: PersistMode::default(),
        }
    }
}
