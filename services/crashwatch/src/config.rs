use crate::detection::TimeoutPolicy;
use crate::resolver::DetectionPolicy;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Errors raised while loading or validating configuration.
///
/// Every variant is fatal: an invocation never starts with a bad config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

/// Main configuration for the crashwatch services
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Object storage configuration
    pub storage: StorageConfig,
    /// Frame extraction configuration
    pub extraction: ExtractionConfig,
    /// Crash detection configuration
    pub detection: DetectionConfig,
    /// Notification configuration
    pub notification: NotificationConfig,
    /// Downstream workflow configuration
    pub orchestration: OrchestrationConfig,
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
    /// Health check port
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying video upload notifications
    #[serde(default = "default_upload_topic")]
    pub upload_topic: String,
    /// Topic carrying frame-ready notifications and workflow payloads
    #[serde(default = "default_frames_topic")]
    pub frames_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// Times a message that failed fatally is redelivered before it is dropped
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    /// Delay before the first redelivery, doubled on each further attempt
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket receiving uploaded videos
    pub raw_bucket: String,
    /// Bucket receiving extracted frames and evidence images
    pub processed_bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Concurrent uploads/deletes per invocation
    #[serde(default = "default_transfer_concurrency")]
    pub transfer_concurrency: usize,
}

/// Frame extraction configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// Frames per second of source video, as a numeric string
    pub frame_rate: String,
    /// Path to the ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Key prefix under which frames are stored
    #[serde(default = "default_frame_prefix")]
    pub frame_prefix: String,
}

/// Crash detection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Minimum confidence (0-100), as a numeric string
    pub min_confidence: String,
    /// Classifier model identifier
    pub model_arn: String,
    /// Label that marks a crash
    #[serde(default = "default_label_name")]
    pub label_name: String,
    /// Which qualifying frame becomes the evidence frame
    #[serde(default)]
    pub policy: DetectionPolicy,
    /// Concurrent fetch+classify calls per batch
    #[serde(default = "default_classify_concurrency")]
    pub classify_concurrency: usize,
    /// Per-frame classification timeout in seconds
    #[serde(default = "default_classify_timeout_secs")]
    pub classify_timeout_secs: u64,
    /// What a timed-out classification means for the batch
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
}

/// Notification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Notification topic identifier
    pub topic_arn: String,
    /// Announce each finished extraction run
    #[serde(default)]
    pub notify_on_extraction: bool,
}

/// Downstream workflow configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrationConfig {
    /// Workflow (state machine) identifier
    pub state_machine_arn: String,
}

// Default value functions
fn default_service_name() -> String {
    "crashwatch".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_health_port() -> u16 {
    8080
}

fn default_consumer_group() -> String {
    "crashwatch".to_string()
}

fn default_upload_topic() -> String {
    "crashwatch.uploads".to_string()
}

fn default_frames_topic() -> String {
    "crashwatch.frames".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_max_redeliveries() -> u32 {
    3
}

fn default_redelivery_backoff_ms() -> u64 {
    1000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_transfer_concurrency() -> usize {
    8
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_frame_prefix() -> String {
    "frames".to_string()
}

fn default_label_name() -> String {
    "carcrash".to_string()
}

fn default_classify_concurrency() -> usize {
    4
}

fn default_classify_timeout_secs() -> u64 {
    30
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
        }
    }
}

impl Config {
    /// Load configuration from config files and the environment.
    ///
    /// Environment variables override files:
    /// `CRASHWATCH__STORAGE__RAW_BUCKET` -> `storage.raw_bucket`
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/crashwatch").required(false))
            .add_source(config::File::with_name("/etc/crashwatch/crashwatch").required(false))
            .add_source(config::Environment::with_prefix("CRASHWATCH").separator("__"))
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the loaded values into typed settings.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        require("storage.raw_bucket", &self.storage.raw_bucket)?;
        require("storage.processed_bucket", &self.storage.processed_bucket)?;
        require("detection.model_arn", &self.detection.model_arn)?;
        require("detection.label_name", &self.detection.label_name)?;
        require("notification.topic_arn", &self.notification.topic_arn)?;
        require(
            "orchestration.state_machine_arn",
            &self.orchestration.state_machine_arn,
        )?;
        require("extraction.ffmpeg_path", &self.extraction.ffmpeg_path)?;
        require(
            "extraction.frame_prefix",
            self.extraction.frame_prefix.trim_matches('/'),
        )?;

        let frame_rate = parse_field("extraction.frame_rate", &self.extraction.frame_rate)?;
        let min_confidence =
            parse_field("detection.min_confidence", &self.detection.min_confidence)?;

        if self.storage.transfer_concurrency == 0 {
            return Err(invalid("storage.transfer_concurrency", "must be greater than 0"));
        }
        if self.detection.classify_concurrency == 0 {
            return Err(invalid("detection.classify_concurrency", "must be greater than 0"));
        }
        if self.detection.classify_timeout_secs == 0 {
            return Err(invalid("detection.classify_timeout_secs", "must be greater than 0"));
        }

        Ok(Settings {
            raw_bucket: self.storage.raw_bucket.clone(),
            processed_bucket: self.storage.processed_bucket.clone(),
            transfer_concurrency: self.storage.transfer_concurrency,
            frame_rate,
            ffmpeg_path: self.extraction.ffmpeg_path.clone(),
            frame_prefix: self.extraction.frame_prefix.trim_matches('/').to_string(),
            min_confidence,
            model_arn: self.detection.model_arn.clone(),
            label_name: self.detection.label_name.clone(),
            policy: self.detection.policy,
            classify_concurrency: self.detection.classify_concurrency,
            classify_timeout: Duration::from_secs(self.detection.classify_timeout_secs),
            timeout_policy: self.detection.timeout_policy,
            topic_arn: self.notification.topic_arn.clone(),
            notify_on_extraction: self.notification.notify_on_extraction,
            state_machine_arn: self.orchestration.state_machine_arn.clone(),
        })
    }
}

/// Validated, immutable settings shared by every invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub raw_bucket: String,
    pub processed_bucket: String,
    pub transfer_concurrency: usize,
    pub frame_rate: FrameRate,
    pub ffmpeg_path: String,
    pub frame_prefix: String,
    pub min_confidence: MinConfidence,
    pub model_arn: String,
    pub label_name: String,
    pub policy: DetectionPolicy,
    pub classify_concurrency: usize,
    pub classify_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
    pub topic_arn: String,
    pub notify_on_extraction: bool,
    pub state_machine_arn: String,
}

/// Frames sampled per second of source video. Always finite and positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRate(f64);

impl FrameRate {
    pub fn new(value: f64) -> Result<Self, ConfigError> {
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid(
                "frame_rate",
                &format!("{value} is not a positive frame rate"),
            ));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl FromStr for FrameRate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|_| invalid("frame_rate", &format!("{s:?} is not numeric")))?;
        Self::new(value)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Confidence threshold on the classifier's 0-100 scale.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct MinConfidence(f32);

impl MinConfidence {
    pub fn new(value: f32) -> Result<Self, ConfigError> {
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(invalid(
                "min_confidence",
                &format!("{value} is outside 0-100"),
            ));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> f32 {
        self.0
    }
}

impl Default for MinConfidence {
    fn default() -> Self {
        Self(80.0)
    }
}

impl FromStr for MinConfidence {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f32 = s
            .trim()
            .parse()
            .map_err(|_| invalid("min_confidence", &format!("{s:?} is not numeric")))?;
        Self::new(value)
    }
}

impl fmt::Display for MinConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn require(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(field.to_string()));
    }
    Ok(())
}

/// Parse a numeric string, reporting the error against the full field path.
fn parse_field<T>(field: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = ConfigError>,
{
    if raw.trim().is_empty() {
        return Err(ConfigError::MissingField(field.to_string()));
    }
    raw.parse().map_err(|e| match e {
        ConfigError::InvalidValue { message, .. } => ConfigError::InvalidValue {
            field: field.to_string(),
            message,
        },
        other => other,
    })
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            kafka: KafkaConfig {
                bootstrap_servers: "localhost:9092".to_string(),
                consumer_group: default_consumer_group(),
                upload_topic: default_upload_topic(),
                frames_topic: default_frames_topic(),
                ssl_enabled: false,
                ssl_ca_location: None,
                sasl_username: None,
                sasl_password: None,
                auto_offset_reset: default_auto_offset_reset(),
                session_timeout_ms: default_session_timeout_ms(),
                max_poll_interval_ms: default_max_poll_interval_ms(),
                max_redeliveries: default_max_redeliveries(),
                redelivery_backoff_ms: default_redelivery_backoff_ms(),
            },
            storage: StorageConfig {
                raw_bucket: "raw-videos".to_string(),
                processed_bucket: "processed-frames".to_string(),
                region: default_region(),
                endpoint_url: None,
                force_path_style: false,
                transfer_concurrency: 4,
            },
            extraction: ExtractionConfig {
                frame_rate: "1".to_string(),
                ffmpeg_path: default_ffmpeg_path(),
                frame_prefix: default_frame_prefix(),
            },
            detection: DetectionConfig {
                min_confidence: "80".to_string(),
                model_arn: "arn:aws:rekognition:us-east-1:123456789012:project/crash/version/1"
                    .to_string(),
                label_name: default_label_name(),
                policy: DetectionPolicy::FirstMatch,
                classify_concurrency: 2,
                classify_timeout_secs: 5,
                timeout_policy: TimeoutPolicy::FailOpen,
            },
            notification: NotificationConfig {
                topic_arn: "arn:aws:sns:us-east-1:123456789012:crash-alerts".to_string(),
                notify_on_extraction: false,
            },
            orchestration: OrchestrationConfig {
                state_machine_arn: "arn:aws:states:us-east-1:123456789012:stateMachine:crash"
                    .to_string(),
            },
        }
    }

    #[test]
    fn test_valid_config() {
        let settings = create_test_config().settings().unwrap();
        assert_eq!(settings.frame_rate.get(), 1.0);
        assert_eq!(settings.min_confidence.get(), 80.0);
        assert_eq!(settings.frame_prefix, "frames");
        assert_eq!(settings.classify_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_frame_rate_rejected() {
        let mut config = create_test_config();
        config.extraction.frame_rate = "0".to_string();
        match config.settings() {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "extraction.frame_rate");
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_frame_rate_rejected() {
        let mut config = create_test_config();
        config.extraction.frame_rate = "fast".to_string();
        assert!(matches!(
            config.settings(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_fractional_frame_rate_accepted() {
        let mut config = create_test_config();
        config.extraction.frame_rate = "0.5".to_string();
        let settings = config.settings().unwrap();
        assert_eq!(settings.frame_rate.to_string(), "0.5");
    }

    #[test]
    fn test_malformed_confidence_does_not_default_to_zero() {
        let mut config = create_test_config();
        config.detection.min_confidence = "eighty".to_string();
        match config.settings() {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "detection.min_confidence");
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_confidence_out_of_range() {
        let mut config = create_test_config();
        config.detection.min_confidence = "101".to_string();
        assert!(config.settings().is_err());

        config.detection.min_confidence = "-1".to_string();
        assert!(config.settings().is_err());
    }

    #[test]
    fn test_missing_bucket() {
        let mut config = create_test_config();
        config.storage.processed_bucket = "  ".to_string();
        assert!(matches!(
            config.settings(),
            Err(ConfigError::MissingField(field)) if field == "storage.processed_bucket"
        ));
    }

    #[test]
    fn test_empty_frame_rate_is_missing() {
        let mut config = create_test_config();
        config.extraction.frame_rate = String::new();
        assert!(matches!(
            config.settings(),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_frame_prefix_trimmed() {
        let mut config = create_test_config();
        config.extraction.frame_prefix = "/frames/".to_string();
        assert_eq!(config.settings().unwrap().frame_prefix, "frames");
    }

    #[test]
    fn test_frame_rate_display_for_whole_numbers() {
        assert_eq!("2".parse::<FrameRate>().unwrap().to_string(), "2");
        assert!("NaN".parse::<FrameRate>().is_err());
        assert!("-3".parse::<FrameRate>().is_err());
    }
}
