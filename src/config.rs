use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{DetectorSettings, DEFAULT_MIN_CONFIDENCE};
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::images::{S3Config, DEFAULT_BUCKET, DEFAULT_FALLBACK_DIR, DEFAULT_FALLBACK_URL_PREFIX};
use crate::ingest::DEFAULT_RECONNECT_BACKOFF;
use crate::pipeline::{PipelineOptions, ThrottleCommit, DEFAULT_HEALTH_LOG_INTERVAL};
use crate::sampler::{DEFAULT_FRAME_STRIDE, DEFAULT_MIN_ALERT_INTERVAL};
use crate::violation::{default_rules, RuleTable, ViolationRule, DEFAULT_RULE_CONFIDENCE};

const DEFAULT_DB_PATH: &str = "citywatch.db";
const DEFAULT_S3_ENDPOINT: &str = "http://localhost:9000";
const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_S3_ACCESS_KEY: &str = "minioadmin";
const DEFAULT_S3_SECRET_KEY: &str = "minioadmin";
const DEFAULT_S3_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
struct CitywatchConfigFile {
    db_path: Option<String>,
    camera: Option<CameraConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    detector: Option<DetectorConfigFile>,
    rules: Option<RulesConfigFile>,
    storage: Option<StorageConfigFile>,
    fallback: Option<FallbackConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    id: Option<i64>,
    all: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    min_alert_interval_secs: Option<u64>,
    frame_stride: Option<u64>,
    reconnect_backoff_secs: Option<u64>,
    throttle_commit: Option<String>,
    health_log_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RulesConfigFile {
    min_confidence: Option<f32>,
    table: Option<Vec<ViolationRule>>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    endpoint: Option<String>,
    region: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
    bucket: Option<String>,
    public_url: Option<String>,
    timeout_secs: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct FallbackConfigFile {
    dir: Option<PathBuf>,
    url_prefix: Option<String>,
}

/// Which cameras the daemon watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSelection {
    /// Active camera with the lowest id.
    FirstActive,
    Id(i64),
    AllActive,
}

#[derive(Debug, Clone)]
pub struct CitywatchConfig {
    pub db_path: String,
    pub camera: CameraSelection,
    pub pipeline: PipelineSettings,
    pub detector: DetectorSettings,
    /// Floor applied to raw detections.
    pub detection_min_confidence: f32,
    /// Stricter gate applied by the violation rules.
    pub rule_min_confidence: f32,
    pub rules: Vec<ViolationRule>,
    pub storage: StorageSettings,
    pub fallback: FallbackSettings,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub min_alert_interval: Duration,
    pub frame_stride: u64,
    pub reconnect_backoff: Duration,
    pub throttle_commit: ThrottleCommit,
    pub health_log_interval: Duration,
}

impl PipelineSettings {
    pub fn options(&self) -> PipelineOptions {
        PipelineOptions {
            frame_stride: self.frame_stride,
            min_alert_interval: self.min_alert_interval,
            throttle_commit: self.throttle_commit,
            health_log_interval: self.health_log_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub s3: S3Config,
    pub bucket: String,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub dir: PathBuf,
    pub url_prefix: String,
}

impl CitywatchConfig {
    /// Defaults, then the file named by `CITYWATCH_CONFIG`, then
    /// `CITYWATCH_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CITYWATCH_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => CitywatchConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CitywatchConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let camera = match file.camera {
            Some(CameraConfigFile { all: Some(true), .. }) => CameraSelection::AllActive,
            Some(CameraConfigFile { id: Some(id), .. }) => CameraSelection::Id(id),
            _ => CameraSelection::FirstActive,
        };

        let pipeline_file = file.pipeline.unwrap_or_default();
        let pipeline = PipelineSettings {
            min_alert_interval: pipeline_file
                .min_alert_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_MIN_ALERT_INTERVAL),
            frame_stride: pipeline_file.frame_stride.unwrap_or(DEFAULT_FRAME_STRIDE),
            reconnect_backoff: pipeline_file
                .reconnect_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RECONNECT_BACKOFF),
            throttle_commit: match pipeline_file.throttle_commit {
                Some(value) => value.parse()?,
                None => ThrottleCommit::default(),
            },
            health_log_interval: pipeline_file
                .health_log_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HEALTH_LOG_INTERVAL),
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector_defaults = DetectorSettings::default();
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or(detector_defaults.backend),
            model_path: detector_file.model_path,
            input_width: detector_file
                .input_width
                .unwrap_or(detector_defaults.input_width),
            input_height: detector_file
                .input_height
                .unwrap_or(detector_defaults.input_height),
        };

        let rules_file = file.rules.unwrap_or_default();
        let storage_file = file.storage.unwrap_or_default();
        let storage = StorageSettings {
            s3: S3Config {
                endpoint: storage_file
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_S3_ENDPOINT.to_string()),
                region: storage_file
                    .region
                    .unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                access_key: storage_file
                    .access_key
                    .unwrap_or_else(|| DEFAULT_S3_ACCESS_KEY.to_string()),
                secret_key: storage_file
                    .secret_key
                    .unwrap_or_else(|| DEFAULT_S3_SECRET_KEY.to_string()),
                public_url: storage_file.public_url,
                timeout: Duration::from_secs(
                    storage_file.timeout_secs.unwrap_or(DEFAULT_S3_TIMEOUT_SECS),
                ),
            },
            bucket: storage_file
                .bucket
                .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            jpeg_quality: storage_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let fallback_file = file.fallback.unwrap_or_default();
        let fallback = FallbackSettings {
            dir: fallback_file
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FALLBACK_DIR)),
            url_prefix: fallback_file
                .url_prefix
                .unwrap_or_else(|| DEFAULT_FALLBACK_URL_PREFIX.to_string()),
        };

        Ok(Self {
            db_path,
            camera,
            pipeline,
            detector,
            detection_min_confidence: detector_file
                .min_confidence
                .unwrap_or(DEFAULT_MIN_CONFIDENCE),
            rule_min_confidence: rules_file.min_confidence.unwrap_or(DEFAULT_RULE_CONFIDENCE),
            rules: rules_file.table.unwrap_or_else(default_rules),
            storage,
            fallback,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_string("CITYWATCH_DB_PATH") {
            self.db_path = path;
        }
        if let Some(id) = env_string("CITYWATCH_CAMERA_ID") {
            let id: i64 = id
                .parse()
                .map_err(|_| anyhow!("CITYWATCH_CAMERA_ID must be an integer camera id"))?;
            self.camera = CameraSelection::Id(id);
        }
        if let Some(all) = env_string("CITYWATCH_ALL_CAMERAS") {
            if parse_bool("CITYWATCH_ALL_CAMERAS", &all)? {
                self.camera = CameraSelection::AllActive;
            }
        }
        if let Some(secs) = env_u64("CITYWATCH_MIN_ALERT_INTERVAL_SECS")? {
            self.pipeline.min_alert_interval = Duration::from_secs(secs);
        }
        if let Some(stride) = env_u64("CITYWATCH_FRAME_STRIDE")? {
            self.pipeline.frame_stride = stride;
        }
        if let Some(secs) = env_u64("CITYWATCH_RECONNECT_BACKOFF_SECS")? {
            self.pipeline.reconnect_backoff = Duration::from_secs(secs);
        }
        if let Some(policy) = env_string("CITYWATCH_THROTTLE_COMMIT") {
            self.pipeline.throttle_commit = policy.parse()?;
        }
        if let Some(backend) = env_string("CITYWATCH_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_string("CITYWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(endpoint) = env_string("CITYWATCH_S3_ENDPOINT") {
            self.storage.s3.endpoint = endpoint;
        }
        if let Some(region) = env_string("CITYWATCH_S3_REGION") {
            self.storage.s3.region = region;
        }
        if let Some(key) = env_string("CITYWATCH_S3_ACCESS_KEY") {
            self.storage.s3.access_key = key;
        }
        if let Some(secret) = env_string("CITYWATCH_S3_SECRET_KEY") {
            self.storage.s3.secret_key = secret;
        }
        if let Some(bucket) = env_string("CITYWATCH_S3_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Some(url) = env_string("CITYWATCH_S3_PUBLIC_URL") {
            self.storage.s3.public_url = Some(url);
        }
        if let Some(dir) = env_string("CITYWATCH_FALLBACK_DIR") {
            self.fallback.dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Check cross-field constraints. The binary calls this again after
    /// applying command-line overrides.
    pub fn validate(&mut self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path cannot be empty"));
        }
        if self.pipeline.frame_stride == 0 {
            return Err(anyhow!("frame stride must be greater than zero"));
        }
        check_confidence("detection min_confidence", self.detection_min_confidence)?;
        check_confidence("rule min_confidence", self.rule_min_confidence)?;
        if self.rule_min_confidence < self.detection_min_confidence {
            return Err(anyhow!(
                "rule min_confidence ({}) must not be below the detection floor ({})",
                self.rule_min_confidence,
                self.detection_min_confidence
            ));
        }
        RuleTable::new(self.rules.clone())?;

        self.detector.backend = self.detector.backend.trim().to_lowercase();
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(anyhow!("detector input size must be non-zero"));
        }

        let bucket_re = Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$")?;
        if !bucket_re.is_match(&self.storage.bucket) || self.storage.bucket.contains("..") {
            return Err(anyhow!("invalid bucket name '{}'", self.storage.bucket));
        }
        if !(1..=100).contains(&self.storage.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }
        if self.storage.s3.timeout.is_zero() {
            return Err(anyhow!("object store timeout must be greater than zero"));
        }
        if !self.fallback.url_prefix.starts_with('/') {
            return Err(anyhow!("fallback url_prefix must start with '/'"));
        }
        Ok(())
    }

    pub fn rule_table(&self) -> Result<RuleTable> {
        RuleTable::new(self.rules.clone())
    }
}

fn check_confidence(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be between 0 and 1, got {}", name, value));
    }
    Ok(())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    env_string(key)
        .map(|value| {
            value
                .parse()
                .map_err(|_| anyhow!("{} must be a non-negative integer", key))
        })
        .transpose()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be true or false", key)),
    }
}

fn read_config_file(path: &Path) -> Result<CitywatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
