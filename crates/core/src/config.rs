use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default = "ProviderConfig::default_annotator")]
    pub annotator: ProviderConfig,
    #[serde(default = "ProviderConfig::default_index")]
    pub index: ProviderConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            pipeline: PipelineConfig::default(),
            annotator: ProviderConfig::default_annotator(),
            index: ProviderConfig::default_index(),
            scan: ScanConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file or URL for the job journal. No journal when unset.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            job_ttl_secs: default_job_ttl_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }
}

/// Settings for one external provider, annotator or index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub credentials: Option<String>,
    /// Name of an environment variable holding the credentials.
    #[serde(default)]
    pub credentials_env: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_quota_backoff_multiplier")]
    pub quota_backoff_multiplier: u32,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f32,
}

impl ProviderConfig {
    pub fn named(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            endpoint: None,
            credentials: None,
            credentials_env: None,
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_ms: default_timeout_ms(),
            quota_backoff_multiplier: default_quota_backoff_multiplier(),
            jitter_ratio: default_jitter_ratio(),
        }
    }

    fn default_annotator() -> Self {
        Self::named("noop")
    }

    fn default_index() -> Self {
        Self::named("memory")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.base_backoff_ms)),
            quota_multiplier: self.quota_backoff_multiplier.max(1),
            jitter_ratio: self.jitter_ratio,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    /// Inline credentials win over `credentials_env`.
    pub fn resolve_credentials(&self) -> Option<String> {
        self.credentials.clone().or_else(|| {
            self.credentials_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        })
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(invalid(section, "max_attempts", "must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid(section, "timeout_ms", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(invalid(section, "jitter_ratio", "must be within [0, 1]"));
        }
        if self.provider == "http" && self.endpoint.is_none() {
            return Err(invalid(section, "endpoint", "required for the http provider"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include: default_include(),
            exclude: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.max_concurrency < 1 {
            return Err(invalid("pipeline", "max_concurrency", "must be at least 1"));
        }
        self.annotator.validate("annotator")?;
        self.index.validate("index")?;
        Ok(())
    }
}

fn invalid(section: &str, field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: format!("{section}.{field}"),
        reason: reason.to_string(),
    }
}

fn default_max_concurrency() -> usize {
    4
}
fn default_job_ttl_secs() -> u64 {
    3_600
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_quota_backoff_multiplier() -> u32 {
    4
}
fn default_jitter_ratio() -> f32 {
    0.2
}
fn default_include() -> Vec<String> {
    ["*.jpg", "*.jpeg", "*.png", "*.gif", "*.webp", "*.bmp", "*.tif", "*.tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Loads configuration from `path` (or `config/default` when present),
/// then applies `SNAPDEX__SECTION__KEY` environment overrides.
pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }
    settings = settings.add_source(
        config::Environment::with_prefix("SNAPDEX")
            .separator("__")
            .try_parsing(true),
    );
    let cfg: AppConfig = settings.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}
