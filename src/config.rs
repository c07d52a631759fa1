//! Configuration management for the JustData server

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WarehouseConfig {
    /// Connection string; resolution order is explicit override, this
    /// value, then the ambient environment. Absence is fatal at startup.
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Process-wide cap on in-flight warehouse queries.
    pub max_concurrent: usize,
    pub query_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CensusConfig {
    pub base_url: String,
    /// Absence degrades demographic context with a warning.
    pub api_key: Option<String>,
    pub max_concurrent: usize,
    pub requests_per_second: f64,
    pub timeout_secs: u64,
    /// Per-vintage stage timeout.
    pub vintage_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiProviderConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    pub primary: Option<AiProviderConfig>,
    pub fallback: Option<AiProviderConfig>,
    pub max_concurrent: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Wall clock per narrative call.
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Per-job wall clock.
    pub job_timeout_secs: u64,
    /// Report TTL before garbage collection.
    pub report_ttl_secs: u64,
    /// How often the store sweeps expired reports.
    pub gc_interval_secs: u64,
    /// Submission rate limit on /analyze, per client address.
    pub analyze_rate_per_sec: u64,
    pub analyze_burst: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactsConfig {
    pub dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub census: CensusConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            // Start with default configuration
            .add_source(File::with_name("config/default").required(false))
            // Layer on the environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add environment variables (with prefix JUSTDATA_)
            .add_source(
                Environment::with_prefix("JUSTDATA")
                    .separator("__")
                    .try_parsing(true),
            )
            // Override warehouse URL from DATABASE_URL env var if present
            .set_override_option("warehouse.url", env::var("DATABASE_URL").ok())?
            // Override census API key from CENSUS_API_KEY env var if present
            .set_override_option("census.api_key", env::var("CENSUS_API_KEY").ok())?
            .build()?;

        config.try_deserialize()
    }

    /// Defaults-only configuration for tests, with artifacts under a
    /// throwaway temp directory.
    pub fn for_tests() -> Self {
        Self {
            artifacts: ArtifactsConfig {
                dir: std::env::temp_dir()
                    .join(format!("justdata-artifacts-{}", uuid::Uuid::new_v4()))
                    .to_string_lossy()
                    .into_owned(),
            },
            server: ServerConfig::default(),
            warehouse: WarehouseConfig::default(),
            census: CensusConfig::default(),
            ai: AiConfig::default(),
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 2,
            max_concurrent: 8,
            query_timeout_secs: 10 * 60,
        }
    }
}

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.census.gov".to_string(),
            api_key: None,
            max_concurrent: 4,
            requests_per_second: 10.0,
            timeout_secs: 30,
            vintage_timeout_secs: 120,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            primary: None,
            fallback: None,
            max_concurrent: 4,
            max_tokens: 1024,
            temperature: 0.2,
            timeout_secs: 90,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 20 * 60,
            report_ttl_secs: 24 * 60 * 60,
            gc_interval_secs: 15 * 60,
            analyze_rate_per_sec: 2,
            analyze_burst: 10,
        }
    }
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: "./artifacts".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
