//! Layered configuration: defaults, then an optional TOML file, then `MINTGRID_*` env vars.

use crate::loader::key::Endpoint;
use crate::loader::ranking::RankingConfig;
use crate::loader::retry::RetryPolicy;
use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "mintgrid.toml";

/// Gateways tried when nothing is configured, in initial preference order.
const DEFAULT_GATEWAYS: &[&str] = &[
    "https://cloudflare-ipfs.com/ipfs",
    "https://dweb.link/ipfs",
    "https://ipfs.io/ipfs",
    "https://gateway.pinata.cloud/ipfs",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Level applied to this crate's targets when `RUST_LOG` is unset.
    pub log_level: String,
    /// Endpoint templates, either a base URL or a template containing `{path}`.
    pub gateways: Vec<String>,
    /// Maximum number of loads with network work in flight.
    pub concurrency: usize,
    /// Optional global pacing of outgoing requests.
    pub requests_per_second: Option<u32>,
    /// Returned to callers whose resource could not be loaded from any gateway.
    pub fallback_uri: String,
    pub retry: RetryPolicy,
    pub ranking: RankingConfig,
    pub thumbnails: ThumbnailConfig,
    pub upscale: UpscaleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            gateways: DEFAULT_GATEWAYS.iter().map(|s| (*s).to_owned()).collect(),
            concurrency: 20,
            requests_per_second: None,
            fallback_uri: "/placeholder.png".to_owned(),
            retry: RetryPolicy::default(),
            ranking: RankingConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            upscale: UpscaleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// JSON array of `{ id, metadata: { image, attributes } }`.
    pub mapping_path: PathBuf,
    pub output_dir: PathBuf,
    pub size: u32,
    pub batch_size: usize,
    #[serde(with = "duration")]
    pub batch_pause: Duration,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            mapping_path: PathBuf::from("data/mapping.json"),
            output_dir: PathBuf::from("public/bayc-images"),
            size: 64,
            batch_size: 50,
            batch_pause: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpscaleConfig {
    pub input_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub size: u32,
    pub batch_size: usize,
    #[serde(with = "duration")]
    pub batch_pause: Duration,
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("public/images"),
            backup_dir: PathBuf::from("public/images-32px-backup"),
            size: 64,
            batch_size: 100,
            batch_pause: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Load configuration. An explicit path must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => {
                if !p.exists() {
                    bail!("config file {} does not exist", p.display());
                }
                p.to_path_buf()
            }
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(file))
                .merge(Env::prefixed("MINTGRID_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().context("Failed to load config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.gateways.is_empty() {
            bail!("at least one gateway must be configured");
        }
        for gateway in &self.gateways {
            // Render a dummy path so templates validate as concrete URLs.
            let probe = Endpoint::new(gateway).uri_for("probe");
            url::Url::parse(&probe).with_context(|| format!("invalid gateway {gateway:?}"))?;
        }
        if self.retry.attempt_timeout.is_zero() {
            bail!("retry.attempt_timeout must be positive");
        }
        if self.requests_per_second == Some(0) {
            bail!("requests_per_second must be positive when set");
        }
        if self.thumbnails.batch_size == 0 || self.upscale.batch_size == 0 {
            bail!("batch sizes must be at least 1");
        }
        Ok(())
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.gateways.iter().map(Endpoint::new).collect()
    }
}

/// Serde adapter for human-readable durations such as `"30s"` or `"500ms"`.
pub mod duration {
    use fundu::{DurationParser, TimeUnit};
    use serde::{Deserialize, Deserializer, de::Error};
    use std::time::Duration;

    const UNITS: &[TimeUnit] = &[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ];

    pub fn parse(raw: &str) -> Result<Duration, String> {
        let parsed = DurationParser::with_time_units(UNITS)
            .parse(raw.trim())
            .map_err(|e| format!("invalid duration {raw:?}: {e}"))?;
        Duration::try_from(parsed).map_err(|e| format!("invalid duration {raw:?}: {e}"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(D::Error::custom)
    }
}
