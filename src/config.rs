//! Run configuration.
//!
//! One TOML file, every section optional. Anything left out falls back to
//! the built-in defaults. The environment overlays the API key and the
//! unattended flag.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::enrichment::cache::KEY_SEPARATOR;
use crate::enrichment::EnrichmentSettings;
use crate::error::{Result, ScoutError};
use crate::models::Location;
use crate::retry::RetryPolicy;
use crate::scrapers::types::is_unattended_env;
use crate::scrapers::{BrowserOptions, EngineSettings, SearchCriteria, SessionPolicy};

pub const API_KEY_ENV: &str = "GOOGLE_MAPS_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutConfig {
    /// Built-in site name or path to a capability TOML file
    pub site: String,
    pub criteria: SearchCriteria,
    pub locations: Vec<Location>,
    pub browser: BrowserOptions,
    pub retry: RetryConfig,
    pub engine: EngineSettings,
    pub enrichment: EnrichmentConfig,
    pub output: OutputConfig,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            site: "domain".to_string(),
            criteria: SearchCriteria::default(),
            locations: Location::defaults(),
            browser: BrowserOptions::default(),
            retry: RetryConfig::default(),
            engine: EngineSettings::default(),
            enrichment: EnrichmentConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub session: SessionPolicy,
    pub enrichment: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            session: SessionPolicy::default(),
            enrichment: RetryPolicy::new(3, Duration::from_secs(1)),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Usually supplied through `GOOGLE_MAPS_API_KEY`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Override for the Distance Matrix endpoint
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
    pub concurrency: usize,
    pub cache_path: PathBuf,
    /// Drop listings over the travel limits after enrichment
    pub filter: bool,
    pub max_transit_mins: u32,
    pub max_driving_mins: u32,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            request_timeout_secs: 30,
            concurrency: 4,
            cache_path: PathBuf::from("cache/distance_cache.json"),
            filter: false,
            max_transit_mins: 60,
            max_driving_mins: 45,
        }
    }
}

impl std::fmt::Debug for EnrichmentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("concurrency", &self.concurrency)
            .field("cache_path", &self.cache_path)
            .field("filter", &self.filter)
            .field("max_transit_mins", &self.max_transit_mins)
            .field("max_driving_mins", &self.max_driving_mins)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
        }
    }
}

impl ScoutConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ScoutConfig =
            toml::from_str(text).map_err(|e| ScoutError::configuration("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` if it exists, defaults otherwise, then apply the
    /// environment overlay.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading configuration");
                Self::from_toml_str(&std::fs::read_to_string(path)?)?
            }
            Some(path) => {
                debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok(), is_unattended_env());
        Ok(config)
    }

    /// Overlay values taken from the environment.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>, unattended: bool) {
        if let Some(key) = var(API_KEY_ENV).map(|k| k.trim().to_string()).filter(|k| !k.is_empty()) {
            self.enrichment.api_key = Some(key);
        }
        if unattended {
            self.browser.unattended = true;
        }
    }

    fn validate(&self) -> Result<()> {
        let mut slugs = std::collections::HashSet::new();
        for location in &self.locations {
            if location.slug.trim().is_empty() || location.address.trim().is_empty() {
                return Err(ScoutError::configuration(
                    "config",
                    format!("location `{}` needs a slug and an address", location.name),
                ));
            }
            if location.slug.contains(KEY_SEPARATOR) {
                return Err(ScoutError::configuration(
                    "config",
                    format!("location slug `{}` may not contain `{KEY_SEPARATOR}`", location.slug),
                ));
            }
            if !slugs.insert(location.slug.as_str()) {
                return Err(ScoutError::configuration(
                    "config",
                    format!("duplicate location slug `{}`", location.slug),
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.criteria.price_min, self.criteria.price_max) {
            if min > max {
                return Err(ScoutError::configuration(
                    "config",
                    format!("price_min {min} is above price_max {max}"),
                ));
            }
        }
        Ok(())
    }

    pub fn enrichment_settings(&self) -> EnrichmentSettings {
        EnrichmentSettings {
            concurrency: self.enrichment.concurrency,
            retry: self.retry.enrichment.clone(),
        }
    }

    /// `<output>/<site>/search`
    pub fn pages_dir(&self, site: &str) -> PathBuf {
        self.output.dir.join(site).join("search")
    }
}
