//! Configuration management for Audible Fetcher
//!
//! This module provides unified configuration management with automatic
//! first-run initialization, multi-source loading, and zero-config defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::app::client::ClientConfig;
use crate::app::models::Region;
use crate::app::pipeline::PipelineOptions;
use crate::constants::{decoder, files, license, portal, transfers};
use crate::errors::{ConfigError, ConfigResult};

/// Unified application configuration for TOML serialization
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Portal region and licensing settings
    pub portal: PortalConfig,
    /// HTTP client settings
    pub client: ClientConfig,
    /// Transfer pool settings
    pub transfers: TransfersConfig,
    /// External decoder settings
    pub decoder: DecoderConfig,
    /// Output locations
    pub library: LibraryConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Portal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Region top-level domain (`com`, `co.uk`, `de`, ...) or region name
    pub region: String,
    /// Overrides the region-derived portal URL
    pub base_url: Option<String>,
    /// Host serving the licensing endpoints
    pub license_url: String,
    /// Player id presented when requesting the activation key
    pub player_id: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            region: portal::DEFAULT_REGION_TLD.to_string(),
            base_url: None,
            license_url: license::BASE_URL.to_string(),
            player_id: license::DEFAULT_PLAYER_ID.to_string(),
        }
    }
}

impl PortalConfig {
    pub fn region(&self) -> ConfigResult<Region> {
        Region::find(&self.region).ok_or_else(|| ConfigError::UnknownRegion(self.region.clone()))
    }

    /// Portal root: the explicit override, else the region's host
    pub fn base_url(&self) -> ConfigResult<Url> {
        let raw = match &self.base_url {
            Some(url) => url.clone(),
            None => self.region()?.base_url(),
        };
        parse_url("portal.base_url", &raw)
    }

    pub fn license_url(&self) -> ConfigResult<Url> {
        parse_url("portal.license_url", &self.license_url)
    }
}

fn parse_url(field: &str, raw: &str) -> ConfigResult<Url> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
        field: field.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Transfer pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransfersConfig {
    /// Concurrent transfers
    pub pool_size: usize,
    /// Attempts per transfer; retries are immediate
    pub max_retries: u32,
    /// Skip files whose name marks one part of a multi-part title
    pub skip_multipart: bool,
}

impl Default for TransfersConfig {
    fn default() -> Self {
        Self {
            pool_size: transfers::DEFAULT_POOL_SIZE,
            max_retries: transfers::MAX_RETRIES,
            skip_multipart: true,
        }
    }
}

/// External decoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Decoder executable, looked up on `PATH` unless absolute
    pub program: String,
    pub encrypted_extension: String,
    pub decoded_extension: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            program: decoder::DEFAULT_PROGRAM.to_string(),
            encrypted_extension: decoder::ENCRYPTED_EXTENSION.to_string(),
            decoded_extension: decoder::DECODED_EXTENSION.to_string(),
        }
    }
}

/// Output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Library root
    pub output_dir: PathBuf,
    /// Cookie cache file; defaults to the user config directory
    pub cookie_cache: Option<PathBuf>,
    /// Persist cookies between runs
    pub cache_cookies: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            cookie_cache: None,
            cache_cookies: true,
        }
    }
}

impl LibraryConfig {
    /// Cookie cache path, or `None` when caching is disabled
    pub fn cookie_cache_path(&self) -> Option<PathBuf> {
        if !self.cache_cookies {
            return None;
        }
        self.cookie_cache.clone().or_else(|| {
            dirs::config_dir().map(|dir| dir.join(files::APP_DIR_NAME).join(files::COOKIE_CACHE_FILE))
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when no verbosity flag is given
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration with precedence:
    /// 1. Explicit `--config` file (must exist)
    /// 2. `./audible-fetcher.toml`
    /// 3. User config directory
    /// 4. Defaults
    pub async fn load(config_file_override: Option<PathBuf>) -> ConfigResult<Self> {
        let config_path = match &config_file_override {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound { path: path.clone() });
                }
                Some(path.clone())
            }
            None => Self::find_config_file(),
        };

        let config = match config_path {
            Some(path) => Self::load_from_file(&path).await?,
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects values the pipeline cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.transfers.pool_size == 0 || self.transfers.pool_size > transfers::MAX_POOL_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "transfers.pool_size".to_string(),
                value: self.transfers.pool_size.to_string(),
                reason: format!("Must be between 1 and {}", transfers::MAX_POOL_SIZE),
            });
        }
        if self.transfers.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transfers.max_retries".to_string(),
                value: "0".to_string(),
                reason: "At least one attempt is required".to_string(),
            });
        }
        self.portal.base_url()?;
        self.portal.license_url()?;
        Ok(())
    }

    /// Pipeline settings derived from this configuration
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            output_dir: self.library.output_dir.clone(),
            pool_size: self.transfers.pool_size,
            max_retries: self.transfers.max_retries,
            skip_multipart: self.transfers.skip_multipart,
            decoder_program: self.decoder.program.clone(),
            encrypted_ext: self.decoder.encrypted_extension.clone(),
            decoded_ext: self.decoder.decoded_extension.clone(),
        }
    }

    /// Initialize configuration on first run
    ///
    /// Creates a default config file if none exists and notifies the user
    pub async fn initialize_first_run() -> ConfigResult<Option<PathBuf>> {
        let Some(config_path) = Self::default_config_path() else {
            debug!("No user config directory; skipping first-run setup");
            return Ok(None);
        };

        if config_path.exists() {
            return Ok(Some(config_path));
        }

        info!("Creating default configuration file...");

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        tokio::fs::write(&config_path, Self::generate_default_config_content())
            .await
            .map_err(|source| ConfigError::Io {
                path: config_path.clone(),
                source,
            })?;

        println!("Created default configuration file:");
        println!("   {}", config_path.display());
        println!("   You can customize settings by editing this file.");
        println!();

        Ok(Some(config_path))
    }

    fn find_config_file() -> Option<PathBuf> {
        let mut search_paths = vec![PathBuf::from("./audible-fetcher.toml")];
        search_paths.extend(Self::default_config_path());

        let found = search_paths.into_iter().find(|path| path.exists());
        match &found {
            Some(path) => debug!("Found config file: {}", path.display()),
            None => debug!("No config file found in standard locations"),
        }
        found
    }

    /// Default config file path for the current user
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(files::APP_DIR_NAME).join("config.toml"))
    }

    async fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let config: AppConfig = toml::from_str(&content)?;
        info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Default configuration content with comments
    pub fn generate_default_config_content() -> String {
        format!(
            r#"# Audible Fetcher Configuration
# This file was automatically generated on first run.
# You can customize any of these settings to suit your needs.

[portal]
# Region: com, ca, co.uk, com.au, de, fr, in, it, co.jp
region = "{region}"
# base_url = "https://www.audible.com"
license_url = "{license_url}"
player_id = "{player_id}"

[client]
tcp_keepalive = "30s"
tcp_nodelay = true
pool_idle_timeout = "4m"
pool_max_per_host = 100
connect_timeout = "30s"
max_redirects = 10

[transfers]
# Concurrent downloads
pool_size = {pool_size}
# Attempts per file; retries happen immediately
max_retries = {max_retries}
# Skip files named "... Part N ..."
skip_multipart = true

[decoder]
program = "{program}"
encrypted_extension = "{encrypted}"
decoded_extension = "{decoded}"

[library]
# Books are saved as <output_dir>/<authors>/<title>
output_dir = "."
cache_cookies = true
# cookie_cache = "/path/to/cookiejar.json"

[logging]
level = "info"  # error, warn, info, debug, trace
"#,
            region = portal::DEFAULT_REGION_TLD,
            license_url = license::BASE_URL,
            player_id = license::DEFAULT_PLAYER_ID,
            pool_size = transfers::DEFAULT_POOL_SIZE,
            max_retries = transfers::MAX_RETRIES,
            program = decoder::DEFAULT_PROGRAM,
            encrypted = decoder::ENCRYPTED_EXTENSION,
            decoded = decoder::DECODED_EXTENSION,
        )
    }
}
