//! Command-line argument parsing for Audible Fetcher
//!
//! This module defines the CLI structure using clap derive macros: library
//! downloads, activation key retrieval, credential management and region
//! listing.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::AppConfig;
use crate::constants::transfers;

/// Audible Fetcher - download and decode your audiobook library
#[derive(Parser, Debug)]
#[command(
    name = "audible_fetcher",
    version,
    about = "Download and decode the audiobooks in your Audible library",
    long_about = "Signs in to the Audible web portal, derives your activation key, and downloads every new title
in your library with resumable, concurrent transfers before handing each file to the decoder."
)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Global arguments available to all subcommands
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Very verbose logging (debug level)
    #[arg(long, global = true)]
    pub very_verbose: bool,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Portal region (TLD such as "co.uk", or a name such as "Germany")
    #[arg(short, long, global = true)]
    pub region: Option<String>,

    /// Do not read or write the cookie cache
    #[arg(long, global = true)]
    pub no_cookie_cache: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download and decode new titles from a catalog file
    Download(DownloadArgs),

    /// Sign in and print the activation key
    Activation,

    /// Manage authentication credentials
    Auth(AuthArgs),

    /// List supported portal regions
    Regions,
}

/// Arguments for the download command
#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// JSON catalog of library items
    #[arg(value_name = "CATALOG")]
    pub catalog: PathBuf,

    /// Library root directory
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Number of concurrent transfers
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Attempts per file
    #[arg(long)]
    pub retries: Option<u32>,

    /// Also download files named "... Part N ..."
    #[arg(long)]
    pub include_multipart: bool,

    /// Decoder executable
    #[arg(long, value_name = "PROGRAM")]
    pub decoder: Option<String>,

    /// Activation key to use instead of requesting one
    #[arg(long, value_name = "HEX")]
    pub activation_key: Option<String>,

    /// Download without asking for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Dry run - list new titles without downloading
    #[arg(long)]
    pub dry_run: bool,

    /// Disable the progress display
    #[arg(long)]
    pub no_progress: bool,
}

/// Arguments for authentication management
#[derive(Args, Debug)]
pub struct AuthArgs {
    #[command(subcommand)]
    pub action: AuthAction,
}

/// Authentication actions
#[derive(Subcommand, Debug)]
pub enum AuthAction {
    /// Save portal credentials to a .env file
    Setup {
        /// Overwrite existing credentials without asking
        #[arg(short, long)]
        force: bool,
    },

    /// Sign in with the current credentials
    Verify,

    /// Show authentication status
    Status,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the logging level based on global arguments
    pub fn log_level(&self) -> tracing::Level {
        if self.global.quiet {
            tracing::Level::ERROR
        } else if self.global.very_verbose {
            tracing::Level::DEBUG
        } else if self.global.verbose {
            tracing::Level::INFO
        } else {
            tracing::Level::WARN
        }
    }
}

impl GlobalArgs {
    /// Applies options shared by every command
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(region) = &self.region {
            config.portal.region = region.clone();
            config.portal.base_url = None;
        }
        if self.no_cookie_cache {
            config.library.cache_cookies = false;
        }
    }
}

impl DownloadArgs {
    /// Rejects out-of-range values
    pub fn validate(&self) -> Result<(), String> {
        if let Some(workers) = self.workers {
            if workers == 0 || workers > transfers::MAX_POOL_SIZE {
                return Err(format!(
                    "Number of workers must be between 1 and {}",
                    transfers::MAX_POOL_SIZE
                ));
            }
        }

        if self.retries == Some(0) {
            return Err("Retries must be greater than 0".to_string());
        }

        if let Some(key) = &self.activation_key {
            if key.len() != 8 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err("Activation key must be 8 hexadecimal characters".to_string());
            }
        }

        Ok(())
    }

    /// Overrides configuration values given on the command line
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(output) = &self.output {
            config.library.output_dir = output.clone();
        }
        if let Some(workers) = self.workers {
            config.transfers.pool_size = workers;
        }
        if let Some(retries) = self.retries {
            config.transfers.max_retries = retries;
        }
        if self.include_multipart {
            config.transfers.skip_multipart = false;
        }
        if let Some(decoder) = &self.decoder {
            config.decoder.program = decoder.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download_args() -> DownloadArgs {
        DownloadArgs {
            catalog: PathBuf::from("catalog.json"),
            output: None,
            workers: None,
            retries: None,
            include_multipart: false,
            decoder: None,
            activation_key: None,
            yes: false,
            dry_run: false,
            no_progress: false,
        }
    }

    #[test]
    fn test_download_args_validation() {
        let mut args = download_args();
        assert!(args.validate().is_ok());

        args.workers = Some(0);
        assert!(args.validate().is_err());

        args.workers = Some(4);
        args.retries = Some(0);
        assert!(args.validate().is_err());

        args.retries = Some(2);
        args.activation_key = Some("xyz".into());
        assert!(args.validate().is_err());

        args.activation_key = Some("1a2B3c4D".into());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let args = DownloadArgs {
            output: Some(PathBuf::from("/books")),
            workers: Some(2),
            include_multipart: true,
            decoder: Some("/opt/ffmpeg".into()),
            ..download_args()
        };
        let mut config = AppConfig::default();
        args.apply(&mut config);

        assert_eq!(config.library.output_dir, PathBuf::from("/books"));
        assert_eq!(config.transfers.pool_size, 2);
        assert_eq!(config.transfers.max_retries, transfers::MAX_RETRIES);
        assert!(!config.transfers.skip_multipart);
        assert_eq!(config.decoder.program, "/opt/ffmpeg");
    }

    #[test]
    fn test_parse_download_command() {
        let cli = Cli::try_parse_from([
            "audible_fetcher",
            "--region",
            "co.uk",
            "download",
            "library.json",
            "-w",
            "3",
            "--yes",
        ])
        .unwrap();

        assert_eq!(cli.global.region.as_deref(), Some("co.uk"));
        match cli.command {
            Commands::Download(args) => {
                assert_eq!(args.catalog, PathBuf::from("library.json"));
                assert_eq!(args.workers, Some(3));
                assert!(args.yes);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_log_level() {
        let quiet = Cli::try_parse_from(["audible_fetcher", "-q", "regions"]).unwrap();
        let verbose = Cli::try_parse_from(["audible_fetcher", "regions", "-v"]).unwrap();
        let debug = Cli::try_parse_from(["audible_fetcher", "--very-verbose", "regions"]).unwrap();

        assert_eq!(quiet.log_level(), tracing::Level::ERROR);
        assert_eq!(verbose.log_level(), tracing::Level::INFO);
        assert_eq!(debug.log_level(), tracing::Level::DEBUG);
    }
}
