//! Audible Fetcher CLI application
//!
//! Command-line interface for downloading and decoding an Audible library.

use std::process;

use tracing::{info, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, EnvFilter};

use audible_fetcher::cli::{
    handle_activation, handle_auth, handle_download, handle_regions, Cli, Commands,
};
use audible_fetcher::errors::Result;

#[tokio::main]
async fn main() {
    let result = run().await;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Main application logic
async fn run() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    let cli = Cli::parse_args();
    init_logging(&cli);

    info!("Audible Fetcher v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Download(args) => {
            info!("Executing download command");
            handle_download(&cli.global, args).await
        }
        Commands::Activation => {
            info!("Executing activation command");
            handle_activation(&cli.global).await
        }
        Commands::Auth(args) => {
            info!("Executing auth command");
            handle_auth(&cli.global, args).await
        }
        Commands::Regions => {
            handle_regions();
            Ok(())
        }
    }
}

/// Initialize logging based on CLI verbosity settings
fn init_logging(cli: &Cli) {
    let log_level = cli.log_level();

    let mut filter = EnvFilter::from_default_env();
    let mut bad_directive = None;
    match format!("audible_fetcher={}", log_level).parse::<Directive>() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => bad_directive = Some(e),
    }

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(cli.global.very_verbose)
        .with_writer(std::io::stderr)
        .init();

    if let Some(e) = bad_directive {
        warn!("Ignoring log directive: {}", e);
    }
    if cli.global.very_verbose {
        info!("Very verbose logging enabled");
    } else if cli.global.verbose {
        info!("Verbose logging enabled");
    }
}
