//! Command handlers for Audible Fetcher CLI
//!
//! This module implements the command handlers that connect CLI arguments
//! with configuration loading, sign-in and the acquisition pipeline.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::{
    request_activation_key, shutdown_token, AcquisitionPipeline, ActivationKey, AuthSession,
    Catalog, CatalogItem, JsonCatalog, PersistentCookieStore, PortalClient, Prompter, REGIONS,
};
use crate::auth::{ensure_credentials, setup_credentials, show_auth_status, verify_credentials};
use crate::cli::prompt::{self, TerminalPrompter};
use crate::cli::{AuthAction, AuthArgs, DownloadArgs, GlobalArgs, ProgressConfig, ProgressDisplay};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};

/// Loads configuration and applies the global flags
async fn load_config(global: &GlobalArgs) -> Result<AppConfig> {
    if global.config.is_none() {
        if let Some(created) = AppConfig::initialize_first_run().await? {
            debug!("Using user configuration at {}", created.display());
        }
    }

    let mut config = AppConfig::load(global.config.clone()).await?;
    global.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Builds the portal client shared by sign-in, licensing and transfers
fn build_client(config: &AppConfig, cancel: CancellationToken) -> Result<PortalClient> {
    let cookies = match config.library.cookie_cache_path() {
        Some(path) => {
            debug!("Using cookie cache {}", path.display());
            PersistentCookieStore::with_cache(path)?
        }
        None => PersistentCookieStore::in_memory(),
    };

    let client = PortalClient::new(
        config.portal.base_url()?,
        &config.client,
        Arc::new(cookies),
        cancel,
    )?
    .with_license_url(config.portal.license_url()?);
    Ok(client)
}

/// Cancellation wired to CTRL-C and SIGTERM for the duration of a command
struct Interrupts {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Interrupts {
    fn install() -> Self {
        let (token, task) = shutdown_token();
        Self { token, task }
    }
}

impl Drop for Interrupts {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn print_titles(items: &[CatalogItem], pending: &[usize]) {
    for &index in pending {
        let item = &items[index];
        if item.authors.is_empty() {
            println!("  {}", item.title);
        } else {
            println!("  {} - {}", item.authors.join(", "), item.title);
        }
    }
}

/// Asks whether to go ahead; "list" prints the titles and asks again
fn confirm_download(items: &[CatalogItem], pending: &[usize]) -> bool {
    loop {
        let question = format!("Download {} new titles? [yes/no/list]", pending.len());
        match prompt::read_line(&question) {
            Ok(Some(answer)) => match answer.to_lowercase().as_str() {
                "y" | "yes" => return true,
                "l" | "list" => print_titles(items, pending),
                _ => return false,
            },
            Ok(None) | Err(_) => return false,
        }
    }
}

/// Handle the download command
///
/// Loads the catalog, asks for confirmation, signs in, derives the activation
/// key (unless one was given) and runs the acquisition pipeline.
pub async fn handle_download(global: &GlobalArgs, args: DownloadArgs) -> Result<()> {
    let start_time = Instant::now();
    args.validate().map_err(AppError::generic)?;

    let mut config = load_config(global).await?;
    args.apply(&mut config);
    config.validate()?;
    let options = config.pipeline_options();

    let mut catalog = JsonCatalog::load(&args.catalog)?;
    let items = catalog.items().to_vec();
    let pending = options.pending_items(&items);
    info!(
        "Catalog {} lists {} titles, {} new",
        args.catalog.display(),
        items.len(),
        pending.len()
    );

    if pending.is_empty() {
        println!("Nothing new to download ({} titles already present).", items.len());
        return Ok(());
    }

    if args.dry_run {
        println!("{} new titles would be downloaded:", pending.len());
        print_titles(&items, &pending);
        return Ok(());
    }

    if !args.yes && !confirm_download(&items, &pending) {
        println!("Download cancelled.");
        return Ok(());
    }

    let credentials = ensure_credentials()?;
    let interrupts = Interrupts::install();
    let client = build_client(&config, interrupts.token.clone())?;
    let session = AuthSession::new(client, credentials, Arc::new(TerminalPrompter));

    let pipeline = match &args.activation_key {
        Some(raw) => {
            let key: ActivationKey = raw.parse()?;
            let client = session.authenticate().await?;
            AcquisitionPipeline::new(client, key, options)
        }
        None => AcquisitionPipeline::prepare(session, &config.portal.player_id, options).await?,
    };
    info!("Setup completed in {:?}", start_time.elapsed());

    let mut display = ProgressDisplay::new(ProgressConfig {
        enable_progress_bars: !args.no_progress && !global.quiet,
        ..ProgressConfig::default()
    });
    display.start(pipeline.progress(), pending.len());

    let report = pipeline.run(&mut catalog).await;

    display.finish().await;
    display.print_summary(&report);
    info!("Download command finished in {:?}", start_time.elapsed());

    if report.cancelled {
        return Err(AppError::generic("Download interrupted"));
    }
    if !report.is_success() {
        warn!("Run finished with {} errors", report.errors.len());
        return Err(AppError::generic(format!(
            "{} titles or files failed",
            report.errors.len()
        )));
    }
    Ok(())
}

/// Handle the activation command: sign in and print the key
pub async fn handle_activation(global: &GlobalArgs) -> Result<()> {
    let config = load_config(global).await?;
    let credentials = ensure_credentials()?;

    let interrupts = Interrupts::install();
    let client = build_client(&config, interrupts.token.clone())?;
    let client = AuthSession::new(client, credentials, Arc::new(TerminalPrompter))
        .authenticate()
        .await?;

    let key = request_activation_key(&client, &config.portal.player_id).await?;
    println!("{}", key);
    Ok(())
}

/// Handle authentication management commands
pub async fn handle_auth(global: &GlobalArgs, args: AuthArgs) -> Result<()> {
    let config = load_config(global).await?;
    let interrupts = Interrupts::install();
    let client = build_client(&config, interrupts.token.clone())?;
    let prompter: Arc<dyn Prompter> = Arc::new(TerminalPrompter);

    match args.action {
        AuthAction::Setup { force } => {
            setup_credentials(client, prompter, force).await?;
        }
        AuthAction::Verify => {
            let credentials = ensure_credentials()?;
            if !verify_credentials(client, credentials, prompter).await? {
                return Err(AppError::generic("Credential verification failed"));
            }
        }
        AuthAction::Status => {
            show_auth_status(client, prompter).await?;
        }
    }

    Ok(())
}

/// Handle the regions command
pub fn handle_regions() {
    println!("REGION           TLD");
    for region in REGIONS {
        println!("{:<16} {}", region.name, region.tld);
    }
}
