//! Portal credential management
//!
//! Credentials come from `AUDIBLE_USERNAME`/`AUDIBLE_PASSWORD` (usually via a
//! `.env` file) or are entered at the terminal. Saved `.env` files are made
//! readable by the owner only.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::app::{AuthSession, Credentials, PortalClient, Prompter};
use crate::cli::prompt;
use crate::constants::{env as env_constants, files};
use crate::errors::{AuthError, AuthResult};

/// Authentication status information
#[derive(Debug, Clone)]
pub struct AuthStatus {
    /// Whether username environment variable is set
    pub username_set: bool,
    /// Whether password environment variable is set
    pub password_set: bool,
    /// Whether .env file exists in current directory
    pub dotenv_file_exists: bool,
    /// Whether credentials have been verified (None = not tested)
    pub credentials_valid: Option<bool>,
}

impl AuthStatus {
    /// Check if both credentials are available in environment
    pub fn has_credentials(&self) -> bool {
        self.username_set && self.password_set
    }

    /// Get descriptive status message for display
    pub fn status_message(&self) -> String {
        match (self.has_credentials(), self.credentials_valid) {
            (false, _) => "Missing credentials - run 'auth setup' to configure".to_string(),
            (true, None) => "Credentials configured but not verified".to_string(),
            (true, Some(true)) => "Credentials configured and verified".to_string(),
            (true, Some(false)) => "Credentials configured but sign-in failed".to_string(),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Check current authentication status
pub fn get_auth_status() -> AuthStatus {
    AuthStatus {
        username_set: non_empty_var(env_constants::USERNAME).is_some(),
        password_set: non_empty_var(env_constants::PASSWORD).is_some(),
        dotenv_file_exists: Path::new(files::ENV_FILE_NAME).exists(),
        credentials_valid: None,
    }
}

/// Check if credentials exist in environment variables
pub fn check_credentials() -> bool {
    credentials_from_env().is_some()
}

/// Credentials from the environment, if both are set
pub fn credentials_from_env() -> Option<Credentials> {
    let username = non_empty_var(env_constants::USERNAME)?;
    let password = non_empty_var(env_constants::PASSWORD)?;
    Some(Credentials::new(username.trim(), password))
}

/// Username rules checked before any request is made
pub fn validate_username(username: &str) -> AuthResult<()> {
    if username.is_empty() {
        return Err(AuthError::InvalidUsername {
            reason: "Username cannot be empty".to_string(),
        });
    }
    if username.len() > files::MAX_USERNAME_LENGTH {
        return Err(AuthError::InvalidUsername {
            reason: format!(
                "Username is longer than {} characters",
                files::MAX_USERNAME_LENGTH
            ),
        });
    }
    if username.chars().any(char::is_whitespace) {
        return Err(AuthError::InvalidUsername {
            reason: "Username cannot contain whitespace".to_string(),
        });
    }
    Ok(())
}

/// Prompt user for credentials interactively
pub fn prompt_credentials() -> AuthResult<Credentials> {
    let username =
        prompt::read_line("Audible username (email or phone)")?.ok_or(AuthError::MissingCredentials)?;
    validate_username(&username)?;

    let password = rpassword::prompt_password("Audible password: ")?;
    if password.is_empty() {
        return Err(AuthError::MissingCredentials);
    }

    Ok(Credentials::new(username, password))
}

/// Save credentials to `.env` in the current directory
pub fn save_credentials(credentials: &Credentials) -> AuthResult<()> {
    save_credentials_to(Path::new(files::ENV_FILE_NAME), credentials)?;

    eprintln!("Credentials saved to {}", files::ENV_FILE_NAME);
    #[cfg(unix)]
    eprintln!("File permissions set to owner-only (600)");
    #[cfg(not(unix))]
    eprintln!("Warning: file permissions not set; make sure the .env file is protected.");

    Ok(())
}

/// Writes or updates the credential lines of the env file at `path`
///
/// Other lines are preserved. The current process environment is updated too.
pub fn save_credentials_to(path: &Path, credentials: &Credentials) -> AuthResult<()> {
    let username_line = format!("{}={}", env_constants::USERNAME, credentials.username);
    let password_line = format!("{}={}", env_constants::PASSWORD, credentials.password);
    let username_prefix = format!("{}=", env_constants::USERNAME);
    let password_prefix = format!("{}=", env_constants::PASSWORD);

    let existing = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let mut username_found = false;
    let mut password_found = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with(&username_prefix) {
                username_found = true;
                username_line.clone()
            } else if trimmed.starts_with(&password_prefix) {
                password_found = true;
                password_line.clone()
            } else {
                line.to_string()
            }
        })
        .collect();

    if !username_found {
        lines.push(username_line);
    }
    if !password_found {
        lines.push(password_line);
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    for line in &lines {
        writeln!(file, "{}", line)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(files::ENV_FILE_PERMISSIONS);
        file.set_permissions(perms)?;
    }

    env::set_var(env_constants::USERNAME, &credentials.username);
    env::set_var(env_constants::PASSWORD, &credentials.password);

    info!("Saved credentials to {}", path.display());
    Ok(())
}

/// Environment credentials, or terminal input when none are set
pub fn ensure_credentials() -> AuthResult<Credentials> {
    if let Some(credentials) = credentials_from_env() {
        return Ok(credentials);
    }

    eprintln!(
        "No credentials found in {} / {}.",
        env_constants::USERNAME,
        env_constants::PASSWORD
    );
    prompt_credentials()
}

/// Signs in with `credentials`; `Ok(false)` when the portal rejects them
///
/// Cancellation and client setup problems are returned as errors.
pub async fn verify_credentials(
    client: PortalClient,
    credentials: Credentials,
    prompter: Arc<dyn Prompter>,
) -> AuthResult<bool> {
    credentials.validate()?;
    eprintln!("Signing in to {}...", client.base_url());

    match AuthSession::new(client, credentials, prompter).authenticate().await {
        Ok(_) => {
            eprintln!("Credentials verified successfully!");
            Ok(true)
        }
        Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
        Err(e) => {
            warn!("Credential verification failed: {}", e);
            eprintln!("Credential verification failed: {}", e);
            Ok(false)
        }
    }
}

/// Interactive credential setup workflow
pub async fn setup_credentials(
    client: PortalClient,
    prompter: Arc<dyn Prompter>,
    force: bool,
) -> AuthResult<()> {
    eprintln!("Audible Authentication Setup");
    eprintln!("============================");
    eprintln!();
    eprintln!("Your credentials will be stored in a .env file in the current directory.");
    eprintln!();

    if get_auth_status().has_credentials() && !force {
        eprintln!("Warning: Credentials are already configured.");
        if !prompt::confirm("Do you want to update them?", false) {
            eprintln!("Setup cancelled.");
            return Ok(());
        }
        eprintln!();
    }

    let credentials = prompt_credentials()?;
    save_credentials(&credentials)?;

    eprintln!();
    if verify_credentials(client, credentials, prompter).await? {
        eprintln!("Setup complete!");
    } else {
        eprintln!("Setup failed. Run 'auth setup' again to re-enter your credentials.");
    }

    Ok(())
}

/// Show current authentication status, signing in when credentials exist
pub async fn show_auth_status(client: PortalClient, prompter: Arc<dyn Prompter>) -> AuthResult<()> {
    let mut status = get_auth_status();

    eprintln!("Audible Authentication Status");
    eprintln!("=============================");
    eprintln!();

    match non_empty_var(env_constants::USERNAME) {
        Some(username) => eprintln!("Username: {} (set)", username),
        None => eprintln!("Username: Not set"),
    }
    eprintln!(
        "Password: {}",
        if status.password_set { "Set" } else { "Not set" }
    );
    eprintln!(
        ".env file: {}",
        if status.dotenv_file_exists {
            "Exists"
        } else {
            "Not found"
        }
    );
    eprintln!();

    if let Some(credentials) = credentials_from_env() {
        status.credentials_valid = Some(verify_credentials(client, credentials, prompter).await?);
        eprintln!();
    }

    eprintln!("Status: {}", status.status_message());
    if !status.has_credentials() || status.credentials_valid == Some(false) {
        eprintln!();
        eprintln!("To configure credentials, run: audible_fetcher auth setup");
    }

    Ok(())
}
