//! Credential management for the Audible portal
//!
//! This module provides functions for finding, entering, verifying and
//! storing portal credentials in `.env` files.
//!
//! # Examples
//!
//! ```rust,no_run
//! use audible_fetcher::auth::{check_credentials, ensure_credentials};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! if !check_credentials() {
//!     println!("You will be asked to sign in.");
//! }
//! let credentials = ensure_credentials()?;
//! println!("Signing in as {}", credentials.username);
//! # Ok(())
//! # }
//! ```

pub mod credentials;

// Re-export main public API
pub use credentials::{
    check_credentials, credentials_from_env, ensure_credentials, get_auth_status,
    prompt_credentials, save_credentials, save_credentials_to, setup_credentials,
    show_auth_status, validate_username, verify_credentials, AuthStatus,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        let status = get_auth_status();
        assert_eq!(
            status.has_credentials(),
            status.username_set && status.password_set
        );
    }
}
