//! Audible Fetcher Library
//!
//! Downloads the audiobooks of an Audible library and decodes them with an
//! external decoder. Provides the portal login flow, activation key
//! derivation, resumable concurrent transfers and a progress tree.

pub mod app;
pub mod auth;
pub mod cli;
pub mod config;
pub mod constants;
pub mod errors;

// Re-export commonly used types for convenience
pub use errors::{AppError, Result};

#[cfg(test)]
mod tests {
    use super::*;
    use constants::*;

    #[test]
    fn test_constants_accessible() {
        assert_eq!(DEFAULT_POOL_SIZE, 5);
        assert_eq!(ENV_USERNAME, "AUDIBLE_USERNAME");
        assert_eq!(PARTIAL_FILE_SUFFIX, ".part");
    }

    #[test]
    fn test_error_types() {
        let auth_error = errors::AuthError::MissingCredentials;
        let app_error = AppError::Auth(auth_error);

        assert_eq!(app_error.category(), "authentication");
        assert!(!app_error.is_recoverable());
    }
}
