//! Application constants for Audible Fetcher
//!
//! This module centralizes the constants used throughout the application,
//! organized by functional domain.

use std::time::Duration;

/// Environment variable names for authentication
pub mod env {
    /// Environment variable name for the portal username
    pub const USERNAME: &str = "AUDIBLE_USERNAME";

    /// Environment variable name for the portal password
    pub const PASSWORD: &str = "AUDIBLE_PASSWORD";

    /// Setting this to `true` disables query redaction in logged URLs
    pub const REDACT_DISABLE: &str = "REDACT_DISABLE";
}

/// HTTP client configuration constants
pub mod http {
    use super::Duration;

    /// Browser user agent sent with portal page requests
    pub const BROWSER_USER_AGENT: &str =
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:83.0) Gecko/20100101 Firefox/83.0";

    /// User agent the licensing endpoints expect
    pub const DOWNLOAD_MANAGER_USER_AGENT: &str = "Audible Download Manager";

    /// Accept header for page requests
    pub const HTML_ACCEPT: &str =
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";

    /// Accept-Language header for page requests
    pub const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

    /// Connection establishment timeout
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// TCP keep-alive interval
    pub const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

    /// Connection pool idle timeout
    pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(240);

    /// Maximum idle connections kept per host
    pub const POOL_MAX_PER_HOST: usize = 100;

    /// Maximum number of redirects to follow
    pub const MAX_REDIRECTS: usize = 10;
}

/// Portal URLs, paths and selectors used by the login flow
pub mod portal {
    /// Default region top-level domain
    pub const DEFAULT_REGION_TLD: &str = "com";

    /// Landing page path, bypassing the geo-redirect
    pub const LANDING_PATH: &str = "/?ipRedirectOverride=true";

    /// Protected resource used to confirm authentication
    pub const LIBRARY_PATH: &str = "/lib";

    /// Path the portal serves the sign-in form from
    pub const SIGNIN_PATH: &str = "/ap/signin";

    /// Query parameter kept verbatim when redacting URLs
    pub const REDACT_ALLOWLIST: &[&str] = &["ipRedirectOverride"];

    /// Form field names
    pub const EMAIL_FIELD: &str = "email";
    pub const PASSWORD_FIELD: &str = "password";
    pub const CAPTCHA_FIELD: &str = "cvf_captcha_input";
    pub const OTP_FIELD: &str = "otpCode";

    /// CSS selectors
    pub const SIGNIN_LINK_SELECTOR: &str = "a[class*='ui-it-sign-in-link']";
    pub const SUBMIT_FORM_SELECTOR: &str = "form[method]";
    pub const CAPTCHA_IMAGE_SELECTOR: &str = "form img";
    pub const FORM_LINK_SELECTOR: &str = "form a";
    pub const DEVICE_FORM_SELECTOR: &str = "form#auth-select-device-form";
    pub const DEVICE_OPTION_SELECTOR: &str = "fieldset > div";
    pub const RADIO_SELECTOR: &str = "input[type='radio']";
    pub const OTP_FORM_SELECTOR: &str = "form#auth-mfa-form";
    pub const OTP_INPUT_SELECTOR: &str = "input[name='otpCode']";
    pub const MESSAGE_BOX_SELECTOR: &str = "div[id*='-message-box']";

    /// Link text offered alongside a challenge image
    pub const CAPTCHA_REFRESH_TEXT: &str = "Try different image";

    /// Prompt shown when choosing where to receive a one-time code
    pub const DEVICE_CHOICE_MESSAGE: &str =
        "Choose where to receive the One Time Password (OTP)";
}

/// Licensing endpoint constants
pub mod license {
    /// Host serving the licensing endpoints, independent of region
    pub const BASE_URL: &str = "https://www.audible.com";

    /// Player token path on the portal
    pub const PLAYER_TOKEN_PATH: &str = "/player-auth-token";

    /// Licensing path on the license host
    pub const LICENSE_PATH: &str = "/license/licenseForCustomerToken";

    /// Default player id: base64 of the SHA-1 digest of "P1"
    pub const DEFAULT_PLAYER_ID: &str = "va8eyjPUYZ6A6Mpomht0pP67uyk=";

    /// Only supported key record version
    pub const SUPPORTED_VERSION: &str = "1";

    /// Exact byte length of one key record
    pub const RECORD_LENGTH: usize = 70;

    /// Number of leading record bytes that make up the activation key
    pub const KEY_BYTES: usize = 4;
}

/// Transfer and scheduling configuration
pub mod transfers {
    /// Default number of concurrent transfer workers
    pub const DEFAULT_POOL_SIZE: usize = 5;

    /// Maximum recommended pool size
    pub const MAX_POOL_SIZE: usize = 32;

    /// Default attempts per transfer
    pub const MAX_RETRIES: u32 = 3;

    /// Output name fragment the default filter skips
    pub const MULTIPART_MARKER: &str = "Part";
}

/// File operation constants
pub mod files {
    /// Suffix marking an in-progress transfer
    pub const PARTIAL_FILE_SUFFIX: &str = ".part";

    /// Longest filename kept after normalization
    pub const MAX_FILENAME_LENGTH: usize = 255;

    /// Per-book metadata file
    pub const INFO_FILE_NAME: &str = "info.txt";

    /// Directory used when an item has no authors
    pub const UNKNOWN_AUTHOR: &str = "Unknown Author";

    /// Default cookie cache file name
    pub const COOKIE_CACHE_FILE: &str = "cookiejar.json";

    /// Application directory name under the user config dir
    pub const APP_DIR_NAME: &str = "audible-fetcher";

    /// File credentials are saved to
    pub const ENV_FILE_NAME: &str = ".env";

    /// Owner read/write only
    pub const ENV_FILE_PERMISSIONS: u32 = 0o600;

    /// Longest accepted username (an email address or phone number)
    pub const MAX_USERNAME_LENGTH: usize = 254;
}

/// External decoder constants
pub mod decoder {
    /// Decoder executable
    pub const DEFAULT_PROGRAM: &str = "ffmpeg";

    /// Extension of encrypted downloads
    pub const ENCRYPTED_EXTENSION: &str = ".aax";

    /// Extension of decoded output
    pub const DECODED_EXTENSION: &str = ".mp4";

    /// Progress line prefix the decoder reports
    pub const TOTAL_SIZE_PREFIX: &str = "total_size=";

    /// Loopback address for the progress endpoint
    pub const PROGRESS_BIND_ADDR: &str = "127.0.0.1:0";
}

/// Progress display constants
pub mod progress {
    /// Display refresh interval (milliseconds)
    pub const UPDATE_FREQUENCY_MS: u64 = 100;
}

// Re-export commonly used constants for convenience
pub use env::{PASSWORD as ENV_PASSWORD, USERNAME as ENV_USERNAME};
pub use files::PARTIAL_FILE_SUFFIX;
pub use transfers::{DEFAULT_POOL_SIZE, MAX_RETRIES};
