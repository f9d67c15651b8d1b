//! Error types for Audible Fetcher
//!
//! Each pipeline component has its own error enum. Authentication and
//! activation errors are fatal for a run; transfer and decode errors are
//! collected per item so that one title never blocks the others.

use std::path::PathBuf;

use thiserror::Error;

use crate::app::auth::AuthStep;

/// Failure of a single cancellable portal request
#[derive(Error, Debug)]
pub enum SendError {
    /// The run's cancellation token fired before the request finished
    #[error("request cancelled")]
    Cancelled,

    /// Transport or body error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Why a single authentication step could not complete
#[derive(Error, Debug)]
pub enum StepFailure {
    /// No form with a submit method on the current page
    #[error("unable to find a submittable form on the page")]
    FormNotFound,

    /// Landing page had no sign-in link
    #[error("unable to find the sign in link")]
    SigninLinkNotFound,

    /// A challenge image was served but no CAPTCHA handler was supplied
    #[error("captcha encountered and no captcha handler was supplied")]
    CaptchaHandlerMissing,

    /// A one-time-code field was served but no code supplier was supplied
    #[error("one-time code requested and no code handler was supplied")]
    OtpHandlerMissing,

    /// A device choice was requested but no choice handler was supplied
    #[error("device selection requested and no choice handler was supplied")]
    ChoiceHandlerMissing,

    /// Device selection form carried no selectable options
    #[error("unable to detect two-step verification options")]
    DeviceOptionsNotFound,

    /// Choice handler returned an index outside the option list
    #[error("choice {index} is out of range for {count} options")]
    InvalidChoice { index: usize, count: usize },

    /// Protected resource was served from the sign-in page
    #[error("auth verification failed")]
    VerificationFailed,

    /// Network failure inside the step
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Authentication-related errors
#[derive(Error, Debug)]
pub enum AuthError {
    /// A login step failed; the whole sequence is aborted
    #[error("authentication step {step} failed: {cause}")]
    StepFailed {
        step: AuthStep,
        #[source]
        cause: StepFailure,
    },

    /// The run was cancelled while authenticating
    #[error("authentication cancelled")]
    Cancelled,

    /// Missing credentials
    #[error(
        "Missing credentials. Set AUDIBLE_USERNAME and AUDIBLE_PASSWORD or enter them when prompted"
    )]
    MissingCredentials,

    /// HTTP client construction failed
    #[error("HTTP client setup failed")]
    Http(#[from] reqwest::Error),

    /// Invalid portal URL
    #[error("Invalid URL: {url} - {error}")]
    InvalidUrl { url: String, error: String },

    /// Cookie cache could not be read or written
    #[error("Cookie cache error at {path}: {reason}")]
    CookieStore { path: PathBuf, reason: String },

    /// Credential storage or terminal input error
    #[error("Credential storage error: {0}")]
    CredentialStorage(#[from] std::io::Error),

    /// Entered username was rejected before any request
    #[error("Invalid username: {reason}")]
    InvalidUsername { reason: String },
}

impl AuthError {
    /// Wrap a step failure with the step it happened in
    pub fn step(step: AuthStep, cause: impl Into<StepFailure>) -> Self {
        Self::StepFailed {
            step,
            cause: cause.into(),
        }
    }
}

/// Activation key derivation errors
#[derive(Error, Debug)]
pub enum ActivationError {
    /// Licensing response reported a record version we cannot parse
    #[error("activation extraction failed: expected version=1, got version={found}")]
    UnsupportedVersion { found: String },

    /// No well-formed key record in the licensing response
    #[error("activation extraction failed: malformed key record")]
    MalformedKeyRecord,

    /// Player token redirect did not carry a token
    #[error("unable to get player token")]
    PlayerTokenMissing,

    /// HTTP request failed during the licensing round-trip
    #[error("licensing request failed")]
    Http(#[from] reqwest::Error),

    /// Invalid licensing URL
    #[error("Invalid URL: {url} - {error}")]
    InvalidUrl { url: String, error: String },

    /// The run was cancelled while requesting the key
    #[error("activation request cancelled")]
    Cancelled,

    /// A key given by the user is not eight hex characters
    #[error("invalid activation key {0:?}: expected 8 hexadecimal characters")]
    InvalidKey(String),
}

impl From<SendError> for ActivationError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Cancelled => ActivationError::Cancelled,
            SendError::Http(e) => ActivationError::Http(e),
        }
    }
}

/// Download and transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during file operations
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Server returned error status
    #[error("Server error: HTTP {status}")]
    ServerError { status: u16 },

    /// Ranged response did not carry the expected number of bytes
    #[error(
        "{filename}: range response size mismatch: partial size {partial}, expected {expected} bytes, got {received:?}"
    )]
    RangeMismatch {
        filename: String,
        partial: u64,
        expected: u64,
        received: Option<u64>,
    },

    /// Invalid URL provided
    #[error("Invalid URL: {url} - {error}")]
    InvalidUrl { url: String, error: String },

    /// No destination directory was given
    #[error("Destination directory is required")]
    MissingDirectory,

    /// Filter predicate rejected the transfer; an intentional skip
    #[error("Transfer aborted: {path}")]
    Aborted { path: PathBuf },

    /// Every attempt failed
    #[error("Transfer failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<TransferError>,
    },

    /// The run was cancelled
    #[error("Transfer cancelled")]
    Cancelled,

    /// Scheduler no longer accepts work
    #[error("Transfer scheduler is closed")]
    SchedulerClosed,

    /// Worker ended without reporting a result
    #[error("Transfer worker ended without a result")]
    WorkerLost,
}

impl TransferError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Http(_) | TransferError::Io(_) | TransferError::ServerError { .. }
        )
    }

    /// Whether this is an intentional skip rather than a failure
    pub fn is_abort(&self) -> bool {
        matches!(self, TransferError::Aborted { .. })
    }
}

impl From<SendError> for TransferError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Cancelled => TransferError::Cancelled,
            SendError::Http(e) => TransferError::Http(e),
        }
    }
}

/// External decoder errors
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Encrypted input is missing
    #[error("Decoder input not found: {path}")]
    MissingInput { path: PathBuf },

    /// Progress endpoint could not be started
    #[error("Failed to start decoder progress endpoint: {0}")]
    Endpoint(#[source] std::io::Error),

    /// Decoder could not be launched
    #[error("Failed to launch decoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Decoder exited unsuccessfully
    #[error("Decoder exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    /// Cleanup or filesystem error
    #[error("Decoder file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled
    #[error("Decode cancelled")]
    Cancelled,
}

/// Catalog loading errors
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Catalog file not found
    #[error("Catalog file not found: {path}")]
    NotFound { path: PathBuf },

    /// JSON parsing error
    #[error("Invalid catalog file: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// I/O error reading the catalog
    #[error("I/O error reading catalog: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: PathBuf },

    /// Invalid configuration format
    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}. {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// Unknown region
    #[error("Unknown region: {0}")]
    UnknownRegion(String),

    /// I/O error while reading or creating configuration
    #[error("Configuration I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level application error that can represent any error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Authentication error
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Activation error
    #[error(transparent)]
    Activation(#[from] ActivationError),

    /// Transfer error
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Decode error
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Catalog error
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Generic I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic application error with context
    #[error("Application error: {message}")]
    Generic { message: String },
}

impl AppError {
    /// Create a generic application error with a message
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable (transient)
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Transfer(e) => e.is_retryable(),
            AppError::Activation(ActivationError::Http(_)) => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "authentication",
            AppError::Activation(_) => "activation",
            AppError::Transfer(_) => "transfer",
            AppError::Decode(_) => "decode",
            AppError::Catalog(_) => "catalog",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Generic { .. } => "generic",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

/// Authentication result type alias
pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Activation result type alias
pub type ActivationResult<T> = std::result::Result<T, ActivationError>;

/// Transfer result type alias
pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// Decode result type alias
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Catalog result type alias
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Configuration result type alias
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
