//! Command-line interface components
//!
//! This module contains CLI-specific code for Audible Fetcher: argument
//! parsing, command handlers, the progress display and terminal prompts.

pub mod args;
pub mod commands;
pub mod progress;
pub mod prompt;

pub use args::{AuthAction, AuthArgs, Cli, Commands, DownloadArgs, GlobalArgs};
pub use commands::{handle_activation, handle_auth, handle_download, handle_regions};
pub use progress::{ProgressConfig, ProgressDisplay};
pub use prompt::TerminalPrompter;
