//! Core application logic for Audible Fetcher
//!
//! This module contains the acquisition pipeline: the portal client and login
//! flow, activation key derivation, resumable transfers with their scheduler,
//! the decoder hand-off, and the progress tree tying them together.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use audible_fetcher::app::{
//!     AcquisitionPipeline, AuthSession, ClientConfig, Credentials, JsonCatalog, NoPrompter,
//!     PersistentCookieStore, PipelineOptions, PortalClient,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PortalClient::new(
//!     "https://www.audible.com".parse()?,
//!     &ClientConfig::default(),
//!     Arc::new(PersistentCookieStore::in_memory()),
//!     CancellationToken::new(),
//! )?;
//! let session = AuthSession::new(
//!     client,
//!     Credentials::new("user@example.com", "secret"),
//!     Arc::new(NoPrompter),
//! );
//!
//! let pipeline = AcquisitionPipeline::prepare(
//!     session,
//!     audible_fetcher::constants::license::DEFAULT_PLAYER_ID,
//!     PipelineOptions::default(),
//! )
//! .await?;
//!
//! let mut catalog = JsonCatalog::load("catalog.json")?;
//! let report = pipeline.run(&mut catalog).await;
//! for error in &report.errors {
//!     eprintln!("{}", error);
//! }
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod auth;
pub mod catalog;
pub mod client;
pub mod decode;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod signals;
pub mod transfer;

// Re-export main public API
pub use activation::{extract_activation_key, request_activation_key, ActivationKey};
pub use auth::{AuthSession, AuthStep, Credentials, NoPrompter, Prompter};
pub use catalog::{Catalog, JsonCatalog};
pub use client::{ClientConfig, PersistentCookieStore, PortalClient};
pub use decode::{DecodeOutcome, DecodeStage};
pub use models::{CatalogItem, Region, REGIONS};
pub use pipeline::{AcquisitionPipeline, ItemError, ItemStage, PipelineOptions, RunReport};
pub use progress::{ProgressComposite, ProgressLeaf, ProgressSource};
pub use signals::{shutdown_token, SignalHandler};
pub use transfer::{
    Transfer, TransferFailure, TransferHandle, TransferOutcome, TransferScheduler,
};
