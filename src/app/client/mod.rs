//! Shared portal HTTP client
//!
//! This module provides the single cookie-bearing HTTP client a run uses for
//! the login flow, the licensing calls and every transfer worker.
//!
//! The module is organized into specialized components:
//! - `config`: HTTP client configuration and building
//! - `cookies`: cookie store with an optional on-disk cache
//!
//! Every request goes through [`PortalClient::send`], which races the request
//! against the run's cancellation token.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use reqwest::header::{self, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::constants::{env as env_constants, http, license, portal};
use crate::errors::{AuthError, AuthResult, SendError};

pub mod config;
pub mod cookies;

pub use config::ClientConfig;
pub use cookies::PersistentCookieStore;

/// HTTP client bound to one portal region
///
/// Cloning is cheap; clones share the connection pool, the cookie store and
/// the cancellation token.
#[derive(Debug, Clone)]
pub struct PortalClient {
    http: Client,
    base_url: Url,
    license_url: Url,
    cookies: Arc<PersistentCookieStore>,
    cancel: CancellationToken,
}

impl PortalClient {
    /// Creates a client for the portal at `base_url`
    ///
    /// # Errors
    ///
    /// Returns `AuthError` if the HTTP client cannot be built or the default
    /// license URL is invalid
    pub fn new(
        base_url: Url,
        config: &ClientConfig,
        cookies: Arc<PersistentCookieStore>,
        cancel: CancellationToken,
    ) -> AuthResult<Self> {
        let http = config.build_http_client(cookies.clone())?;
        let license_url = Url::parse(license::BASE_URL).map_err(|e| AuthError::InvalidUrl {
            url: license::BASE_URL.to_string(),
            error: e.to_string(),
        })?;

        tracing::info!("Created portal client for {}", base_url);

        Ok(Self {
            http,
            base_url,
            license_url,
            cookies,
            cancel,
        })
    }

    /// Use a different host for the licensing endpoints
    pub fn with_license_url(mut self, license_url: Url) -> Self {
        self.license_url = license_url;
        self
    }

    /// Underlying reqwest client
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn license_url(&self) -> &Url {
        &self.license_url
    }

    pub fn cookies(&self) -> &Arc<PersistentCookieStore> {
        &self.cookies
    }

    /// Token cancelled when the run is interrupted
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves a possibly relative reference against the portal base URL
    pub fn resolve(&self, reference: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(reference.trim())
    }

    /// Page request with browser-like headers
    pub fn get(&self, url: Url) -> RequestBuilder {
        self.http
            .get(url)
            .header(header::ACCEPT, HeaderValue::from_static(http::HTML_ACCEPT))
    }

    /// Metadata-only request, used for filename detection
    pub fn head(&self, url: Url) -> RequestBuilder {
        self.http.head(url)
    }

    /// Form submission with `referer` as the originating page
    pub fn post_form(&self, action: Url, referer: &Url, fields: &[(String, String)]) -> RequestBuilder {
        self.http
            .post(action)
            .header(header::ACCEPT, HeaderValue::from_static(http::HTML_ACCEPT))
            .header(header::REFERER, referer.as_str())
            .form(fields)
    }

    /// Licensing request carrying the download-manager user agent
    pub fn license_get(&self, url: Url) -> RequestBuilder {
        self.http.get(url).header(
            header::USER_AGENT,
            HeaderValue::from_static(http::DOWNLOAD_MANAGER_USER_AGENT),
        )
    }

    /// Sends a request unless the run is cancelled first
    ///
    /// # Errors
    ///
    /// Returns `SendError::Cancelled` if the token fires before the response
    /// headers arrive, `SendError::Http` on transport errors
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, SendError> {
        let request = request.build()?;
        debug!("{} {}", request.method(), redact_url(request.url()));

        let response = self.cancellable(self.http.execute(request)).await??;
        debug!("-> {}: {}", redact_url(response.url()), response.status());
        Ok(response)
    }

    /// Sends a request and reads the whole body as text
    ///
    /// Returns the final URL after redirects along with the body.
    pub async fn send_text(&self, request: RequestBuilder) -> Result<(Url, String), SendError> {
        let response = self.send(request).await?;
        let url = response.url().clone();
        let body = self.cancellable(response.text()).await??;
        Ok((url, body))
    }

    /// Races `fut` against the cancellation token
    pub async fn cancellable<F, T>(&self, fut: F) -> Result<T, SendError>
    where
        F: Future<Output = T>,
    {
        if self.cancel.is_cancelled() {
            return Err(SendError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SendError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Landing page URL that bypasses the geo-redirect
    pub fn landing_url(&self) -> Result<Url, url::ParseError> {
        self.resolve(portal::LANDING_PATH)
    }
}

fn redact_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var(env_constants::REDACT_DISABLE)
            .map(|v| v != "true")
            .unwrap_or(true)
    })
}

/// URL for logging, with query values replaced unless allowlisted
pub fn redact_url(url: &Url) -> String {
    redact_with(url, redact_enabled())
}

fn redact_with(url: &Url, enabled: bool) -> String {
    if !enabled || url.query().is_none() {
        return url.to_string();
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let value = if portal::REDACT_ALLOWLIST.contains(&key.as_ref()) {
                value.into_owned()
            } else {
                "REDACTED".to_string()
            };
            (key.into_owned(), value)
        })
        .collect();

    let mut redacted = url.clone();
    redacted.set_fragment(None);
    redacted.set_query(None);
    if !pairs.is_empty() {
        redacted.query_pairs_mut().extend_pairs(pairs);
    }
    redacted.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(base: &str) -> PortalClient {
        PortalClient::new(
            Url::parse(base).unwrap(),
            &ClientConfig::default(),
            Arc::new(PersistentCookieStore::in_memory()),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_redact_query_values() {
        let url = Url::parse(
            "https://www.audible.com/player-auth-token?ipRedirectOverride=true&playerToken=secret",
        )
        .unwrap();
        let redacted = redact_with(&url, true);
        assert!(redacted.contains("ipRedirectOverride=true"));
        assert!(redacted.contains("playerToken=REDACTED"));
        assert!(!redacted.contains("secret"));

        assert_eq!(redact_with(&url, false), url.to_string());
    }

    #[test]
    fn test_redact_without_query() {
        let url = Url::parse("https://www.audible.com/lib").unwrap();
        assert_eq!(redact_with(&url, true), "https://www.audible.com/lib");
    }

    #[test]
    fn test_resolve_relative_references() {
        let client = test_client("https://www.audible.co.uk");
        assert_eq!(
            client.resolve("/lib").unwrap().as_str(),
            "https://www.audible.co.uk/lib"
        );
        assert_eq!(
            client.landing_url().unwrap().as_str(),
            "https://www.audible.co.uk/?ipRedirectOverride=true"
        );
        assert_eq!(
            client.resolve("https://www.amazon.com/ap/signin").unwrap().host_str(),
            Some("www.amazon.com")
        );
    }

    #[tokio::test]
    async fn test_send_after_cancel_makes_no_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/lib").expect(0).create_async().await;

        let client = test_client(&server.url());
        client.cancel_token().cancel();

        let url = client.resolve("/lib").unwrap();
        let result = client.send(client.get(url)).await;
        assert!(matches!(result, Err(SendError::Cancelled)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_license_requests_use_download_manager_agent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/license")
            .match_header("user-agent", http::DOWNLOAD_MANAGER_USER_AGENT)
            .with_body("ok")
            .create_async()
            .await;

        let client = test_client(&server.url());
        let url = client.resolve("/license").unwrap();
        let (_, body) = client.send_text(client.license_get(url)).await.unwrap();
        assert_eq!(body, "ok");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_page_requests_use_browser_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("user-agent", http::BROWSER_USER_AGENT)
            .match_header("accept-language", http::ACCEPT_LANGUAGE)
            .match_header("dnt", "1")
            .with_body("<html></html>")
            .create_async()
            .await;

        let client = test_client(&server.url());
        let url = client.resolve("/").unwrap();
        client.send_text(client.get(url)).await.unwrap();
        mock.assert_async().await;
    }
}
