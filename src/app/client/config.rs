//! HTTP client configuration and building logic
//!
//! This module handles the configuration and construction of the shared,
//! cookie-bearing HTTP client used by the login flow, the licensing calls and
//! every transfer worker.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::cookies::PersistentCookieStore;
use crate::constants::http;
use crate::errors::{AuthError, AuthResult};

/// Configuration for the shared HTTP client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// TCP keep-alive settings
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Option<Duration>,
    /// TCP nodelay (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
    /// Connection pool idle timeout
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Option<Duration>,
    /// Maximum idle connections per host
    pub pool_max_per_host: usize,
    /// Connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Maximum redirects followed per request
    pub max_redirects: usize,
    /// User agent for page requests
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tcp_keepalive: Some(http::TCP_KEEPALIVE),
            tcp_nodelay: true,
            pool_idle_timeout: Some(http::POOL_IDLE_TIMEOUT),
            pool_max_per_host: http::POOL_MAX_PER_HOST,
            connect_timeout: http::CONNECT_TIMEOUT,
            max_redirects: http::MAX_REDIRECTS,
            user_agent: http::BROWSER_USER_AGENT.to_string(),
        }
    }
}

impl ClientConfig {
    /// Headers every request carries unless the request overrides them
    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static(http::ACCEPT_LANGUAGE),
        );
        headers.insert(header::DNT, HeaderValue::from_static("1"));
        headers.insert(
            header::UPGRADE_INSECURE_REQUESTS,
            HeaderValue::from_static("1"),
        );
        headers
    }

    /// Builds the HTTP client backed by the given cookie store
    pub fn build_http_client(&self, cookies: Arc<PersistentCookieStore>) -> AuthResult<Client> {
        // No whole-request timeout: it would also bound multi-gigabyte bodies
        let mut client_builder = Client::builder()
            .cookie_provider(cookies)
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.clone())
            .default_headers(Self::default_headers())
            .redirect(Policy::limited(self.max_redirects))
            .tcp_nodelay(self.tcp_nodelay)
            .pool_max_idle_per_host(self.pool_max_per_host);

        if let Some(keepalive) = self.tcp_keepalive {
            client_builder = client_builder.tcp_keepalive(keepalive);
        }

        if let Some(idle_timeout) = self.pool_idle_timeout {
            client_builder = client_builder.pool_idle_timeout(idle_timeout);
        }

        client_builder.build().map_err(AuthError::Http)
    }
}
