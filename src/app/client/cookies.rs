//! Cookie store with an optional on-disk cache
//!
//! Wraps [`reqwest::cookie::Jar`] and remembers the raw `Set-Cookie` values
//! last seen per normalized URL (`scheme://host/path`). The cache is written
//! after every cookie update and replayed into the jar on startup, so a
//! solved login challenge survives between runs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use tracing::{debug, warn};
use url::Url;

use crate::errors::{AuthError, AuthResult};

/// Cookie name -> raw Set-Cookie value, per URL key
type CookieCache = HashMap<String, BTreeMap<String, String>>;

/// Cookie store shared by every request of a run
pub struct PersistentCookieStore {
    jar: Jar,
    seen: Mutex<CookieCache>,
    cache_path: Option<PathBuf>,
}

impl std::fmt::Debug for PersistentCookieStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCookieStore")
            .field("cache_path", &self.cache_path)
            .finish_non_exhaustive()
    }
}

/// Key used for the cache map
pub fn url_key(url: &Url) -> String {
    format!(
        "{}://{}{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.path()
    )
}

impl PersistentCookieStore {
    /// Store that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            jar: Jar::default(),
            seen: Mutex::new(HashMap::new()),
            cache_path: None,
        }
    }

    /// Store backed by `path`, loading any cookies saved by a previous run
    pub fn with_cache(path: impl Into<PathBuf>) -> AuthResult<Self> {
        let path = path.into();
        let store = Self {
            jar: Jar::default(),
            seen: Mutex::new(HashMap::new()),
            cache_path: Some(path.clone()),
        };

        match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => {
                let cache: CookieCache =
                    serde_json::from_str(&text).map_err(|e| AuthError::CookieStore {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                store.replay(cache);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AuthError::CookieStore {
                    path,
                    reason: e.to_string(),
                })
            }
        }

        Ok(store)
    }

    fn replay(&self, cache: CookieCache) {
        let mut restored = 0;
        for (key, cookies) in &cache {
            let Ok(url) = Url::parse(key) else {
                continue;
            };
            for raw in cookies.values() {
                self.jar.add_cookie_str(raw, &url);
                restored += 1;
            }
        }
        debug!("Restored {} cached cookies", restored);
        *self.lock_seen() = cache;
    }

    fn lock_seen(&self) -> std::sync::MutexGuard<'_, CookieCache> {
        match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of distinct cookies remembered across all URLs
    pub fn cached_count(&self) -> usize {
        self.lock_seen().values().map(BTreeMap::len).sum()
    }

    /// Cache file, if any
    pub fn cache_path(&self) -> Option<&Path> {
        self.cache_path.as_deref()
    }

    fn save(&self, cache: &CookieCache) -> std::io::Result<()> {
        let Some(path) = &self.cache_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(cache)?;
        std::fs::write(path, text)
    }
}

/// Cookie name from a raw `Set-Cookie` value
fn cookie_name(raw: &str) -> Option<&str> {
    let pair = raw.split(';').next()?;
    let (name, _) = pair.split_once('=')?;
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

impl CookieStore for PersistentCookieStore {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let headers: Vec<HeaderValue> = cookie_headers.cloned().collect();
        if headers.is_empty() {
            return;
        }
        self.jar.set_cookies(&mut headers.iter(), url);
        debug!("cookies.set({}, {})", url.host_str().unwrap_or_default(), headers.len());

        let mut seen = self.lock_seen();
        let entry = seen.entry(url_key(url)).or_default();
        for raw in headers.iter().filter_map(|h| h.to_str().ok()) {
            if let Some(name) = cookie_name(raw) {
                entry.insert(name.to_string(), raw.to_string());
            }
        }

        if let Err(e) = self.save(&seen) {
            warn!("cookies: failed to save file cache: {}", e);
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.jar.cookies(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn set(store: &PersistentCookieStore, url: &Url, values: &[&'static str]) {
        let headers: Vec<HeaderValue> = values.iter().map(|v| HeaderValue::from_static(v)).collect();
        store.set_cookies(&mut headers.iter(), url);
    }

    #[test]
    fn test_url_key_drops_query() {
        let url = Url::parse("https://www.audible.com/ap/signin?foo=bar").unwrap();
        assert_eq!(url_key(&url), "https://www.audible.com/ap/signin");
    }

    #[test]
    fn test_cookie_name_parsing() {
        assert_eq!(cookie_name("session-id=abc; Path=/"), Some("session-id"));
        assert_eq!(cookie_name("=abc"), None);
        assert_eq!(cookie_name("garbage"), None);
    }

    #[test]
    fn test_in_memory_store_round_trip() {
        let store = PersistentCookieStore::in_memory();
        let url = Url::parse("https://www.audible.com/").unwrap();
        set(&store, &url, &["session-id=abc; Path=/"]);

        let header = store.cookies(&url).unwrap();
        assert_eq!(header.to_str().unwrap(), "session-id=abc");
        assert_eq!(store.cached_count(), 1);
    }

    #[test]
    fn test_cache_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookiejar.json");
        let url = Url::parse("https://www.audible.com/lib").unwrap();

        {
            let store = PersistentCookieStore::with_cache(&path).unwrap();
            set(&store, &url, &["session-id=abc; Path=/", "ubid=42; Path=/"]);
            // A later value for the same name replaces the earlier one
            set(&store, &url, &["session-id=def; Path=/"]);
        }

        let reloaded = PersistentCookieStore::with_cache(&path).unwrap();
        assert_eq!(reloaded.cached_count(), 2);
        let header = reloaded.cookies(&url).unwrap();
        let header = header.to_str().unwrap();
        assert!(header.contains("session-id=def"));
        assert!(header.contains("ubid=42"));
    }

    #[test]
    fn test_missing_cache_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = PersistentCookieStore::with_cache(dir.path().join("none.json")).unwrap();
        assert_eq!(store.cached_count(), 0);
    }

    #[test]
    fn test_corrupt_cache_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookiejar.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            PersistentCookieStore::with_cache(&path),
            Err(AuthError::CookieStore { .. })
        ));
    }
}
