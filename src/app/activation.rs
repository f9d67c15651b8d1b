//! Activation key negotiation and extraction
//!
//! The licensing endpoint answers with a few `(key=value)` metadata lines
//! followed by fixed-width 70-byte key records. The decoder needs the first
//! four bytes of the first record, hex-encoded in reverse byte order.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info};
use url::Url;

use crate::app::client::PortalClient;
use crate::constants::license;
use crate::errors::{ActivationError, ActivationResult};

/// Eight lowercase hex characters passed verbatim to the decoder
#[derive(Clone, PartialEq, Eq)]
pub struct ActivationKey(String);

impl ActivationKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ActivationKey {
    type Err = ActivationError;

    /// Accepts a previously derived key, normalized to lowercase
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != license::KEY_BYTES * 2 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ActivationError::InvalidKey(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for ActivationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ActivationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ActivationKey").field(&self.0).finish()
    }
}

impl AsRef<str> for ActivationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Splits like a line scanner: on `\n`, dropping one trailing `\r`
fn lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let trimmed = data.strip_suffix(b"\n").unwrap_or(data);
    let empty = data.is_empty();
    trimmed
        .split(|&b| b == b'\n')
        .filter(move |_| !empty)
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn metadata_version(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line);
    let inner = text.strip_prefix('(')?;
    let inner = inner.strip_suffix(')').unwrap_or(inner);
    let (key, value) = inner.split_once('=')?;
    (key == "version").then(|| value.to_string())
}

/// Derives the activation key from a licensing response body
///
/// # Errors
///
/// Returns `ActivationError::UnsupportedVersion` when the metadata version is
/// not `1`, and `ActivationError::MalformedKeyRecord` when no 70-byte record
/// is found
pub fn extract_activation_key(data: &[u8]) -> ActivationResult<ActivationKey> {
    let mut version = String::new();
    let mut pending: Option<Vec<u8>> = None;

    for line in lines(data) {
        if line.first() == Some(&b'(') {
            if let Some(v) = metadata_version(line) {
                version = v;
            }
            continue;
        }

        if version != license::SUPPORTED_VERSION {
            return Err(ActivationError::UnsupportedVersion { found: version });
        }

        // A record may contain a newline byte; rejoin it with the next line
        let record = match pending.take() {
            Some(mut head) => {
                head.extend_from_slice(line);
                head
            }
            None => line.to_vec(),
        };

        if record.len() < license::RECORD_LENGTH {
            let mut head = record;
            head.push(b'\n');
            pending = Some(head);
            continue;
        }

        if record.len() != license::RECORD_LENGTH {
            debug!("Skipping {}-byte key record", record.len());
            continue;
        }

        let key: String = record[..license::KEY_BYTES]
            .iter()
            .rev()
            .map(|b| format!("{:02x}", b))
            .collect();
        return Ok(ActivationKey(key));
    }

    Err(ActivationError::MalformedKeyRecord)
}

/// Obtains a player token for this account
///
/// The portal answers `/player-auth-token` with a redirect whose final URL
/// carries the token in its `playerToken` query parameter.
pub async fn request_player_token(client: &PortalClient, player_id: &str) -> ActivationResult<String> {
    let mut url = resolve(client.base_url(), license::PLAYER_TOKEN_PATH)?;
    url.query_pairs_mut()
        .append_pair("ipRedirectOverride", "true")
        .append_pair("playerType", "software")
        .append_pair("bp_ua", "y")
        .append_pair("playerModel", "Desktop")
        .append_pair("playerId", player_id)
        .append_pair("playerManufacturer", "Audible")
        .append_pair("serial", "");

    let response = client.send(client.license_get(url)).await?;
    let token = response
        .url()
        .query_pairs()
        .find(|(key, _)| key == "playerToken")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
        .ok_or(ActivationError::PlayerTokenMissing)?;

    debug!("Received player token");
    Ok(token)
}

fn resolve(base: &Url, path: &str) -> ActivationResult<Url> {
    base.join(path).map_err(|e| ActivationError::InvalidUrl {
        url: format!("{}{}", base, path),
        error: e.to_string(),
    })
}

fn license_url(client: &PortalClient, token: &str, deregister: bool) -> ActivationResult<Url> {
    let mut url = resolve(client.license_url(), license::LICENSE_PATH)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("customer_token", token);
        if deregister {
            query.append_pair("action", "de-register");
        }
    }
    Ok(url)
}

async fn deregister(client: &PortalClient, token: &str) -> ActivationResult<()> {
    let url = license_url(client, token, true)?;
    client.send(client.license_get(url)).await?;
    Ok(())
}

/// Negotiates and extracts the activation key for an authenticated client
///
/// Any previous registration is released first, and the temporary one used
/// to obtain the key is released afterwards.
pub async fn request_activation_key(
    client: &PortalClient,
    player_id: &str,
) -> ActivationResult<ActivationKey> {
    debug!("Requesting activation key from {}", client.license_url());
    let token = request_player_token(client, player_id).await?;

    deregister(client, &token).await?;

    let url = license_url(client, &token, false)?;
    let response = client.send(client.license_get(url)).await?;
    let body = client.cancellable(response.bytes()).await??;

    deregister(client, &token).await?;

    let key = extract_activation_key(&body)?;
    info!("Derived activation key");
    Ok(key)
}
