use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::AppIdentity;
use crate::transport::{Transport, TransportError};

/// OAuth scope for channel traffic to the messaging service.
const BOT_FRAMEWORK_SCOPE: &str = "https://api.botframework.com/.default";

/// Stop serving a held token this close to its expiry.
const REFRESH_WINDOW_SECS: u64 = 300;
const DEFAULT_TTL_SECS: u64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token endpoint configuration: {0}")]
    Configuration(String),
    #[error("identity provider rejected the app identity: {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid token endpoint response: {0}")]
    InvalidResponse(String),
}

/// A bearer token plus the instant (epoch seconds) it stops being valid.
/// Lives in process memory only.
#[derive(Clone, Debug)]
pub struct BearerToken {
    value: String,
    expires_at: u64,
}

impl BearerToken {
    pub fn new(value: impl Into<String>, expires_at: u64) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

pub(crate) fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Produces bearer tokens for one app identity.
///
/// All identity-provider calls go through exactly the login transport the
/// credential was constructed with, so proxying and logging apply
/// uniformly. The last token is reused until the refresh window opens;
/// this internal reuse is unrelated to the health probe's token cache.
#[derive(Clone, Debug)]
pub struct AppCredentials {
    identity: AppIdentity,
    login: Transport,
    token_url: String,
    last_token: Arc<Mutex<Option<BearerToken>>>,
}

impl AppCredentials {
    pub fn new(identity: AppIdentity, login: Transport, authority: &Url) -> Self {
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            authority.as_str().trim_end_matches('/'),
            identity.authority_tenant()
        );
        Self {
            identity,
            login,
            token_url,
            last_token: Arc::new(Mutex::new(None)),
        }
    }

    /// Return a token valid for at least the refresh window, fetching a
    /// fresh one from the identity provider when the held one is stale.
    pub async fn token(&self, cancel: &CancellationToken) -> Result<BearerToken, AuthError> {
        if let Some(token) = self.held_token(now_epoch_seconds()) {
            return Ok(token);
        }

        let token = self.fetch_token(cancel).await?;
        *self.last_token.lock().expect("token slot poisoned") = Some(token.clone());
        Ok(token)
    }

    fn held_token(&self, now: u64) -> Option<BearerToken> {
        self.last_token
            .lock()
            .expect("token slot poisoned")
            .as_ref()
            .filter(|token| token.expires_at().saturating_sub(now) > REFRESH_WINDOW_SECS)
            .cloned()
    }

    async fn fetch_token(&self, cancel: &CancellationToken) -> Result<BearerToken, AuthError> {
        let url = Url::parse(&self.token_url)
            .map_err(|err| AuthError::Configuration(format!("{}: {err}", self.token_url)))?;
        let request = self
            .login
            .request(Method::POST, url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.identity.app_id()),
                ("client_secret", self.identity.app_secret()),
                ("scope", BOT_FRAMEWORK_SCOPE),
            ])
            .build()
            .map_err(TransportError::Request)?;

        let response = self.login.execute(request, cancel).await?;
        if !response.status().is_success() {
            return Err(AuthError::Rejected {
                status: response.status(),
                body: response.text().into_owned(),
            });
        }

        let payload: TokenEndpointResponse = response
            .json()
            .map_err(|err| AuthError::InvalidResponse(err.to_string()))?;
        let now = now_epoch_seconds();
        let expires_at = decode_jwt_expiry(&payload.access_token).unwrap_or_else(|| {
            now.saturating_add(payload.expires_in.unwrap_or(DEFAULT_TTL_SECS))
        });

        Ok(BearerToken::new(payload.access_token, expires_at))
    }

    #[cfg(test)]
    pub(crate) fn seeded(identity: AppIdentity, login: Transport, token: BearerToken) -> Self {
        let credentials = Self::new(
            identity,
            login,
            &Url::parse("https://login.microsoftonline.com").expect("authority"),
        );
        *credentials.last_token.lock().expect("token slot poisoned") = Some(token);
        credentials
    }
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Expiry instant from the token's `exp` claim, or `None` when the token
/// is not a decodable JWT.
fn decode_jwt_expiry(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: JwtClaims = serde_json::from_slice(&decoded).ok()?;
    claims.exp
}

#[derive(Deserialize)]
struct JwtClaims {
    #[serde(default)]
    exp: Option<u64>,
}
