use crate::fetcher::{no_short_circuit, FetchExecutor, FetchRequest};
use crate::types::Result;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;
use url::Url;

/// Account and application credentials for the OAuth2 password grant.
#[derive(Debug, Clone)]
pub struct RedditCredentials {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
}

/// A bearer token with its absolute expiry. Replaced wholesale on refresh,
/// never mutated in place.
struct Credential {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Caches the Reddit bearer credential, exchanging credentials for a new
/// token when the cached one is missing, expired, or force-invalidated.
pub struct AuthCache {
    executor: Arc<FetchExecutor>,
    credentials: RedditCredentials,
    token_url: Url,
    cached: Mutex<Option<Credential>>,
}

impl AuthCache {
    pub fn new(
        executor: Arc<FetchExecutor>,
        credentials: RedditCredentials,
        token_url: Url,
    ) -> Self {
        Self {
            executor,
            credentials,
            token_url,
            cached: Mutex::new(None),
        }
    }

    /// Return a valid bearer token, refreshing when needed. `force`
    /// discards the cached credential first (used after a 401 downstream).
    pub async fn token(&self, force: bool) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if !force {
            if let Some(credential) = cached.as_ref() {
                if Instant::now() < credential.expires_at {
                    return Ok(credential.token.clone());
                }
            }
        }

        let request = FetchRequest::post(self.token_url.clone())
            .query("grant_type", Some("password"))
            .query("username", Some(self.credentials.username.clone()))
            .query("password", Some(self.credentials.password.clone()))
            .basic_auth(
                self.credentials.client_id.clone(),
                self.credentials.client_secret.clone(),
            );

        let response: TokenResponse = self
            .executor
            .fetch_json(&request, &no_short_circuit)
            .await?
            .into_payload()?;

        info!("authenticated to reddit");

        let token = response.access_token.clone();
        *cached = Some(Credential {
            token: response.access_token,
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        });

        Ok(token)
    }
}
