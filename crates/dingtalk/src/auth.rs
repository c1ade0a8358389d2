//! App access token cache, keyed by client id.

use std::{collections::HashMap, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tokio::{sync::Mutex, time::Instant},
    tracing::debug,
};

use crate::{
    config::DingTalkAccountConfig,
    error::{Error, Result},
    retry::{RetryPolicy, with_retry},
};

/// Tokens are refreshed once their remaining lifetime drops below this.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

const DEFAULT_EXPIRES_IN_SECS: u64 = 7_200;

/// Everything needed to mint a token for one app.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub api_base: String,
}

impl From<&DingTalkAccountConfig> for Credentials {
    fn from(config: &DingTalkAccountConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            api_base: config.api_base.clone(),
        }
    }
}

#[derive(Clone)]
struct CachedAccessToken {
    token: Secret<String>,
    expires_at: Instant,
}

impl CachedAccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now() + REFRESH_MARGIN
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    expire_in: Option<u64>,
}

/// Shared token cache. One instance serves every account in the process;
/// entries are partitioned by client id so accounts never share a token.
///
/// Concurrent callers that find a stale entry may each refresh; the last
/// response to land wins.
pub struct TokenCache {
    http: reqwest::Client,
    policy: RetryPolicy,
    tokens: Mutex<HashMap<String, CachedAccessToken>>,
}

impl TokenCache {
    pub fn new(http: reqwest::Client, policy: RetryPolicy) -> Self {
        Self {
            http,
            policy,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Return a token with more than [`REFRESH_MARGIN`] of lifetime left,
    /// refreshing it from the OAuth endpoint if needed.
    pub async fn get_token(&self, credentials: &Credentials) -> Result<Secret<String>> {
        {
            let tokens = self.tokens.lock().await;
            if let Some(cached) = tokens.get(&credentials.client_id)
                && cached.is_fresh()
            {
                return Ok(cached.token.clone());
            }
        }

        let fetched = with_retry(&self.policy, "access token", || {
            self.fetch(credentials)
        })
        .await?;
        let token = fetched.token.clone();

        self.tokens
            .lock()
            .await
            .insert(credentials.client_id.clone(), fetched);
        Ok(token)
    }

    /// Drop the cached token for `client_id`, forcing the next call to refresh.
    pub async fn invalidate(&self, client_id: &str) {
        self.tokens.lock().await.remove(client_id);
    }

    async fn fetch(&self, credentials: &Credentials) -> Result<CachedAccessToken> {
        let url = format!("{}/v1.0/oauth2/accessToken", credentials.api_base);
        let body = serde_json::json!({
            "appKey": credentials.client_id,
            "appSecret": credentials.client_secret.expose_secret(),
        });

        let resp = self.http.post(url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::api("access token", status.as_u16(), text));
        }

        let body: TokenResponse = resp.json().await?;
        if body.access_token.is_empty() {
            return Err(Error::message("dingtalk access token response was empty"));
        }
        let ttl = body.expire_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        debug!(
            client_id = %credentials.client_id,
            expires_in = ttl,
            "dingtalk access token refreshed"
        );
        Ok(CachedAccessToken {
            token: Secret::new(body.access_token),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        })
    }

    #[cfg(test)]
    pub(crate) async fn seed(&self, client_id: &str, token: &str, ttl: Duration) {
        self.tokens.lock().await.insert(client_id.to_string(), CachedAccessToken {
            token: Secret::new(token.to_string()),
            expires_at: Instant::now() + ttl,
        });
    }
}
