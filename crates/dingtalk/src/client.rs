//! Authenticated HTTP access to the DingTalk open API.

use std::sync::Arc;

use {
    reqwest::Method,
    secrecy::ExposeSecret,
    serde::{Serialize, de::DeserializeOwned},
    serde_json::Value,
    tracing::debug,
};

use crate::{
    auth::{Credentials, TokenCache},
    config::DingTalkAccountConfig,
    error::{Error, Result},
    retry::{RetryPolicy, with_retry},
};

const TOKEN_HEADER: &str = "x-acs-dingtalk-access-token";

/// Per-account API client. Cheap to clone.
#[derive(Clone)]
pub struct DingTalkClient {
    http: reqwest::Client,
    tokens: Arc<TokenCache>,
    credentials: Credentials,
    robot_code: String,
    oapi_base: String,
    policy: RetryPolicy,
}

impl DingTalkClient {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<TokenCache>,
        config: &DingTalkAccountConfig,
    ) -> Self {
        Self {
            http,
            tokens,
            credentials: Credentials::from(config),
            robot_code: config.robot_code().to_string(),
            oapi_base: config.oapi_base.clone(),
            policy: config.retry_policy(),
        }
    }

    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    #[must_use]
    pub fn robot_code(&self) -> &str {
        &self.robot_code
    }

    #[must_use]
    pub fn api_base(&self) -> &str {
        &self.credentials.api_base
    }

    #[must_use]
    pub fn oapi_base(&self) -> &str {
        &self.oapi_base
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current access token for this account.
    pub async fn access_token(&self) -> Result<String> {
        let token = self.tokens.get_token(&self.credentials).await?;
        Ok(token.expose_secret().clone())
    }

    /// POST `body` to `{api_base}{path}` with the token header, retried.
    pub async fn post_json<B, T>(&self, operation: &'static str, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(Method::POST, operation, path, body).await
    }

    /// PUT `body` to `{api_base}{path}` with the token header, retried.
    pub async fn put_json<B, T>(&self, operation: &'static str, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(Method::PUT, operation, path, body).await
    }

    async fn send_json<B, T>(
        &self,
        method: Method,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", self.credentials.api_base);
        let value = with_retry(&self.policy, operation, || {
            self.send_once(method.clone(), operation, &url, body)
        })
        .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn send_once<B>(
        &self,
        method: Method,
        operation: &'static str,
        url: &str,
        body: &B,
    ) -> Result<Value>
    where
        B: Serialize + ?Sized,
    {
        let token = self.access_token().await?;
        let resp = self
            .http
            .request(method, url)
            .header(TOKEN_HEADER, token)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            if status.as_u16() == 401 {
                self.tokens.invalidate(&self.credentials.client_id).await;
            }
            return Err(Error::api(operation, status.as_u16(), text));
        }
        debug!(operation, status = status.as_u16(), "dingtalk api call ok");
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Reply through a conversation's session webhook.
    ///
    /// The webhook answers HTTP 200 even on failure; a non-zero `errcode` in
    /// the body is treated as an API error.
    pub async fn post_session_webhook(&self, webhook: &str, body: &Value) -> Result<()> {
        with_retry(&self.policy, "session webhook", || async move {
            let token = self.access_token().await?;
            let resp = self
                .http
                .post(webhook)
                .header(TOKEN_HEADER, token)
                .json(body)
                .send()
                .await?;
            let status = resp.status();
            let text = resp.text().await?;
            if !status.is_success() {
                return Err(Error::api("session webhook", status.as_u16(), text));
            }
            check_errcode("session webhook", &text)
        })
        .await
    }
}

/// Legacy `oapi` endpoints report failures as `{"errcode": n, "errmsg": ".."}`.
pub(crate) fn check_errcode(operation: &'static str, body: &str) -> Result<()> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return Ok(());
    };
    match value.get("errcode").and_then(Value::as_i64) {
        Some(0) | None => Ok(()),
        Some(_) => Err(Error::api(operation, 200, body.to_string())),
    }
}
