//! Telegram Bot API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::debug;

use nudge_scheduler::{NotificationSender, OwnerId, SendError};

/// Public Bot API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Extra time allowed on top of a long poll before the request times out.
const LONG_POLL_SLACK: Duration = Duration::from_secs(10);

/// Errors from the Bot API.
#[derive(Debug, Error)]
pub enum TelegramError {
    /// Connection failure, timeout, or unreadable body.
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("API error ({status}): {description}")]
    Api { status: u16, description: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TelegramError {
    /// Whether the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            TelegramError::Http(_) | TelegramError::RateLimited { .. } => true,
            TelegramError::Api { status, .. } => *status >= 500,
            TelegramError::InvalidResponse(_) => false,
        }
    }
}

impl From<TelegramError> for SendError {
    fn from(e: TelegramError) -> Self {
        match e {
            TelegramError::RateLimited { retry_after_secs } => SendError::RateLimited {
                retry_after: retry_after_secs.map(Duration::from_secs),
            },
            e if e.is_transient() => SendError::Transient(e.to_string()),
            e => SendError::Rejected(e.to_string()),
        }
    }
}

/// One incoming update.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// Bot API response envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Serialize)]
struct GetUpdatesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: [&'static str; 1],
}

/// Client for one bot.
pub struct TelegramClient {
    http: Client,
    base_url: String,
    token: String,
}

impl TelegramClient {
    /// Client for a Bot API server at `base_url`.
    pub fn with_base_url(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// Send a plain text message.
    #[tracing::instrument(skip(self, text))]
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        let _: Message = self
            .call(
                "sendMessage",
                &SendMessageRequest { chat_id, text },
                None,
            )
            .await?;
        debug!("message sent");
        Ok(())
    }

    /// Long-poll for updates after `offset`, waiting up to `timeout_secs`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        let request = GetUpdatesRequest {
            offset,
            timeout: timeout_secs,
            allowed_updates: ["message"],
        };
        let wait = Duration::from_secs(timeout_secs) + LONG_POLL_SLACK;
        self.call("getUpdates", &request, Some(wait)).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &impl Serialize,
        timeout: Option<Duration>,
    ) -> Result<T, TelegramError> {
        let mut request = self.http.post(self.method_url(method)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        // Strip the URL so the bot token never ends up in logs
        let response = request
            .send()
            .await
            .map_err(|e| TelegramError::Http(e.without_url()))?;
        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, TelegramError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TelegramError::Http(e.without_url()))?;

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = serde_json::from_str::<ApiResponse<serde_json::Value>>(&text)
                .ok()
                .and_then(|r| r.parameters)
                .and_then(|p| p.retry_after);
            return Err(TelegramError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let description = serde_json::from_str::<ApiResponse<serde_json::Value>>(&text)
                .ok()
                .and_then(|r| r.description)
                .unwrap_or(text);
            return Err(TelegramError::Api {
                status: status.as_u16(),
                description,
            });
        }

        let parsed: ApiResponse<T> = serde_json::from_str(&text)
            .map_err(|e| TelegramError::InvalidResponse(e.to_string()))?;

        if !parsed.ok {
            return Err(TelegramError::Api {
                status: parsed.error_code.unwrap_or(status.as_u16()),
                description: parsed.description.unwrap_or_default(),
            });
        }

        parsed
            .result
            .ok_or_else(|| TelegramError::InvalidResponse("missing result".to_string()))
    }
}

#[async_trait]
impl NotificationSender for TelegramClient {
    async fn send(&self, recipient: OwnerId, text: &str) -> Result<(), SendError> {
        // Private chat ids equal user ids
        Ok(self.send_message(recipient, text).await?)
    }
}
