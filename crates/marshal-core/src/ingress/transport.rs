//! Chat transport: the only component that talks to the network.
//!
//! Kept behind a narrow trait so the ingress loop can run against a fake
//! transport in tests.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{CoreError, Result};

/// A chat update from the long-poll API.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub edited_message: Option<Message>,
}

impl Update {
    /// The carried message: edits are treated like fresh messages.
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref().or(self.edited_message.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

impl Message {
    /// Display label for the sender: `@username` when known, the numeric
    /// id otherwise.
    pub fn actor(&self) -> String {
        match &self.from {
            Some(user) => match &user.username {
                Some(name) => format!("@{name}"),
                None => user.id.to_string(),
            },
            None => "unknown".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// The long-poll fetch/send pair.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Fetch a batch of updates at or after `offset`, long-polling up to
    /// `timeout_seconds` server-side.
    async fn fetch_updates(&self, offset: i64, timeout_seconds: u64) -> Result<Vec<Update>>;

    /// Send a reply. Best-effort from the caller's perspective.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// Telegram Bot API transport.
pub struct TelegramTransport {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramTransport {
    pub fn new(bot_token: &str) -> Self {
        Self::with_api_base(format!("https://api.telegram.org/bot{bot_token}"))
    }

    /// Custom API base, for proxies and tests.
    pub fn with_api_base(api_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
        }
    }

    async fn call(&self, method: &str, payload: &Value, timeout_seconds: u64) -> Result<Value> {
        let url = format!("{}/{method}", self.api_base);
        let response = self
            .client
            .post(&url)
            .json(payload)
            // Headroom over the server-side long-poll window.
            .timeout(std::time::Duration::from_secs(timeout_seconds + 5))
            .send()
            .await
            .map_err(|e| CoreError::Transport(format!("chat api {method}: {e}")))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| CoreError::Transport(format!("chat api {method}: bad json: {e}")))?;

        if !body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Err(CoreError::Transport(format!(
                "chat api {method} not ok: {}",
                body.get("description").and_then(Value::as_str).unwrap_or("unknown")
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn fetch_updates(&self, offset: i64, timeout_seconds: u64) -> Result<Vec<Update>> {
        let payload = serde_json::json!({
            "timeout": timeout_seconds,
            "offset": offset,
            "allowed_updates": ["message", "edited_message"],
        });
        let body = self.call("getUpdates", &payload, timeout_seconds).await?;
        let updates = body
            .get("result")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(updates)
            .map_err(|e| CoreError::Transport(format!("chat api getUpdates: bad update: {e}")))
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let clipped: String = text.chars().take(4000).collect();
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "text": clipped,
            "disable_web_page_preview": true,
        });
        self.call("sendMessage", &payload, 10).await?;
        Ok(())
    }
}
