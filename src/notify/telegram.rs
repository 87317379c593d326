//! Telegram Bot API channel.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::DeliveryError;

use super::ChannelPlugin;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram notification channel.
///
/// Config fields: `bot_token`, `room_id` (chat id), optional `api_base` to
/// point at a proxy. Messages are sent with markdown parse mode and link
/// previews disabled.
#[derive(Debug)]
pub struct TelegramChannel {
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(client: reqwest::Client) -> Self {
        TelegramChannel { client }
    }
}

#[async_trait]
impl ChannelPlugin for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["bot_token", "room_id"]
    }

    fn init(&self) {
        tracing::debug!("Telegram channel ready");
    }

    async fn send(&self, config: &Value, text: &str) -> Result<(), DeliveryError> {
        let token = config
            .get("bot_token")
            .and_then(Value::as_str)
            .ok_or_else(|| DeliveryError::InvalidConfig("'bot_token' must be a string".into()))?;
        let room_id = config
            .get("room_id")
            .cloned()
            .ok_or_else(|| DeliveryError::InvalidConfig("'room_id' is missing".into()))?;
        let api_base = config
            .get("api_base")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_API_BASE);

        let url = format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token);
        let body = json!({
            "chat_id": room_id,
            "text": text,
            "parse_mode": "markdown",
            "disable_web_page_preview": true,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DeliveryError::SendFailed(format!(
                "telegram API returned HTTP {}",
                response.status()
            )))
        }
    }
}
