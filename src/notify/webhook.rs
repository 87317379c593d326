//! Generic HTTP webhook channel.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::DeliveryError;

use super::ChannelPlugin;

/// Generic webhook notification channel.
///
/// Config fields: `url`, optional `payload`. When `payload` is present it
/// is posted as the JSON body exactly as rendered (authors embed the alert
/// text via placeholders); otherwise a default body is posted:
///
/// ```json
/// {"text": "<rendered text>", "sent_at": "<rfc3339>"}
/// ```
#[derive(Debug)]
pub struct WebhookChannel {
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(client: reqwest::Client) -> Self {
        WebhookChannel { client }
    }
}

#[async_trait]
impl ChannelPlugin for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["url"]
    }

    fn init(&self) {
        tracing::debug!("Webhook channel ready");
    }

    async fn send(&self, config: &Value, text: &str) -> Result<(), DeliveryError> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| DeliveryError::InvalidConfig("'url' must be a string".into()))?;

        let body = match config.get("payload") {
            Some(payload) => payload.clone(),
            None => json!({
                "text": text,
                "sent_at": Utc::now().to_rfc3339(),
            }),
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DeliveryError::SendFailed(format!(
                "webhook returned HTTP {}",
                response.status()
            )))
        }
    }
}
