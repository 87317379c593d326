//! SMTP email channel via lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::Value;

use crate::error::DeliveryError;

use super::ChannelPlugin;

const DEFAULT_SMTP_PORT: u16 = 25;

/// Email notification channel.
///
/// Config fields: `host` (with optional `port`, `username`, `password`),
/// `from_email`, `to_email` (comma-separated for multiple recipients),
/// `subject`, and optional `type: "HTML"` to send the rendered text as an
/// HTML body. `subject` may carry placeholders like any other config leaf.
#[derive(Debug, Default)]
pub struct EmailChannel;

impl EmailChannel {
    pub fn new() -> Self {
        EmailChannel
    }
}

fn required_str<'a>(config: &'a Value, field: &str) -> Result<&'a str, DeliveryError> {
    config
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| DeliveryError::InvalidConfig(format!("'{}' must be a string", field)))
}

fn parse_mailbox(raw: &str) -> Result<Mailbox, DeliveryError> {
    raw.trim()
        .parse()
        .map_err(|e| DeliveryError::InvalidConfig(format!("invalid address '{}': {}", raw, e)))
}

#[async_trait]
impl ChannelPlugin for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["host", "from_email", "to_email", "subject"]
    }

    fn init(&self) {
        tracing::debug!("Email channel ready");
    }

    async fn send(&self, config: &Value, text: &str) -> Result<(), DeliveryError> {
        let host = required_str(config, "host")?;
        let subject = required_str(config, "subject")?;
        let from = parse_mailbox(required_str(config, "from_email")?)?;

        let mut builder = Message::builder().from(from).subject(subject);
        for recipient in required_str(config, "to_email")?.split(',') {
            builder = builder.to(parse_mailbox(recipient)?);
        }

        let html = config
            .get("type")
            .and_then(Value::as_str)
            .map(|t| t.eq_ignore_ascii_case("html"))
            .unwrap_or(false);
        let content_type = if html {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };
        let message = builder
            .header(content_type)
            .body(text.to_string())
            .map_err(|e| DeliveryError::InvalidConfig(format!("message build failed: {}", e)))?;

        let port = config
            .get("port")
            .and_then(Value::as_u64)
            .map(|p| p as u16)
            .unwrap_or(DEFAULT_SMTP_PORT);

        // Plain SMTP relay; STARTTLS upgrades are left to the server policy
        // configured in `host`.
        let mut transport =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(port);
        if let (Some(username), Some(password)) = (
            config.get("username").and_then(Value::as_str),
            config.get("password").and_then(Value::as_str),
        ) {
            transport =
                transport.credentials(Credentials::new(username.to_string(), password.to_string()));
        }

        transport
            .build()
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn declares_required_fields() {
        let channel = EmailChannel::new();
        assert_eq!(channel.name(), "email");
        assert_eq!(
            channel.required_fields(),
            &["host", "from_email", "to_email", "subject"]
        );
    }

    #[tokio::test]
    async fn bad_from_address_is_invalid_config() {
        let channel = EmailChannel::new();
        let config = json!({
            "host": "localhost",
            "from_email": "not an address",
            "to_email": "ops@example.com",
            "subject": "s"
        });
        let err = channel.send(&config, "body").await.unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn non_string_subject_is_invalid_config() {
        let channel = EmailChannel::new();
        let config = json!({
            "host": "localhost",
            "from_email": "a@example.com",
            "to_email": "b@example.com",
            "subject": 42
        });
        let err = channel.send(&config, "body").await.unwrap_err();
        assert!(err.to_string().contains("subject"));
    }
}
