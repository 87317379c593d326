//! Channel plugin trait definition.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DeliveryError;

/// Abstract notification transport.
///
/// Implementations must be `Send + Sync` so one instance can serve all
/// concurrently scheduled rules. A plugin performs exactly one send attempt
/// per call; retries are the dispatcher's job.
///
/// # Example
///
/// ```ignore
/// use eswatch::notify::ChannelPlugin;
///
/// struct Pager;
///
/// #[async_trait]
/// impl ChannelPlugin for Pager {
///     fn name(&self) -> &'static str { "pager" }
///     fn required_fields(&self) -> &'static [&'static str] { &["service_key"] }
///     async fn send(&self, config: &Value, text: &str) -> Result<(), DeliveryError> {
///         // transport-specific delivery
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Registry key; a notification spec selects a plugin by this name.
    fn name(&self) -> &'static str;

    /// Config fields that must be present (and truthy) in every
    /// notification spec using this channel. Checked once at rule-load
    /// time, never re-checked at dispatch time.
    fn required_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// One-time hook called when the plugin is registered.
    fn init(&self) {}

    /// Send one rendered notification.
    ///
    /// `config` is the spec's config tree with all placeholders already
    /// rendered; `text` is the rendered notification text.
    async fn send(&self, config: &Value, text: &str) -> Result<(), DeliveryError>;
}

impl std::fmt::Debug for dyn ChannelPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPlugin")
            .field("name", &self.name())
            .finish()
    }
}
