//! Notification channels and dispatch.
//!
//! A channel plugin validates its required config fields at rule-load time,
//! then sends rendered notifications at dispatch time. The dispatcher owns
//! the retry policy; plugins only report success or failure of one attempt.

mod dispatcher;
mod email;
mod plugin;
mod registry;
mod telegram;
mod webhook;

pub use dispatcher::{Dispatcher, MAX_SEND_ATTEMPTS};
pub use email::EmailChannel;
pub use plugin::ChannelPlugin;
pub use registry::ChannelRegistry;
pub use telegram::TelegramChannel;
pub use webhook::WebhookChannel;
