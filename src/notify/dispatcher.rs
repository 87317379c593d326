//! Notification rendering and delivery with bounded retry.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::expr::ExprContext;
use crate::rule::NotificationSpec;
use crate::template;

use super::ChannelRegistry;

/// Total attempts per notification: one send plus two immediate retries.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Renders and sends notifications through registered channel plugins.
///
/// A failed send never blocks or aborts sibling notifications, and never
/// escalates past a log line; the state transition that triggered the
/// dispatch stands regardless of delivery outcome.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Dispatcher { registry }
    }

    /// Render and send every spec in the list.
    ///
    /// Specs were validated against their plugin's required fields at
    /// rule-load time; no re-validation happens here. A spec whose
    /// templates fail to render is logged and skipped.
    pub async fn dispatch(
        &self,
        rule_name: &str,
        specs: &[NotificationSpec],
        ctx: ExprContext<'_>,
    ) {
        for spec in specs {
            let text = match template::render(&spec.text, ctx) {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        rule_name = %rule_name,
                        channel = %spec.channel_type,
                        error = %e,
                        "Failed to render notification text, skipping"
                    );
                    continue;
                }
            };
            let config = match template::render_config(&spec.config, ctx) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        rule_name = %rule_name,
                        channel = %spec.channel_type,
                        error = %e,
                        "Failed to render notification config, skipping"
                    );
                    continue;
                }
            };

            let Some(plugin) = self.registry.get(&spec.channel_type) else {
                // Validation at load time should make this unreachable.
                error!(
                    rule_name = %rule_name,
                    channel = %spec.channel_type,
                    "Channel plugin not registered, dropping notification"
                );
                continue;
            };

            let mut delivered = false;
            for attempt in 1..=MAX_SEND_ATTEMPTS {
                match plugin.send(&config, &text).await {
                    Ok(()) => {
                        info!(
                            rule_name = %rule_name,
                            channel = %spec.channel_type,
                            attempt = attempt,
                            "Notification sent"
                        );
                        metrics::counter!(
                            "eswatch_notifications_sent_total",
                            "channel" => spec.channel_type.clone()
                        )
                        .increment(1);
                        delivered = true;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            rule_name = %rule_name,
                            channel = %spec.channel_type,
                            attempt = attempt,
                            error = %e,
                            "Notification send failed"
                        );
                    }
                }
            }

            if !delivered {
                error!(
                    rule_name = %rule_name,
                    channel = %spec.channel_type,
                    attempts = MAX_SEND_ATTEMPTS,
                    "Notification permanently failed, moving on"
                );
                metrics::counter!(
                    "eswatch_notifications_failed_total",
                    "channel" => spec.channel_type.clone()
                )
                .increment(1);
            }
        }
    }
}
