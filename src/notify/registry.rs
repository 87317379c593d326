//! Channel registry and load-time notification-spec validation.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::error::LoadError;

use super::{ChannelPlugin, EmailChannel, TelegramChannel, WebhookChannel};

/// Registry of channel plugins, keyed by plugin name.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    plugins: HashMap<String, Arc<dyn ChannelPlugin>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry {
            plugins: HashMap::new(),
        }
    }

    /// Registry with the built-in channels (email, telegram, webhook).
    pub fn builtin(http_client: reqwest::Client) -> Self {
        let mut registry = ChannelRegistry::new();
        let builtins: Vec<Arc<dyn ChannelPlugin>> = vec![
            Arc::new(EmailChannel::new()),
            Arc::new(TelegramChannel::new(http_client.clone())),
            Arc::new(WebhookChannel::new(http_client)),
        ];
        for plugin in builtins {
            // Built-in names are distinct; register cannot fail here.
            let _ = registry.register(plugin);
        }
        registry
    }

    /// Register a plugin and run its init hook.
    pub fn register(&mut self, plugin: Arc<dyn ChannelPlugin>) -> Result<(), LoadError> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(LoadError::InvalidConfig(format!(
                "channel '{}' already registered",
                name
            )));
        }
        info!(channel = %name, "Registering channel plugin");
        plugin.init();
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelPlugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Validate one notification spec's channel type and required fields.
    ///
    /// Called at rule-load time; a failing spec is dropped from the rule
    /// (the rule itself survives while at least one spec remains).
    pub fn validate_spec(
        &self,
        rule_name: &str,
        channel_type: &str,
        config: &Value,
    ) -> Result<(), LoadError> {
        let plugin = self.get(channel_type).ok_or_else(|| LoadError::InvalidRule {
            rule: rule_name.to_string(),
            message: format!("unknown channel type '{}'", channel_type),
        })?;

        for field in plugin.required_fields() {
            let present = config.get(*field).map(field_is_set).unwrap_or(false);
            if !present {
                return Err(LoadError::InvalidRule {
                    rule: rule_name.to_string(),
                    message: format!(
                        "channel '{}' config is missing required field '{}'",
                        channel_type, field
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A required field counts as set only when its value is truthy: null,
/// `false`, empty string and zero all fail validation.
fn field_is_set(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use async_trait::async_trait;
    use serde_json::json;

    struct FakeChannel;

    #[async_trait]
    impl ChannelPlugin for FakeChannel {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn required_fields(&self) -> &'static [&'static str] {
            &["target", "token"]
        }
        async fn send(&self, _config: &Value, _text: &str) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn registry_with_fake() -> ChannelRegistry {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(FakeChannel)).unwrap();
        registry
    }

    #[test]
    fn builtin_registry_has_three_channels() {
        let registry = ChannelRegistry::builtin(reqwest::Client::new());
        assert_eq!(registry.len(), 3);
        assert!(registry.get("email").is_some());
        assert!(registry.get("telegram").is_some());
        assert!(registry.get("webhook").is_some());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = registry_with_fake();
        let err = registry.register(Arc::new(FakeChannel)).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn validate_spec_accepts_complete_config() {
        let registry = registry_with_fake();
        let config = json!({"target": "#ops", "token": "abc"});
        assert!(registry.validate_spec("r", "fake", &config).is_ok());
    }

    #[test]
    fn validate_spec_rejects_unknown_channel() {
        let registry = registry_with_fake();
        let err = registry
            .validate_spec("r", "missing", &json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("unknown channel type"));
    }

    #[test]
    fn validate_spec_rejects_missing_field() {
        let registry = registry_with_fake();
        let err = registry
            .validate_spec("r", "fake", &json!({"target": "#ops"}))
            .unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn validate_spec_rejects_falsy_field_values() {
        let registry = registry_with_fake();
        for bad in [json!(null), json!(""), json!(false), json!(0)] {
            let config = json!({"target": bad, "token": "abc"});
            assert!(
                registry.validate_spec("r", "fake", &config).is_err(),
                "value {:?} should fail validation",
                config["target"]
            );
        }
    }
}
