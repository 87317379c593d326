//! Rule model and rule-bundle loading.
//!
//! Each rule lives in its own directory under the rules root:
//!
//! ```text
//! rules/
//!   cpu_high/
//!     config.json       rule settings, params and notification specs
//!     query.json        search body template with ${...} placeholders
//!     expression.txt    match-expression source
//! ```
//!
//! The directory name is the rule's stable identifier and feeds alert
//! identity hashing, so renaming a directory orphans its persisted state.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::LoadError;
use crate::expr::{MatchExpression, Script};
use crate::machine::RuleKind;
use crate::notify::ChannelRegistry;
use crate::schedule::{RuleSchedule, ScheduleSpec};

pub const CONFIG_FILE: &str = "config.json";
pub const QUERY_FILE: &str = "query.json";
pub const EXPRESSION_FILE: &str = "expression.txt";

/// One notification to render and send on an alert transition.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSpec {
    /// Channel registry key ("email", "telegram", "webhook").
    #[serde(rename = "type")]
    pub channel_type: String,
    /// Text template with `${...}` placeholders.
    pub text: String,
    /// Channel config; string leaves may carry placeholders too.
    #[serde(default = "empty_object")]
    pub config: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// `config.json` as written by the rule author.
#[derive(Debug, Deserialize)]
struct RuleConfig {
    name: String,
    #[serde(rename = "type", default)]
    kind: RuleKind,
    #[serde(default)]
    poll_count: u32,
    index: String,
    run_time: ScheduleSpec,
    #[serde(default = "empty_object")]
    params: Value,
    #[serde(default)]
    alert_start: Vec<NotificationSpec>,
    #[serde(default)]
    alert_end: Vec<NotificationSpec>,
}

/// A fully loaded and validated rule, ready to schedule.
pub struct Rule {
    pub name: String,
    /// Stable identifier: the bundle directory name.
    pub dir_name: String,
    pub kind: RuleKind,
    pub poll_count: u32,
    pub index: String,
    pub params: Value,
    pub query_template: String,
    /// The bundle loader always compiles a [`Script`], but the engine only
    /// needs [`MatchExpression`], so a different evaluator can be wired in.
    pub expression: Box<dyn MatchExpression>,
    pub alert_start: Vec<NotificationSpec>,
    pub alert_end: Vec<NotificationSpec>,
    pub schedule: RuleSchedule,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("dir_name", &self.dir_name)
            .field("kind", &self.kind)
            .field("poll_count", &self.poll_count)
            .field("index", &self.index)
            .field("schedule", &self.schedule)
            .finish()
    }
}

/// Load every rule bundle under `rules_dir`.
///
/// A bundle that fails to load is skipped with a logged reason; only an
/// unreadable rules directory itself is an error.
pub fn load_rules(rules_dir: &Path, registry: &ChannelRegistry) -> Result<Vec<Rule>, LoadError> {
    let entries = fs::read_dir(rules_dir).map_err(|e| LoadError::Io {
        path: rules_dir.display().to_string(),
        message: e.to_string(),
    })?;

    let mut rules = Vec::new();
    let mut names: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.path())
        .collect();
    names.sort();

    for dir in names {
        match load_rule(&dir, registry) {
            Ok(rule) => {
                info!(
                    rule_name = %rule.name,
                    dir = %rule.dir_name,
                    schedules = rule.schedule.len(),
                    "Loaded rule"
                );
                rules.push(rule);
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping rule");
                metrics::counter!("eswatch_rules_skipped_total").increment(1);
            }
        }
    }
    Ok(rules)
}

/// Load a single rule bundle directory.
pub fn load_rule(dir: &Path, registry: &ChannelRegistry) -> Result<Rule, LoadError> {
    let dir_name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| LoadError::InvalidConfig(format!(
            "rule directory {} has a non-UTF-8 name",
            dir.display()
        )))?
        .to_string();

    let config_raw = read_bundle_file(dir, &dir_name, CONFIG_FILE)?;
    let query_template = read_bundle_file(dir, &dir_name, QUERY_FILE)?;
    let expression_source = read_bundle_file(dir, &dir_name, EXPRESSION_FILE)?;

    let config: RuleConfig =
        serde_json::from_str(&config_raw).map_err(|e| LoadError::InvalidRule {
            rule: dir_name.clone(),
            message: format!("bad {}: {}", CONFIG_FILE, e),
        })?;

    let schedule = RuleSchedule::parse(&config.name, &config.run_time)?;

    let expression = Script::compile(&expression_source).map_err(|e| LoadError::InvalidRule {
        rule: dir_name.clone(),
        message: format!("bad {}: {}", EXPRESSION_FILE, e),
    })?;

    let alert_start = validate_specs(&config.name, registry, config.alert_start);
    let alert_end = validate_specs(&config.name, registry, config.alert_end);
    if alert_start.is_empty() && alert_end.is_empty() {
        // Nothing this rule could ever send, so running it is pointless.
        return Err(LoadError::InvalidRule {
            rule: dir_name,
            message: "no valid notifications in alert_start or alert_end".to_string(),
        });
    }

    Ok(Rule {
        name: config.name,
        dir_name,
        kind: config.kind,
        poll_count: config.poll_count,
        index: config.index,
        params: config.params,
        query_template,
        expression: Box::new(expression),
        alert_start,
        alert_end,
        schedule,
    })
}

fn read_bundle_file(dir: &Path, rule: &str, file: &str) -> Result<String, LoadError> {
    let path = dir.join(file);
    if !path.is_file() {
        return Err(LoadError::MissingFile {
            rule: rule.to_string(),
            file: file.to_string(),
        });
    }
    fs::read_to_string(&path).map_err(|e| LoadError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Drop specs whose channel is unknown or whose config is incomplete.
fn validate_specs(
    rule_name: &str,
    registry: &ChannelRegistry,
    specs: Vec<NotificationSpec>,
) -> Vec<NotificationSpec> {
    specs
        .into_iter()
        .filter(|spec| {
            match registry.validate_spec(rule_name, &spec.channel_type, &spec.config) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        rule_name = %rule_name,
                        channel = %spec.channel_type,
                        error = %e,
                        "Dropping notification spec"
                    );
                    false
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn write_bundle(root: &Path, dir_name: &str, config: &Value, query: &str, expression: &str) {
        let dir = root.join(dir_name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CONFIG_FILE), config.to_string()).unwrap();
        fs::write(dir.join(QUERY_FILE), query).unwrap();
        fs::write(dir.join(EXPRESSION_FILE), expression).unwrap();
    }

    fn webhook_config() -> Value {
        json!({
            "name": "cpu high",
            "type": "stateless",
            "poll_count": 2,
            "index": "metrics-*",
            "run_time": "0 * * * * *",
            "params": {"limit": 90},
            "alert_start": [
                {"type": "webhook", "text": "cpu up", "config": {"url": "http://x/hook"}}
            ],
            "alert_end": [
                {"type": "webhook", "text": "cpu ok", "config": {"url": "http://x/hook"}}
            ]
        })
    }

    fn registry() -> ChannelRegistry {
        ChannelRegistry::builtin(reqwest::Client::new())
    }

    #[test]
    fn loads_a_complete_bundle() {
        let root = TempDir::new().unwrap();
        write_bundle(
            root.path(),
            "cpu_high",
            &webhook_config(),
            "{\"query\": {}}",
            "if (${es.hits.total} > ${P.limit}) { signalActive(); }",
        );

        let rules = load_rules(root.path(), &registry()).unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.name, "cpu high");
        assert_eq!(rule.dir_name, "cpu_high");
        assert_eq!(rule.kind, RuleKind::Stateless);
        assert_eq!(rule.poll_count, 2);
        assert_eq!(rule.alert_start.len(), 1);
        assert_eq!(rule.alert_end.len(), 1);
    }

    #[test]
    fn kind_defaults_to_stateless_and_poll_count_to_zero() {
        let root = TempDir::new().unwrap();
        let mut config = webhook_config();
        config.as_object_mut().unwrap().remove("type");
        config.as_object_mut().unwrap().remove("poll_count");
        write_bundle(root.path(), "r", &config, "{}", "signalActive();");

        let rules = load_rules(root.path(), &registry()).unwrap();
        assert_eq!(rules[0].kind, RuleKind::Stateless);
        assert_eq!(rules[0].poll_count, 0);
    }

    #[test]
    fn missing_query_file_skips_the_rule() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("broken");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CONFIG_FILE), webhook_config().to_string()).unwrap();
        fs::write(dir.join(EXPRESSION_FILE), "signalActive();").unwrap();

        let rules = load_rules(root.path(), &registry()).unwrap();
        assert!(rules.is_empty());

        let err = load_rule(&dir, &registry()).unwrap_err();
        assert!(matches!(err, LoadError::MissingFile { ref file, .. } if file == QUERY_FILE));
    }

    #[test]
    fn unparseable_expression_skips_the_rule() {
        let root = TempDir::new().unwrap();
        write_bundle(root.path(), "r", &webhook_config(), "{}", "if (((");

        let rules = load_rules(root.path(), &registry()).unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn invalid_spec_is_dropped_but_rule_survives() {
        let root = TempDir::new().unwrap();
        let mut config = webhook_config();
        // Second start spec has an unknown channel, first one is fine.
        config["alert_start"] = json!([
            {"type": "webhook", "text": "up", "config": {"url": "http://x"}},
            {"type": "pager", "text": "up", "config": {}}
        ]);
        write_bundle(root.path(), "r", &config, "{}", "signalActive();");

        let rules = load_rules(root.path(), &registry()).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].alert_start.len(), 1);
        assert_eq!(rules[0].alert_start[0].channel_type, "webhook");
    }

    #[test]
    fn rule_with_no_surviving_specs_is_inert_and_skipped() {
        let root = TempDir::new().unwrap();
        let mut config = webhook_config();
        // Webhook requires `url`; both specs fail validation.
        config["alert_start"] = json!([{"type": "webhook", "text": "up", "config": {}}]);
        config["alert_end"] = json!([{"type": "nosuch", "text": "down", "config": {}}]);
        write_bundle(root.path(), "inert", &config, "{}", "signalActive();");

        let rules = load_rules(root.path(), &registry()).unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn rule_survives_with_specs_in_only_one_list() {
        let root = TempDir::new().unwrap();
        let mut config = webhook_config();
        config["alert_end"] = json!([]);
        write_bundle(root.path(), "r", &config, "{}", "signalActive();");

        let rules = load_rules(root.path(), &registry()).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].alert_end.is_empty());
    }

    #[test]
    fn non_directory_entries_are_ignored() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("README.md"), "not a rule").unwrap();
        write_bundle(root.path(), "r", &webhook_config(), "{}", "signalActive();");

        let rules = load_rules(root.path(), &registry()).unwrap();
        assert_eq!(rules.len(), 1);
    }
}
