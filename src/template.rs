//! Placeholder rendering for query bodies, alert text and channel configs.
//!
//! Templates use `${...}` placeholders. Each placeholder is evaluated as an
//! expression against the bound context (`es`, `tmp`, `P`, `ALERT_ID`) and
//! its string form replaces the placeholder in place, left to right,
//! non-overlapping. A malformed placeholder yields an [`ExpressionError`]
//! that callers catch per evaluation pass; it never crashes the process.
//!
//! Query bodies are rendered *before* a response exists, with a reduced
//! context: only synthetic literals such as `CURRENT_TIME_MS` are bound, and
//! friendly duration words (`5minutes`, `1 hour`) are rewritten to
//! millisecond arithmetic first, so queries can express relative time
//! windows in human units:
//!
//! ```json
//! {"range": {"@timestamp": {"gte": ${CURRENT_TIME_MS - 5minutes}}}}
//! ```

use std::sync::OnceLock;

use serde_json::{Map, Value};

use crate::error::ExpressionError;
use crate::expr::{self, ExprContext};

fn placeholder_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\$\{([^{}]*)\}").expect("static regex"))
}

/// Render a template string against a context.
///
/// Placeholders are evaluated independently; the first failure aborts the
/// whole render so a half-substituted string is never used.
pub fn render(template: &str, ctx: ExprContext<'_>) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder_re().captures_iter(template) {
        let whole = caps.get(0).expect("match");
        let inner = caps.get(1).expect("group").as_str();
        out.push_str(&template[last..whole.start()]);
        let value = expr::eval_str(inner, ctx)?;
        out.push_str(&expr::value_to_string(&value));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Render a query-body template with the reduced pre-response context.
///
/// Only synthetic literals are bound (`CURRENT_TIME_MS` = `now_ms`); inside
/// each placeholder, friendly duration words are rewritten to millisecond
/// arithmetic before evaluation (1s=1000ms, 1m=60s, 1h=60m, 1d=24h).
pub fn render_query(template: &str, now_ms: i64) -> Result<String, ExpressionError> {
    let mut consts = Map::new();
    consts.insert("CURRENT_TIME_MS".to_string(), Value::from(now_ms));
    let ctx = ExprContext {
        consts: Some(&consts),
        ..Default::default()
    };

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder_re().captures_iter(template) {
        let whole = caps.get(0).expect("match");
        let inner = rewrite_durations(caps.get(1).expect("group").as_str());
        out.push_str(&template[last..whole.start()]);
        let value = expr::eval_str(&inner, ctx)?;
        out.push_str(&expr::value_to_string(&value));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Render every string leaf of a JSON config tree against a context.
///
/// Non-string leaves pass through untouched. Used for a notification spec's
/// `config` value, whose string fields may carry placeholders.
pub fn render_config(config: &Value, ctx: ExprContext<'_>) -> Result<Value, ExpressionError> {
    match config {
        Value::String(s) => Ok(Value::String(render(s, ctx)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_config(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), render_config(value, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Rewrite `<n>second(s)/minute(s)/hour(s)/day(s)` to millisecond arithmetic.
fn rewrite_durations(expr: &str) -> String {
    static RULES: OnceLock<Vec<(regex::Regex, &'static str)>> = OnceLock::new();
    let rules = RULES.get_or_init(|| {
        vec![
            (
                regex::Regex::new(r"(?i)([0-9]+)\s*seconds?").expect("static regex"),
                "$1*1000",
            ),
            (
                regex::Regex::new(r"(?i)([0-9]+)\s*minutes?").expect("static regex"),
                "$1*60*1000",
            ),
            (
                regex::Regex::new(r"(?i)([0-9]+)\s*hours?").expect("static regex"),
                "$1*60*60*1000",
            ),
            (
                regex::Regex::new(r"(?i)([0-9]+)\s*days?").expect("static regex"),
                "$1*24*60*60*1000",
            ),
        ]
    });
    let mut out = expr.to_string();
    for (re, replacement) in rules {
        out = re.replace_all(&out, *replacement).into_owned();
    }
    out
}
