//! Centralized error types for eswatch using thiserror.
//!
//! The taxonomy mirrors the failure domains of the polling loop: a bad rule
//! bundle, a failed search, a broken match expression, an undeliverable
//! notification, or an unreadable state file. None of these are fatal to the
//! process; the engine always favors keeping the polling loop alive.

use thiserror::Error;

/// Errors related to daemon configuration and rule-bundle loading.
///
/// A `LoadError` skips the offending rule (or drops one notification spec)
/// while the rest of the process continues.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("rule '{rule}' is missing required file '{file}'")]
    MissingFile { rule: String, file: String },
    #[error("rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },
    #[error("invalid schedule '{schedule}' in rule '{rule}': {message}")]
    InvalidSchedule {
        rule: String,
        schedule: String,
        message: String,
    },
}

/// Errors from the search-store query call.
///
/// Logged and dropped; the next scheduled run proceeds unaffected.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("search request failed: {0}")]
    Request(String),
    #[error("search returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("query body is not valid JSON after rendering: {0}")]
    InvalidBody(String),
}

/// Errors raised while parsing or evaluating a match expression or a
/// `${...}` placeholder.
///
/// An `ExpressionError` aborts the current evaluation pass after logging.
/// Match events collected before the error are still processed.
#[derive(Error, Debug)]
pub enum ExpressionError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("{0}")]
    Eval(String),
}

impl ExpressionError {
    pub(crate) fn eval(message: impl Into<String>) -> Self {
        ExpressionError::Eval(message.into())
    }
}

/// Errors from a channel plugin send.
///
/// Retried up to the fixed bound, then logged as failed. Never escalated.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("invalid channel config: {0}")]
    InvalidConfig(String),
}

/// Errors from the trigger state file.
///
/// A missing or corrupt file at startup degrades to an empty state map; a
/// failed save is logged and the transition stands in memory.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to read state file {path}: {message}")]
    Read { path: String, message: String },
    #[error("failed to write state file {path}: {message}")]
    Write { path: String, message: String },
    #[error("state file {path} is not a valid identity map: {message}")]
    Corrupt { path: String, message: String },
}

/// Aggregate error for a rule task.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("load error: {0}")]
    Load(#[from] LoadError),
    #[error("query error: {0}")]
    Query(#[from] QueryError),
    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("state error: {0}")]
    State(#[from] StateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_display() {
        let err = LoadError::MissingFile {
            rule: "cpu_high".to_string(),
            file: "query.json".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "rule 'cpu_high' is missing required file 'query.json'"
        );
    }

    #[test]
    fn query_error_display() {
        let err = QueryError::Status {
            status: 503,
            body: "unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "search returned HTTP 503: unavailable");
    }

    #[test]
    fn expression_error_display() {
        let err = ExpressionError::Parse {
            offset: 12,
            message: "unexpected '}'".to_string(),
        };
        assert_eq!(err.to_string(), "parse error at offset 12: unexpected '}'");

        let err = ExpressionError::UnknownVariable("foo".to_string());
        assert_eq!(err.to_string(), "unknown variable 'foo'");
    }

    #[test]
    fn delivery_error_display() {
        let err = DeliveryError::SendFailed("timeout".to_string());
        assert_eq!(err.to_string(), "send failed: timeout");
    }

    #[test]
    fn rule_error_wraps_inner() {
        let err = RuleError::from(QueryError::Request("refused".to_string()));
        assert_eq!(err.to_string(), "query error: search request failed: refused");

        let err = RuleError::from(ExpressionError::eval("division by zero"));
        assert_eq!(err.to_string(), "expression error: division by zero");
    }
}
