// src/lib.rs
//! eswatch - Scheduled Elasticsearch alerting with hysteresis and pluggable channels.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod identity;
pub mod machine;
pub mod metrics;
pub mod notify;
pub mod rule;
pub mod schedule;
pub mod search;
pub mod state;
pub mod template;

// Re-export commonly used types
pub use cli::LogFormat;
pub use engine::{AlertEngine, RuleRunner};
pub use expr::{Evaluation, ExprContext, MatchEvent, MatchExpression, Signal, MAX_EVENTS_PER_PASS};
pub use identity::AlertIdentity;
pub use machine::{AlertState, RuleKind, Transition};
pub use metrics::{register_metric_descriptions, MetricsServer};
pub use notify::{ChannelPlugin, ChannelRegistry, Dispatcher, MAX_SEND_ATTEMPTS};
pub use rule::{NotificationSpec, Rule};
pub use schedule::{RuleSchedule, ScheduleSpec};
pub use search::{HttpSearchClient, SearchClient};
pub use state::{AlertTable, TriggerStateStore};
