//! Alert engine orchestrating multiple rules.
//!
//! Each rule runs as an independent Tokio task, providing isolation:
//! errors in one rule don't affect others, panics are captured and logged,
//! and each rule follows its own cron schedule.
//!
//! ```text
//! main.rs
//!     |
//!     v
//! engine.rs (AlertEngine)
//!     |
//!     +-- spawn --> run_rule(rule_1) --> search.rs --> expr.rs --> machine.rs --> notify/
//!     +-- spawn --> run_rule(rule_2) --> ...
//!     +-- spawn --> run_rule(rule_n) --> ...
//! ```
//!
//! Per tick the pipeline is: render the query template, run the search,
//! evaluate the match expression into events, and for each event step the
//! alert state machine under the shared table lock, dispatching and
//! persisting on a transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::RuleError;
use crate::expr::{ExprContext, MatchEvent, MatchExpression};
use crate::identity::AlertIdentity;
use crate::machine::Transition;
use crate::notify::Dispatcher;
use crate::rule::Rule;
use crate::search::SearchClient;
use crate::state::AlertTable;
use crate::template;

/// Delay before restarting a rule task after a panic.
const PANIC_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Alert engine that supervises all rule tasks.
///
/// The engine spawns one task per rule and supervises them via `JoinSet`:
/// task isolation, panic detection with restart, and graceful shutdown via
/// cancellation token.
pub struct AlertEngine {
    rules: Vec<Arc<Rule>>,
    search: Arc<dyn SearchClient>,
    dispatcher: Arc<Dispatcher>,
    table: Arc<Mutex<AlertTable>>,
}

impl AlertEngine {
    pub fn new(
        rules: Vec<Rule>,
        search: Arc<dyn SearchClient>,
        dispatcher: Arc<Dispatcher>,
        table: Arc<Mutex<AlertTable>>,
    ) -> Self {
        AlertEngine {
            rules: rules.into_iter().map(Arc::new).collect(),
            search,
            dispatcher,
            table,
        }
    }

    /// Run the engine until cancelled.
    ///
    /// Returns `Ok(())` on cancellation, or immediately when no rules are
    /// loaded. Rule-level failures never propagate here; a rule task only
    /// ends early if its schedule can never fire again.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RuleError> {
        let mut tasks: JoinSet<(String, Result<(), RuleError>)> = JoinSet::new();
        let mut handle_to_runner: HashMap<tokio::task::Id, (String, RuleRunner)> = HashMap::new();

        for rule in &self.rules {
            let runner = RuleRunner {
                rule: Arc::clone(rule),
                search: Arc::clone(&self.search),
                dispatcher: Arc::clone(&self.dispatcher),
                table: Arc::clone(&self.table),
            };
            Self::spawn_rule(&mut tasks, &mut handle_to_runner, runner, cancel.clone());
        }

        if self.rules.is_empty() {
            warn!("No rules loaded, engine will exit");
            return Ok(());
        }

        info!(rule_count = self.rules.len(), "Alert engine started, supervising rules");
        self.supervise(&mut tasks, &mut handle_to_runner, cancel).await
    }

    fn spawn_rule(
        tasks: &mut JoinSet<(String, Result<(), RuleError>)>,
        handle_to_runner: &mut HashMap<tokio::task::Id, (String, RuleRunner)>,
        runner: RuleRunner,
        cancel: CancellationToken,
    ) {
        let rule_name = runner.rule.name.clone();
        let task_runner = runner.clone();
        let task_name = rule_name.clone();
        let abort_handle = tasks.spawn(async move {
            let result = run_rule(task_runner, cancel).await;
            (task_name, result)
        });
        handle_to_runner.insert(abort_handle.id(), (rule_name, runner));
    }

    async fn supervise(
        &self,
        tasks: &mut JoinSet<(String, Result<(), RuleError>)>,
        handle_to_runner: &mut HashMap<tokio::task::Id, (String, RuleRunner)>,
        cancel: CancellationToken,
    ) -> Result<(), RuleError> {
        loop {
            tokio::select! {
                Some(result) = tasks.join_next_with_id() => {
                    match result {
                        Ok((task_id, (rule_name, Ok(())))) => {
                            info!(rule_name = %rule_name, "Rule task completed");
                            handle_to_runner.remove(&task_id);
                        }
                        Ok((task_id, (rule_name, Err(e)))) => {
                            error!(
                                rule_name = %rule_name,
                                error = %e,
                                "Rule task failed fatally"
                            );
                            metrics::counter!(
                                "eswatch_rule_errors_total",
                                "rule_name" => rule_name
                            ).increment(1);
                            handle_to_runner.remove(&task_id);
                        }
                        Err(join_error) if join_error.is_panic() => {
                            let task_id = join_error.id();
                            if let Some((rule_name, runner)) = handle_to_runner.remove(&task_id) {
                                error!(
                                    rule_name = %rule_name,
                                    error = %join_error,
                                    "Rule task panicked - CRITICAL"
                                );
                                metrics::counter!(
                                    "eswatch_rule_panics_total",
                                    "rule_name" => rule_name.clone()
                                ).increment(1);

                                if !cancel.is_cancelled() {
                                    info!(
                                        rule_name = %rule_name,
                                        delay_secs = PANIC_RESTART_DELAY.as_secs(),
                                        "Respawning rule after panic delay"
                                    );
                                    tokio::time::sleep(PANIC_RESTART_DELAY).await;
                                    if !cancel.is_cancelled() {
                                        Self::spawn_rule(
                                            tasks,
                                            handle_to_runner,
                                            runner,
                                            cancel.clone(),
                                        );
                                    }
                                }
                            } else {
                                error!(
                                    error = %join_error,
                                    "Rule task panicked but runner not found - CRITICAL"
                                );
                            }
                        }
                        Err(join_error) => {
                            tracing::debug!(error = %join_error, "Rule task cancelled");
                            handle_to_runner.remove(&join_error.id());
                        }
                    }

                    if tasks.is_empty() && !cancel.is_cancelled() {
                        warn!("All rule tasks completed unexpectedly");
                        return Ok(());
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Shutdown signal received, aborting all rules");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    info!("All rule tasks stopped");
                    return Ok(());
                }
            }
        }
    }
}

impl std::fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEngine")
            .field("rule_count", &self.rules.len())
            .finish()
    }
}

/// Everything one rule task needs to evaluate its rule.
#[derive(Clone)]
pub struct RuleRunner {
    rule: Arc<Rule>,
    search: Arc<dyn SearchClient>,
    dispatcher: Arc<Dispatcher>,
    table: Arc<Mutex<AlertTable>>,
}

impl RuleRunner {
    pub fn new(
        rule: Arc<Rule>,
        search: Arc<dyn SearchClient>,
        dispatcher: Arc<Dispatcher>,
        table: Arc<Mutex<AlertTable>>,
    ) -> Self {
        RuleRunner {
            rule,
            search,
            dispatcher,
            table,
        }
    }

    /// One scheduled evaluation of the rule against the current clock.
    pub async fn tick(&self) -> Result<(), RuleError> {
        self.tick_at(Utc::now().timestamp_millis()).await
    }

    /// One evaluation with an explicit notion of "now" in epoch millis.
    pub async fn tick_at(&self, now_ms: i64) -> Result<(), RuleError> {
        let body = template::render_query(&self.rule.query_template, now_ms)?;
        let response = self.search.search(&self.rule.index, &body).await?;
        metrics::counter!(
            "eswatch_evaluations_total",
            "rule_name" => self.rule.name.clone()
        )
        .increment(1);

        let ctx = ExprContext {
            response: Some(&response),
            params: Some(&self.rule.params),
            ..Default::default()
        };
        let evaluation = self.rule.expression.evaluate(ctx);

        if evaluation.capped {
            warn!(
                rule_name = %self.rule.name,
                events = evaluation.events.len(),
                "Match expression hit the event cap, pass truncated"
            );
            metrics::counter!(
                "eswatch_capped_passes_total",
                "rule_name" => self.rule.name.clone()
            )
            .increment(1);
        }
        if let Some(e) = &evaluation.error {
            // Events collected before the failure are still processed.
            warn!(
                rule_name = %self.rule.name,
                error = %e,
                "Match expression failed"
            );
            metrics::counter!(
                "eswatch_expression_errors_total",
                "rule_name" => self.rule.name.clone()
            )
            .increment(1);
        }

        for event in &evaluation.events {
            self.apply(event, &response).await;
        }
        Ok(())
    }

    /// Step the state machine for one match event, dispatching and
    /// persisting on a transition.
    ///
    /// The table lock is held across step + dispatch + persist so that
    /// concurrent evaluations touching the same identity cannot interleave
    /// the read-modify-write.
    async fn apply(&self, event: &MatchEvent, response: &serde_json::Value) {
        let identity = AlertIdentity::derive(&self.rule.dir_name, event.match_key.as_deref());

        let mut table = self.table.lock().await;
        let transition = table.step(
            &identity,
            event.is_positive(),
            self.rule.kind,
            self.rule.poll_count,
        );

        let specs = match transition {
            Transition::Start => {
                metrics::counter!(
                    "eswatch_alerts_started_total",
                    "rule_name" => self.rule.name.clone()
                )
                .increment(1);
                &self.rule.alert_start
            }
            Transition::End => {
                metrics::counter!(
                    "eswatch_alerts_ended_total",
                    "rule_name" => self.rule.name.clone()
                )
                .increment(1);
                &self.rule.alert_end
            }
            Transition::None => return,
        };

        info!(
            rule_name = %self.rule.name,
            identity = %identity,
            match_key = event.match_key.as_deref().unwrap_or(""),
            transition = ?transition,
            "Alert transition"
        );

        let ctx = ExprContext {
            response: Some(response),
            params: Some(&self.rule.params),
            tmp: Some(&event.variables),
            alert_id: Some(event.match_key.as_deref().unwrap_or("")),
            ..Default::default()
        };
        self.dispatcher.dispatch(&self.rule.name, specs, ctx).await;

        metrics::gauge!("eswatch_active_alerts").set(table.active_count() as f64);

        // The flag write is best-effort; the in-memory transition stands
        // even if the file could not be updated.
        if let Err(e) = table.persist() {
            warn!(
                rule_name = %self.rule.name,
                error = %e,
                "Failed to persist trigger state"
            );
        }
    }
}

impl std::fmt::Debug for RuleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRunner")
            .field("rule", &self.rule.name)
            .finish()
    }
}

/// Run one rule's schedule loop until cancelled.
///
/// Recoverable tick errors (query failures, render failures) are logged
/// and the loop continues with the next scheduled run.
async fn run_rule(runner: RuleRunner, cancel: CancellationToken) -> Result<(), RuleError> {
    let rule_name = runner.rule.name.clone();
    info!(rule_name = %rule_name, "Rule task started");

    loop {
        let now = Utc::now();
        let Some(next) = runner.rule.schedule.next_after(now) else {
            warn!(rule_name = %rule_name, "Schedule has no future fire times, rule task ending");
            return Ok(());
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(rule_name = %rule_name, "Rule task stopping due to cancellation");
                return Ok(());
            }
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = runner.tick().await {
            warn!(
                rule_name = %rule_name,
                error = %e,
                "Evaluation failed, continuing with next scheduled run"
            );
        }
    }
}
