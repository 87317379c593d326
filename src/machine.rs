//! Per-identity alert state machine.
//!
//! Consumes one observation (satisfied / unsatisfied) against the durable
//! `active` flag and the volatile hysteresis counters, and decides whether a
//! user-visible notification fires. `poll_count` is the number of
//! consecutive same-direction observations required before a transition is
//! honored; the default of 0 fires immediately (the `up_count >= P-1` check
//! is trivially true), which is intended behavior rather than a special
//! case.
//!
//! The transition function is pure and computation-only. Serialization of
//! concurrent calls for the same identity is the caller's responsibility
//! (see the alert table in `state.rs`).

use serde::{Deserialize, Serialize};

/// Stateful rules notify once per activation; stateless rules re-notify
/// every `poll_count` satisfied observations while active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Stateful,
    #[default]
    Stateless,
}

/// Per-identity alert state.
///
/// `active` is durable (persisted through the trigger state store);
/// the counters are volatile and reset to zero on process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertState {
    pub active: bool,
    pub up_count: u32,
    pub down_count: u32,
}

impl AlertState {
    /// State restored from a persisted `active` flag at startup.
    pub fn restored(active: bool) -> Self {
        AlertState {
            active,
            ..Default::default()
        }
    }
}

/// What an observation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Counters may have moved, nothing to notify.
    None,
    /// Emit the rule's `alert_start` notifications; `active` became true
    /// (or a stateless repeat while already active).
    Start,
    /// Emit the rule's `alert_end` notifications; `active` became false.
    End,
}

/// Apply one observation to an alert's state.
///
/// `satisfied` is the direction of the match event; `poll_count` is the
/// rule's hysteresis threshold. Returns what, if anything, to notify.
pub fn step(state: &mut AlertState, satisfied: bool, kind: RuleKind, poll_count: u32) -> Transition {
    // up_count >= poll_count - 1, computed in i64 so poll_count = 0
    // (threshold -1) fires on the first satisfied observation.
    let threshold = i64::from(poll_count) - 1;

    match (state.active, satisfied) {
        (false, true) => {
            if i64::from(state.up_count) >= threshold {
                state.active = true;
                state.down_count = 0;
                if kind == RuleKind::Stateless {
                    state.up_count = 0;
                }
                Transition::Start
            } else {
                state.up_count += 1;
                Transition::None
            }
        }
        (true, true) => match kind {
            RuleKind::Stateful => {
                state.down_count = 0;
                Transition::None
            }
            RuleKind::Stateless => {
                if i64::from(state.up_count) >= threshold {
                    state.up_count = 0;
                    Transition::Start
                } else {
                    state.up_count += 1;
                    state.down_count = 0;
                    Transition::None
                }
            }
        },
        (true, false) => {
            if i64::from(state.down_count) >= threshold {
                state.active = false;
                state.up_count = 0;
                Transition::End
            } else {
                state.down_count += 1;
                Transition::None
            }
        }
        (false, false) => {
            state.up_count = 0;
            Transition::None
        }
    }
}
