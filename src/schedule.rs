//! Cron schedule parsing and next-fire computation.
//!
//! A rule's `run_time` is either a single cron expression or a list of them;
//! the rule fires whenever any entry does. Expressions use the 6/7-field
//! form with a leading seconds column (`"0 */5 * * * *"`).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Deserialize;

use crate::error::LoadError;

/// `run_time` as written in a rule config: one expression or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScheduleSpec {
    One(String),
    Many(Vec<String>),
}

impl ScheduleSpec {
    pub fn entries(&self) -> Vec<&str> {
        match self {
            ScheduleSpec::One(s) => vec![s.as_str()],
            ScheduleSpec::Many(list) => list.iter().map(String::as_str).collect(),
        }
    }
}

/// Parsed schedule set for one rule.
#[derive(Debug, Clone)]
pub struct RuleSchedule {
    entries: Vec<Schedule>,
}

impl RuleSchedule {
    pub fn parse(rule_name: &str, spec: &ScheduleSpec) -> Result<Self, LoadError> {
        let raw = spec.entries();
        if raw.is_empty() {
            return Err(LoadError::InvalidSchedule {
                rule: rule_name.to_string(),
                schedule: String::new(),
                message: "run_time has no entries".to_string(),
            });
        }
        let mut entries = Vec::with_capacity(raw.len());
        for source in raw {
            let schedule =
                Schedule::from_str(source).map_err(|e| LoadError::InvalidSchedule {
                    rule: rule_name.to_string(),
                    schedule: source.to_string(),
                    message: e.to_string(),
                })?;
            entries.push(schedule);
        }
        Ok(RuleSchedule { entries })
    }

    /// Earliest fire time strictly after `now` across all entries.
    ///
    /// `None` only for schedules that can never fire again (e.g. a fixed
    /// year in the past).
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .filter_map(|s| s.after(&now).next())
            .min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn single_entry_parses() {
        let spec = ScheduleSpec::One("0 * * * * *".to_string());
        let schedule = RuleSchedule::parse("r", &spec).unwrap();
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn next_fire_is_within_the_minute_for_every_minute_schedule() {
        let spec = ScheduleSpec::One("0 * * * * *".to_string());
        let schedule = RuleSchedule::parse("r", &spec).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 31, 0).unwrap());
    }

    #[test]
    fn multiple_entries_pick_the_earliest() {
        let spec = ScheduleSpec::Many(vec![
            "0 0 * * * *".to_string(),
            "0 45 * * * *".to_string(),
        ]);
        let schedule = RuleSchedule::parse("r", &spec).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 45, 0).unwrap());
    }

    #[test]
    fn invalid_expression_is_a_schedule_error() {
        let spec = ScheduleSpec::One("not a cron line".to_string());
        let err = RuleSchedule::parse("cpu_high", &spec).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("cpu_high"));
        assert!(text.contains("not a cron line"));
    }

    #[test]
    fn empty_list_is_rejected() {
        let spec = ScheduleSpec::Many(Vec::new());
        assert!(RuleSchedule::parse("r", &spec).is_err());
    }

    #[test]
    fn spec_deserializes_from_string_or_list() {
        let one: ScheduleSpec = serde_json::from_str("\"0 * * * * *\"").unwrap();
        assert_eq!(one.entries(), vec!["0 * * * * *"]);

        let many: ScheduleSpec =
            serde_json::from_str("[\"0 0 * * * *\", \"0 30 * * * *\"]").unwrap();
        assert_eq!(many.entries().len(), 2);
    }
}
