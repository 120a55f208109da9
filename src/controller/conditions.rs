//! # Condition Ledger
//!
//! Pure functions turning an existing condition list plus this pass's observations into the
//! next condition list.
//!
//! Two kinds of conditions are maintained:
//!
//! - **Primary** conditions (e.g. `Available`) are keyed by type and recomputed every pass.
//!   The transition time only moves when the status changes.
//! - **Warning** conditions are keyed by reason and toggled by a predicate: appended when the
//!   predicate starts to hold, removed when it stops, left untouched while it keeps holding.
//!
//! The output is always sorted, so evaluating twice with the same inputs is byte-identical.

use crate::crd::{Condition, ConditionStatus};
use chrono::{DateTime, Utc};

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_rfc3339(&self) -> String {
        self.now().to_rfc3339()
    }
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a fixed instant, for tests
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A warning toggled on and off by a predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningRule {
    pub r#type: String,
    pub reason: String,
    pub message: String,
}

impl WarningRule {
    pub fn new(
        r#type: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: r#type.into(),
            reason: reason.into(),
            message: message.into(),
        }
    }

    fn to_condition(&self, now: &str) -> Condition {
        Condition {
            r#type: self.r#type.clone(),
            status: ConditionStatus::True,
            reason: self.reason.clone(),
            message: self.message.clone(),
            last_transition_time: Some(now.to_string()),
        }
    }
}

/// A warning rule together with whether it applies this pass
#[derive(Debug, Clone)]
pub struct WarningEvaluation {
    pub rule: WarningRule,
    pub applies: bool,
}

pub fn find_by_type<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

pub fn find_by_reason<'a>(conditions: &'a [Condition], reason: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.reason == reason)
}

pub fn remove_by_reason(conditions: &mut Vec<Condition>, reason: &str) {
    conditions.retain(|c| c.reason != reason);
}

/// Replace the condition of the same type, keeping its transition time if the status holds
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: &str) {
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing
                    .last_transition_time
                    .clone()
                    .or_else(|| Some(now.to_string()))
            } else {
                Some(now.to_string())
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(now.to_string());
            conditions.push(condition);
        }
    }
}

/// Toggle a warning; returns true when the list changed
pub fn apply_warning(
    conditions: &mut Vec<Condition>,
    rule: &WarningRule,
    applies: bool,
    now: &str,
) -> bool {
    let present = find_by_reason(conditions, &rule.reason).is_some();
    match (applies, present) {
        (true, false) => {
            conditions.push(rule.to_condition(now));
            true
        }
        (false, true) => {
            remove_by_reason(conditions, &rule.reason);
            true
        }
        _ => false,
    }
}

/// Sort by type, then reason, for deterministic persistence
pub fn sort_conditions(conditions: &mut [Condition]) {
    conditions.sort_by(|a, b| a.r#type.cmp(&b.r#type).then_with(|| a.reason.cmp(&b.reason)));
}

/// Serialized form used for steady-state comparison
pub fn canonical_json(conditions: &[Condition]) -> Result<String, serde_json::Error> {
    let mut sorted = conditions.to_vec();
    sort_conditions(&mut sorted);
    serde_json::to_string(&sorted)
}

/// Aggregate evaluation of one reconcile pass
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionLedger;

impl ConditionLedger {
    /// Compute the next condition list
    ///
    /// Entries of `existing` that are neither one of the `primary` types nor a rule-driven
    /// warning are carried over unchanged.
    pub fn evaluate(
        existing: &[Condition],
        primary: Vec<Condition>,
        warnings: &[WarningEvaluation],
        clock: &dyn Clock,
    ) -> Vec<Condition> {
        let now = clock.now_rfc3339();
        let mut next = existing.to_vec();
        for condition in primary {
            set_condition(&mut next, condition, &now);
        }
        for evaluation in warnings {
            apply_warning(&mut next, &evaluation.rule, evaluation.applies, &now);
        }
        dedup_by_key(&mut next);
        sort_conditions(&mut next);
        next
    }
}

/// Collapse duplicates that may have been persisted by an older writer
fn dedup_by_key(conditions: &mut Vec<Condition>) {
    let mut seen = std::collections::HashSet::new();
    conditions.retain(|c| seen.insert((c.r#type.clone(), c.reason.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock(minute: u32) -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap())
    }

    fn available(status: ConditionStatus) -> Condition {
        Condition::new("Available", status, "DeploymentsReady", "")
    }

    fn hpa_rule() -> WarningRule {
        WarningRule::new("Warning", "HPA", "HorizontalPodAutoscaling (Hpa) enabled overrides values applied to replicas")
    }

    #[test]
    fn test_primary_keeps_transition_time_when_status_holds() {
        let first = ConditionLedger::evaluate(&[], vec![available(ConditionStatus::True)], &[], &clock(0));
        let second =
            ConditionLedger::evaluate(&first, vec![available(ConditionStatus::True)], &[], &clock(5));
        assert_eq!(first, second);

        let third =
            ConditionLedger::evaluate(&second, vec![available(ConditionStatus::False)], &[], &clock(9));
        assert_ne!(third[0].last_transition_time, second[0].last_transition_time);
    }

    #[test]
    fn test_fixed_point_is_byte_identical() {
        let warnings = vec![WarningEvaluation {
            rule: hpa_rule(),
            applies: true,
        }];
        let once = ConditionLedger::evaluate(
            &[],
            vec![available(ConditionStatus::False)],
            &warnings,
            &clock(0),
        );
        let twice = ConditionLedger::evaluate(
            &once,
            vec![available(ConditionStatus::False)],
            &warnings,
            &clock(30),
        );
        assert_eq!(canonical_json(&once).unwrap(), canonical_json(&twice).unwrap());
    }

    #[test]
    fn test_warning_flip_only_moves_time_on_rising_edge() {
        let eval = |applies| {
            vec![WarningEvaluation {
                rule: hpa_rule(),
                applies,
            }]
        };
        let on = ConditionLedger::evaluate(&[], vec![], &eval(true), &clock(0));
        let still_on = ConditionLedger::evaluate(&on, vec![], &eval(true), &clock(1));
        let off = ConditionLedger::evaluate(&still_on, vec![], &eval(false), &clock(2));
        let on_again = ConditionLedger::evaluate(&off, vec![], &eval(true), &clock(3));

        assert_eq!(on, still_on);
        assert!(find_by_reason(&off, "HPA").is_none());
        assert_eq!(on_again.iter().filter(|c| c.reason == "HPA").count(), 1);
        assert_ne!(
            on[0].last_transition_time,
            on_again[0].last_transition_time
        );
    }

    #[test]
    fn test_output_order_independent_of_construction() {
        let a = ConditionLedger::evaluate(
            &[],
            vec![
                Condition::new("Preflights", ConditionStatus::True, "PreflightsPass", ""),
                available(ConditionStatus::True),
            ],
            &[],
            &clock(0),
        );
        let b = ConditionLedger::evaluate(
            &[],
            vec![
                available(ConditionStatus::True),
                Condition::new("Preflights", ConditionStatus::True, "PreflightsPass", ""),
            ],
            &[],
            &clock(0),
        );
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(a[0].r#type, "Available");
    }

    #[test]
    fn test_duplicates_collapse() {
        let existing = vec![
            available(ConditionStatus::True),
            available(ConditionStatus::True),
        ];
        let next = ConditionLedger::evaluate(&existing, vec![], &[], &clock(0));
        assert_eq!(next.len(), 1);
    }
}
