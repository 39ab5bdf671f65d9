#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// Any repair is an error.
    Strict,
    /// Repair what can be repaired and record it.
    #[default]
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Allow,
    Reject,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A synthesized column name was already taken.
    NameCollision,
    /// A pivot would create more columns than allowed.
    PivotWidth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    pub kind: IssueKind,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub ts_unix_ms: u64,
    pub mode: RuntimeMode,
    pub action: DecisionAction,
    pub issue: CompatibilityIssue,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceLedger {
    records: Vec<DecisionRecord>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: DecisionRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[DecisionRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records about one kind of issue, oldest first.
    pub fn of_kind(&self, kind: IssueKind) -> impl Iterator<Item = &DecisionRecord> + '_ {
        self.records.iter().filter(move |r| r.issue.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePolicy {
    pub mode: RuntimeMode,
    /// Most columns one pivot may synthesize; `None` is unbounded.
    pub pivot_column_cap: Option<usize>,
}

impl RuntimePolicy {
    #[must_use]
    pub fn strict() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            pivot_column_cap: None,
        }
    }

    #[must_use]
    pub fn hardened(pivot_column_cap: Option<usize>) -> Self {
        Self {
            mode: RuntimeMode::Hardened,
            pivot_column_cap,
        }
    }

    /// A generated name clashed and `repaired` was picked instead.
    pub fn decide_name_collision(
        &self,
        subject: impl Into<String>,
        repaired: &str,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        let action = match self.mode {
            RuntimeMode::Strict => DecisionAction::Reject,
            RuntimeMode::Hardened => DecisionAction::Repair,
        };
        let issue = CompatibilityIssue {
            kind: IssueKind::NameCollision,
            subject: subject.into(),
            detail: format!("renamed_to={repaired}"),
        };
        record(self.mode, action, issue, ledger)
    }

    pub fn decide_pivot_width(&self, columns: usize, ledger: &mut EvidenceLedger) -> DecisionAction {
        let cap = self.pivot_column_cap.unwrap_or(usize::MAX);
        let action = if columns > cap {
            DecisionAction::Reject
        } else {
            DecisionAction::Allow
        };
        let issue = CompatibilityIssue {
            kind: IssueKind::PivotWidth,
            subject: "pivot".to_owned(),
            detail: format!("columns={columns} cap={cap}"),
        };
        record(self.mode, action, issue, ledger)
    }
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self::hardened(None)
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
}

fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}

fn record(
    mode: RuntimeMode,
    action: DecisionAction,
    issue: CompatibilityIssue,
    ledger: &mut EvidenceLedger,
) -> DecisionAction {
    debug!(?mode, ?action, kind = ?issue.kind, subject = %issue.subject, detail = %issue.detail, "runtime decision");
    ledger.push(DecisionRecord {
        ts_unix_ms: now_unix_ms().unwrap_or_default(),
        mode,
        action,
        issue,
    });
    action
}

#[cfg(test)]
mod tests {
    use super::{DecisionAction, EvidenceLedger, IssueKind, RuntimeMode, RuntimePolicy};

    #[test]
    fn default_policy_is_hardened_and_unbounded() {
        let policy = RuntimePolicy::default();
        assert_eq!(policy.mode, RuntimeMode::Hardened);
        assert_eq!(policy.pivot_column_cap, None);
    }

    #[test]
    fn strict_rejects_name_collision() {
        let mut ledger = EvidenceLedger::new();
        let action = RuntimePolicy::strict().decide_name_collision("a.b", "b_1", &mut ledger);
        assert_eq!(action, DecisionAction::Reject);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.records()[0].mode, RuntimeMode::Strict);
    }

    #[test]
    fn hardened_repairs_and_records() {
        let mut ledger = EvidenceLedger::new();
        let policy = RuntimePolicy::hardened(None);
        assert_eq!(
            policy.decide_name_collision("city", "city_1", &mut ledger),
            DecisionAction::Repair
        );
        assert_eq!(policy.decide_pivot_width(10, &mut ledger), DecisionAction::Allow);
        let collisions: Vec<_> = ledger.of_kind(IssueKind::NameCollision).collect();
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].issue.detail, "renamed_to=city_1");
    }

    #[test]
    fn pivot_cap_rejects_in_every_mode() {
        let mut ledger = EvidenceLedger::new();
        assert_eq!(
            RuntimePolicy::hardened(Some(3)).decide_pivot_width(4, &mut ledger),
            DecisionAction::Reject
        );
        let strict = RuntimePolicy {
            pivot_column_cap: Some(3),
            ..RuntimePolicy::strict()
        };
        assert_eq!(strict.decide_pivot_width(3, &mut ledger), DecisionAction::Allow);
        assert_eq!(strict.decide_pivot_width(4, &mut ledger), DecisionAction::Reject);
        assert_eq!(ledger.of_kind(IssueKind::PivotWidth).count(), 3);
    }

    #[test]
    fn ledger_serializes_with_snake_case_tags() {
        let mut ledger = EvidenceLedger::new();
        RuntimePolicy::hardened(Some(1)).decide_pivot_width(2, &mut ledger);
        let json = serde_json::to_value(&ledger).expect("json");
        let record = &json["records"][0];
        assert_eq!(record["mode"], "hardened");
        assert_eq!(record["action"], "reject");
        assert_eq!(record["issue"]["kind"], "pivot_width");
        let back: EvidenceLedger = serde_json::from_value(json).expect("parse");
        assert_eq!(back, ledger);
    }
}
