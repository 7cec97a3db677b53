use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::applicable_rules;
use crate::domain::expense::{ExpenseClaim, ExpenseStatus};
use crate::domain::identity::UserId;
use crate::domain::rule::{ApprovalRule, RuleId, RuleKind, SequencedApprover};

/// A sequential rule with no approver at the sequence number the claim is
/// waiting on. Evaluation fails closed (Pending) and reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error(
    "rule `{}` has no approver with sequence {expected_sequence} ({approver_count} approvers configured)",
    .rule_id.0
)]
pub struct ConfigurationInconsistency {
    pub rule_id: RuleId,
    pub expected_sequence: u32,
    pub approver_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Approved or Pending. Rejection only ever comes from an explicit reject.
    pub status: ExpenseStatus,
    pub next_step: u32,
    /// The rule that settled the outcome, if any rule did.
    pub decided_by: Option<RuleId>,
    pub inconsistencies: Vec<ConfigurationInconsistency>,
}

impl Evaluation {
    fn settled(status: ExpenseStatus, next_step: u32, decided_by: Option<RuleId>) -> Self {
        Self { status, next_step, decided_by, inconsistencies: Vec::new() }
    }
}

enum RuleVerdict {
    Approved { next_step: u32 },
    Pending { next_step: u32 },
    Inconsistent(ConfigurationInconsistency),
    FallThrough,
}

/// Computes the claim's next status and step pointer from its ledger and the
/// organization's rules, in priority order.
///
/// The first rule to produce a verdict wins. A sequential rule that is still
/// in progress answers Pending outright; the other rule types only ever answer
/// Approved and otherwise defer to the next rule.
///
/// `rules` are the organization's rules, not pre-filtered by amount. Only an
/// organization with no active rule at all approves outright; active rules
/// whose thresholds all miss the claim leave it Pending.
pub fn evaluate(claim: &ExpenseClaim, rules: &[ApprovalRule]) -> Evaluation {
    let step = claim.current_approver_step;
    if !has_active_rules(rules, claim) {
        return Evaluation::settled(ExpenseStatus::Approved, step, None);
    }

    let approved_by = claim.approved_by();
    for rule in applicable_rules(rules, claim) {
        match rule_verdict(rule, step, &approved_by) {
            RuleVerdict::Approved { next_step } => {
                return Evaluation::settled(
                    ExpenseStatus::Approved,
                    next_step,
                    Some(rule.id.clone()),
                );
            }
            RuleVerdict::Pending { next_step } => {
                return Evaluation::settled(ExpenseStatus::Pending, next_step, Some(rule.id.clone()));
            }
            RuleVerdict::Inconsistent(inconsistency) => {
                return Evaluation {
                    status: ExpenseStatus::Pending,
                    next_step: step,
                    decided_by: Some(rule.id.clone()),
                    inconsistencies: vec![inconsistency],
                };
            }
            RuleVerdict::FallThrough => {}
        }
    }

    Evaluation::settled(ExpenseStatus::Pending, step, None)
}

fn has_active_rules(rules: &[ApprovalRule], claim: &ExpenseClaim) -> bool {
    rules.iter().any(|rule| rule.organization_id == claim.organization_id && rule.is_active)
}

fn rule_verdict(rule: &ApprovalRule, step: u32, approved_by: &HashSet<&UserId>) -> RuleVerdict {
    match &rule.kind {
        RuleKind::Sequential { approvers } => sequential_verdict(rule, approvers, step, approved_by),
        RuleKind::Percentage { approvers, percentage_required } => {
            if quorum_reached(approvers, *percentage_required, approved_by) {
                RuleVerdict::Approved { next_step: step }
            } else {
                RuleVerdict::FallThrough
            }
        }
        RuleKind::SpecificApprover { designated } => {
            if any_approved(designated, approved_by) {
                RuleVerdict::Approved { next_step: step }
            } else {
                RuleVerdict::FallThrough
            }
        }
        RuleKind::Hybrid { designated, approvers, percentage_required } => {
            if any_approved(designated, approved_by) {
                return RuleVerdict::Approved { next_step: step };
            }
            let quorum = (*percentage_required)
                .filter(|_| !approvers.is_empty())
                .is_some_and(|required| quorum_reached(approvers, required, approved_by));
            if quorum {
                RuleVerdict::Approved { next_step: step }
            } else {
                RuleVerdict::FallThrough
            }
        }
    }
}

fn sequential_verdict(
    rule: &ApprovalRule,
    approvers: &[SequencedApprover],
    step: u32,
    approved_by: &HashSet<&UserId>,
) -> RuleVerdict {
    let total = approvers.len();
    if step as usize >= total {
        return RuleVerdict::FallThrough;
    }

    let expected_sequence = step + 1;
    let Some(next) = approvers.iter().find(|entry| entry.sequence == expected_sequence) else {
        return RuleVerdict::Inconsistent(ConfigurationInconsistency {
            rule_id: rule.id.clone(),
            expected_sequence,
            approver_count: total,
        });
    };

    if !approved_by.contains(&next.approver) {
        return RuleVerdict::Pending { next_step: step };
    }

    let next_step = step + 1;
    if next_step as usize >= total {
        RuleVerdict::Approved { next_step }
    } else {
        RuleVerdict::Pending { next_step }
    }
}

/// `approved / total * 100 >= required`, compared unrounded. An empty approver
/// list never reaches quorum.
fn quorum_reached(
    approvers: &[SequencedApprover],
    percentage_required: u8,
    approved_by: &HashSet<&UserId>,
) -> bool {
    if approvers.is_empty() {
        return false;
    }

    let approved = approvers.iter().filter(|entry| approved_by.contains(&entry.approver)).count();
    let percentage = (approved as f64 / approvers.len() as f64) * 100.0;
    percentage >= f64::from(percentage_required)
}

fn any_approved(designated: &[UserId], approved_by: &HashSet<&UserId>) -> bool {
    designated.iter().any(|approver| approved_by.contains(approver))
}
