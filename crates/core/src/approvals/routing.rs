use std::collections::HashSet;

use crate::approvals::applicable_rules;
use crate::domain::expense::ExpenseClaim;
use crate::domain::identity::{ClaimantProfile, UserId};
use crate::domain::rule::{ApprovalRule, RuleKind, SequencedApprover};

/// Users whose decision could move a pending claim forward, in rule order.
pub fn pending_approvers(
    claim: &ExpenseClaim,
    rules: &[ApprovalRule],
    profile: &ClaimantProfile,
) -> Vec<UserId> {
    if claim.is_terminal() {
        return Vec::new();
    }

    if claim.current_approver_step == 0 {
        if let Some(manager_id) = profile.gating_manager() {
            return vec![manager_id.clone()];
        }
    }

    let step = claim.current_approver_step;
    let approved_by = claim.approved_by();
    let mut candidates: Vec<&UserId> = Vec::new();

    for rule in applicable_rules(rules, claim) {
        match &rule.kind {
            RuleKind::Sequential { approvers } => {
                if (step as usize) < approvers.len() {
                    candidates.extend(
                        approvers
                            .iter()
                            .find(|entry| entry.sequence == step + 1)
                            .map(|entry| &entry.approver),
                    );
                    break;
                }
            }
            RuleKind::Percentage { approvers, .. } => {
                candidates.extend(outstanding(approvers, &approved_by));
            }
            RuleKind::SpecificApprover { designated } => candidates.extend(designated),
            RuleKind::Hybrid { designated, approvers, .. } => {
                candidates.extend(designated);
                candidates.extend(outstanding(approvers, &approved_by));
            }
        }
    }

    let mut seen = HashSet::new();
    candidates.into_iter().filter(|user| seen.insert(*user)).cloned().collect()
}

fn outstanding<'a>(
    approvers: &'a [SequencedApprover],
    approved_by: &'a HashSet<&'a UserId>,
) -> impl Iterator<Item = &'a UserId> + 'a {
    approvers
        .iter()
        .map(|entry| &entry.approver)
        .filter(move |approver| !approved_by.contains(approver))
}

#[cfg(test)]
mod tests {
    use super::pending_approvers;
    use crate::approvals::fixtures::{approve, claim, profile, rule, sequence, users};
    use crate::domain::expense::ExpenseStatus;
    use crate::domain::rule::RuleKind;

    #[test]
    fn gated_claim_waits_on_manager_only() {
        let rules = [rule("cfo", RuleKind::SpecificApprover { designated: users(&["u-cfo"]) })];

        assert_eq!(
            pending_approvers(&claim(100), &rules, &profile(Some("u-mgr"), true)),
            users(&["u-mgr"])
        );
    }

    #[test]
    fn in_progress_sequential_rule_names_next_approver_and_stops() {
        let rules = [
            rule("seq", RuleKind::Sequential { approvers: sequence(&["u-a", "u-b"]) }),
            rule("cfo", RuleKind::SpecificApprover { designated: users(&["u-cfo"]) }),
        ];
        let mut claim = claim(100);
        approve(&mut claim, "u-a");
        claim.current_approver_step = 1;

        assert_eq!(pending_approvers(&claim, &rules, &profile(None, false)), users(&["u-b"]));
    }

    #[test]
    fn quorum_and_designated_approvers_are_merged_without_duplicates() {
        let rules = [
            rule(
                "quorum",
                RuleKind::Percentage {
                    approvers: sequence(&["u-a", "u-b", "u-cfo"]),
                    percentage_required: 100,
                },
            ),
            rule(
                "hybrid",
                RuleKind::Hybrid {
                    designated: users(&["u-cfo"]),
                    approvers: sequence(&["u-a", "u-d"]),
                    percentage_required: Some(50),
                },
            ),
        ];
        let mut claim = claim(100);
        approve(&mut claim, "u-a");

        assert_eq!(
            pending_approvers(&claim, &rules, &profile(None, false)),
            users(&["u-b", "u-cfo", "u-d"])
        );
    }

    #[test]
    fn terminal_claims_have_nobody_pending() {
        let mut claim = claim(100);
        claim.status = ExpenseStatus::Rejected;

        assert!(pending_approvers(&claim, &[], &profile(Some("u-mgr"), true)).is_empty());
    }
}
