use serde::{Deserialize, Serialize};

use crate::approvals::applicable_rules;
use crate::domain::expense::ExpenseClaim;
use crate::domain::identity::{Actor, ClaimantProfile, Role};
use crate::domain::rule::{ApprovalRule, RuleId, RuleKind};

/// Why an actor is allowed to record a decision on a claim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionAuthority {
    Administrator,
    DirectManager,
    RuleApprover { rule_id: RuleId },
}

/// Resolves the actor's entitlement to act on the claim. This is eligibility
/// only; whether it is the actor's turn is left to evaluation.
pub fn authority(
    actor: &Actor,
    claim: &ExpenseClaim,
    rules: &[ApprovalRule],
    profile: &ClaimantProfile,
) -> Option<DecisionAuthority> {
    if actor.is_admin() {
        return Some(DecisionAuthority::Administrator);
    }

    if actor.role == Role::Manager && profile.is_managed_by(&actor.id) {
        return Some(DecisionAuthority::DirectManager);
    }

    applicable_rules(rules, claim)
        .find(|rule| rule_names(rule, actor))
        .map(|rule| DecisionAuthority::RuleApprover { rule_id: rule.id.clone() })
}

pub fn authorize(
    actor: &Actor,
    claim: &ExpenseClaim,
    rules: &[ApprovalRule],
    profile: &ClaimantProfile,
) -> bool {
    authority(actor, claim, rules, profile).is_some()
}

// Percentage approvers are counted toward quorum but get no entitlement here.
fn rule_names(rule: &ApprovalRule, actor: &Actor) -> bool {
    match &rule.kind {
        RuleKind::Sequential { approvers } => {
            approvers.iter().any(|entry| entry.approver == actor.id)
        }
        RuleKind::SpecificApprover { designated } | RuleKind::Hybrid { designated, .. } => {
            designated.contains(&actor.id)
        }
        RuleKind::Percentage { .. } => false,
    }
}
