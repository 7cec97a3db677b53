//! Approval decision engine.
//!
//! Everything in here is pure: callers load rules and identity facts, hand
//! them in, and persist whatever comes back.

pub mod authorization;
pub mod decision;
pub mod engine;
pub mod routing;

pub use authorization::{authority, authorize, DecisionAuthority};
pub use decision::{apply_decision, DecisionError, DecisionOutcome, DecisionPath, DecisionRequest};
pub use engine::{evaluate, ConfigurationInconsistency, Evaluation};
pub use routing::pending_approvers;

use crate::domain::expense::ExpenseClaim;
use crate::domain::rule::ApprovalRule;

/// Rules of the claim's organization that are active and cover its converted
/// amount, in the order given.
pub fn applicable_rules<'a>(
    rules: &'a [ApprovalRule],
    claim: &'a ExpenseClaim,
) -> impl Iterator<Item = &'a ApprovalRule> + 'a {
    rules.iter().filter(move |rule| {
        rule.organization_id == claim.organization_id && rule.applies_to(claim.converted_amount)
    })
}
