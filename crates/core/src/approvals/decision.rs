use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::authorization::{authority, DecisionAuthority};
use crate::approvals::engine::{evaluate, Evaluation};
use crate::domain::expense::{ApprovalAction, ExpenseClaim, ExpenseId, ExpenseStatus, LedgerEntry};
use crate::domain::identity::{Actor, ClaimantProfile, UserId};
use crate::domain::rule::ApprovalRule;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub actor: Actor,
    pub action: ApprovalAction,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// How a decision settled the claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPath {
    ManagerGateRejected,
    ManagerGateApproved,
    Rejected,
    RulesEvaluated,
}

impl DecisionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManagerGateRejected => "manager_gate_rejected",
            Self::ManagerGateApproved => "manager_gate_approved",
            Self::Rejected => "rejected",
            Self::RulesEvaluated => "rules_evaluated",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub claim: ExpenseClaim,
    pub previous_status: ExpenseStatus,
    pub authority: DecisionAuthority,
    /// Present when the rules were consulted.
    pub evaluation: Option<Evaluation>,
    pub path: DecisionPath,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecisionError {
    #[error("expense `{}` is already {}", .claim_id.0, .status.as_str())]
    AlreadyProcessed { claim_id: ExpenseId, status: ExpenseStatus },
    #[error("user `{}` is not authorized to decide on expense `{}`", .actor_id.0, .claim_id.0)]
    AuthorizationDenied { actor_id: UserId, claim_id: ExpenseId },
    #[error(
        "manager `{}` must approve before `{}` can act",
        .manager_id.0,
        .actor_id.0
    )]
    ManagerApprovalRequired { manager_id: UserId, actor_id: UserId },
    #[error("invalid expense transition from {} to {}", .from.as_str(), .to.as_str())]
    InvalidTransition { from: ExpenseStatus, to: ExpenseStatus },
}

/// Records one approve/reject decision against a claim.
///
/// Works on a copy: the caller's claim is left untouched on every error, and
/// the returned claim carries the new ledger entry, step and status for the
/// caller to persist.
pub fn apply_decision(
    claim: &ExpenseClaim,
    request: DecisionRequest,
    rules: &[ApprovalRule],
    profile: &ClaimantProfile,
) -> Result<DecisionOutcome, DecisionError> {
    if claim.is_terminal() {
        return Err(DecisionError::AlreadyProcessed {
            claim_id: claim.id.clone(),
            status: claim.status,
        });
    }

    let granted = authority(&request.actor, claim, rules, profile).ok_or_else(|| {
        DecisionError::AuthorizationDenied {
            actor_id: request.actor.id.clone(),
            claim_id: claim.id.clone(),
        }
    })?;

    let gating_manager = profile.gating_manager().filter(|_| claim.current_approver_step == 0);
    if let Some(manager_id) = gating_manager {
        if *manager_id != request.actor.id {
            return Err(DecisionError::ManagerApprovalRequired {
                manager_id: manager_id.clone(),
                actor_id: request.actor.id.clone(),
            });
        }
    }

    let previous_status = claim.status;
    let mut working = claim.clone();
    let action = request.action;
    working.record(LedgerEntry {
        approver_id: request.actor.id,
        action,
        comment: request.comment,
        recorded_at: request.decided_at,
    });

    let (path, evaluation) = match (gating_manager.is_some(), action) {
        (true, ApprovalAction::Rejected) => (DecisionPath::ManagerGateRejected, None),
        (false, ApprovalAction::Rejected) => (DecisionPath::Rejected, None),
        (gated, ApprovalAction::Approved) => {
            if gated {
                working.current_approver_step = 1;
            }
            let evaluation = evaluate(&working, rules);
            working.current_approver_step = evaluation.next_step;
            let path =
                if gated { DecisionPath::ManagerGateApproved } else { DecisionPath::RulesEvaluated };
            (path, Some(evaluation))
        }
    };

    let next_status = evaluation.as_ref().map_or(ExpenseStatus::Rejected, |e| e.status);
    if !working.can_transition_to(next_status) {
        return Err(DecisionError::InvalidTransition { from: working.status, to: next_status });
    }
    working.status = next_status;

    Ok(DecisionOutcome { claim: working, previous_status, authority: granted, evaluation, path })
}
