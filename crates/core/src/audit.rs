//! Audit trail for approval decisions and rule administration.
//!
//! Each event carries a typed [`AuditDetail`]; its variant fixes the event
//! type, category and outcome so emitters cannot disagree on them.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approvals::{ConfigurationInconsistency, DecisionError, DecisionPath};
use crate::domain::expense::{ApprovalAction, ExpenseId, ExpenseStatus};
use crate::domain::identity::OrganizationId;
use crate::domain::rule::{ApprovalRule, RuleId, RuleType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCategory {
    Decision,
    RuleAdministration,
    Persistence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failed,
}

/// Why a decision was turned away before anything was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    AlreadyProcessed,
    AuthorizationDenied,
    ManagerApprovalRequired,
    InvalidTransition,
}

impl From<&DecisionError> for RefusalReason {
    fn from(error: &DecisionError) -> Self {
        match error {
            DecisionError::AlreadyProcessed { .. } => Self::AlreadyProcessed,
            DecisionError::AuthorizationDenied { .. } => Self::AuthorizationDenied,
            DecisionError::ManagerApprovalRequired { .. } => Self::ManagerApprovalRequired,
            DecisionError::InvalidTransition { .. } => Self::InvalidTransition,
        }
    }
}

impl RefusalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyProcessed => "already_processed",
            Self::AuthorizationDenied => "authorization_denied",
            Self::ManagerApprovalRequired => "manager_approval_required",
            Self::InvalidTransition => "invalid_transition",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub rule_id: RuleId,
    pub organization_id: OrganizationId,
    pub rule_type: RuleType,
    pub is_active: bool,
}

impl From<&ApprovalRule> for RuleSummary {
    fn from(rule: &ApprovalRule) -> Self {
        Self {
            rule_id: rule.id.clone(),
            organization_id: rule.organization_id.clone(),
            rule_type: rule.rule_type(),
            is_active: rule.is_active,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditDetail {
    #[serde(rename = "approval.decision_recorded")]
    DecisionRecorded {
        action: ApprovalAction,
        path: DecisionPath,
        from: ExpenseStatus,
        to: ExpenseStatus,
        step: u32,
        /// Rule that settled the evaluation, when rules ran and one did.
        decided_by: Option<RuleId>,
        attempts: u32,
    },
    #[serde(rename = "approval.decision_refused")]
    DecisionRefused { reason: RefusalReason, message: String },
    #[serde(rename = "approval.decision_persist_failed")]
    DecisionPersistFailed { attempts: u32, error: String },
    #[serde(rename = "approval.configuration_inconsistency")]
    ConfigurationInconsistency(ConfigurationInconsistency),
    #[serde(rename = "rule.created")]
    RuleCreated(RuleSummary),
    #[serde(rename = "rule.updated")]
    RuleUpdated(RuleSummary),
    #[serde(rename = "rule.deleted")]
    RuleDeleted { rule_id: RuleId },
    #[serde(rename = "rule.create_refused")]
    RuleCreateRefused { organization_id: OrganizationId, error: String },
}

impl AuditDetail {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DecisionRecorded { .. } => "approval.decision_recorded",
            Self::DecisionRefused { .. } => "approval.decision_refused",
            Self::DecisionPersistFailed { .. } => "approval.decision_persist_failed",
            Self::ConfigurationInconsistency(_) => "approval.configuration_inconsistency",
            Self::RuleCreated(_) => "rule.created",
            Self::RuleUpdated(_) => "rule.updated",
            Self::RuleDeleted { .. } => "rule.deleted",
            Self::RuleCreateRefused { .. } => "rule.create_refused",
        }
    }

    pub fn category(&self) -> AuditCategory {
        match self {
            Self::DecisionRecorded { .. }
            | Self::DecisionRefused { .. }
            | Self::ConfigurationInconsistency(_) => AuditCategory::Decision,
            Self::DecisionPersistFailed { .. } => AuditCategory::Persistence,
            Self::RuleCreated(_)
            | Self::RuleUpdated(_)
            | Self::RuleDeleted { .. }
            | Self::RuleCreateRefused { .. } => AuditCategory::RuleAdministration,
        }
    }

    pub fn outcome(&self) -> AuditOutcome {
        match self {
            Self::DecisionRefused { .. } | Self::RuleCreateRefused { .. } => AuditOutcome::Rejected,
            Self::DecisionPersistFailed { .. } | Self::ConfigurationInconsistency(_) => {
                AuditOutcome::Failed
            }
            Self::DecisionRecorded { .. }
            | Self::RuleCreated(_)
            | Self::RuleUpdated(_)
            | Self::RuleDeleted { .. } => AuditOutcome::Success,
        }
    }
}

/// Who is acting, on which claim, under which request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub claim_id: Option<ExpenseId>,
    pub correlation_id: String,
    pub actor: String,
}

impl AuditContext {
    pub fn new(
        claim_id: Option<ExpenseId>,
        correlation_id: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self { claim_id, correlation_id: correlation_id.into(), actor: actor.into() }
    }

    pub fn record(&self, detail: AuditDetail) -> AuditEvent {
        AuditEvent {
            event_id: Uuid::new_v4().to_string(),
            claim_id: self.claim_id.clone(),
            correlation_id: self.correlation_id.clone(),
            actor: self.actor.clone(),
            category: detail.category(),
            outcome: detail.outcome(),
            detail,
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub claim_id: Option<ExpenseId>,
    pub correlation_id: String,
    pub actor: String,
    pub category: AuditCategory,
    pub outcome: AuditOutcome,
    pub detail: AuditDetail,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn event_type(&self) -> &'static str {
        self.detail.event_type()
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|event| event.event_type() == event_type).collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
