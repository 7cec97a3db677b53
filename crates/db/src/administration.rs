use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use claimflow_core::audit::{AuditContext, AuditDetail, AuditSink, RuleSummary};
use claimflow_core::domain::identity::OrganizationId;
use claimflow_core::domain::rule::{ApprovalRule, ApprovalRuleDraft, RuleId, RuleUpdate};
use claimflow_core::errors::ApplicationError;

use crate::repositories::ApprovalRuleRepository;

/// Rule CRUD for organization administrators. Every write is validated before
/// it reaches storage and leaves an audit event behind.
pub struct RuleAdministration {
    rules: Arc<dyn ApprovalRuleRepository>,
    audit: Arc<dyn AuditSink>,
}

impl RuleAdministration {
    pub fn new(rules: Arc<dyn ApprovalRuleRepository>, audit: Arc<dyn AuditSink>) -> Self {
        Self { rules, audit }
    }

    pub async fn create(
        &self,
        organization_id: OrganizationId,
        draft: ApprovalRuleDraft,
        actor: &str,
        correlation_id: &str,
    ) -> Result<ApprovalRule, ApplicationError> {
        let id = RuleId(format!("rule-{}", Uuid::new_v4()));
        let rule = match draft.build(id, organization_id.clone(), Utc::now()) {
            Ok(rule) => rule,
            Err(error) => {
                self.audit.emit(AuditContext::new(None, correlation_id, actor).record(
                    AuditDetail::RuleCreateRefused { organization_id, error: error.to_string() },
                ));
                return Err(error.into());
            }
        };
        self.rules.save(rule.clone()).await?;

        self.record(AuditDetail::RuleCreated(RuleSummary::from(&rule)), &rule, actor, correlation_id);
        Ok(rule)
    }

    pub async fn update(
        &self,
        rule_id: &RuleId,
        update: RuleUpdate,
        actor: &str,
        correlation_id: &str,
    ) -> Result<ApprovalRule, ApplicationError> {
        let mut rule = self.find(rule_id).await?;
        rule.apply_update(update, Utc::now())?;
        self.rules.save(rule.clone()).await?;

        self.record(AuditDetail::RuleUpdated(RuleSummary::from(&rule)), &rule, actor, correlation_id);
        Ok(rule)
    }

    /// Replaces every editable field with the draft's values.
    pub async fn redefine(
        &self,
        rule_id: &RuleId,
        draft: ApprovalRuleDraft,
        actor: &str,
        correlation_id: &str,
    ) -> Result<ApprovalRule, ApplicationError> {
        let update = RuleUpdate {
            name: Some(draft.name.trim().to_string()),
            amount_threshold: Some(draft.amount_threshold.clone()),
            is_active: Some(draft.is_active),
            kind: Some(draft.into_kind()?),
        };
        self.update(rule_id, update, actor, correlation_id).await
    }

    pub async fn delete(
        &self,
        rule_id: &RuleId,
        actor: &str,
        correlation_id: &str,
    ) -> Result<(), ApplicationError> {
        if !self.rules.delete(rule_id).await? {
            return Err(ApplicationError::NotFound(format!("rule `{rule_id}`")));
        }

        info!(
            event_name = "rule.deleted",
            correlation_id = %correlation_id,
            rule_id = %rule_id,
            actor,
            "approval rule deleted"
        );
        self.audit.emit(
            AuditContext::new(None, correlation_id, actor)
                .record(AuditDetail::RuleDeleted { rule_id: rule_id.clone() }),
        );
        Ok(())
    }

    pub async fn list(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<ApprovalRule>, ApplicationError> {
        Ok(self.rules.list(organization_id).await?)
    }

    /// Active rules whose threshold covers `converted_amount`, in evaluation order.
    pub async fn list_applicable(
        &self,
        organization_id: &OrganizationId,
        converted_amount: Decimal,
    ) -> Result<Vec<ApprovalRule>, ApplicationError> {
        Ok(self.rules.list_active(organization_id, converted_amount).await?)
    }

    async fn find(&self, rule_id: &RuleId) -> Result<ApprovalRule, ApplicationError> {
        self.rules
            .find_by_id(rule_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("rule `{rule_id}`")))
    }

    fn record(&self, detail: AuditDetail, rule: &ApprovalRule, actor: &str, correlation_id: &str) {
        info!(
            event_name = detail.event_type(),
            correlation_id = %correlation_id,
            rule_id = %rule.id,
            organization_id = %rule.organization_id,
            rule_type = rule.rule_type().as_str(),
            is_active = rule.is_active,
            actor,
            "approval rule saved"
        );
        self.audit.emit(AuditContext::new(None, correlation_id, actor).record(detail));
    }
}
