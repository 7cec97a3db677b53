//! Decision boundary: loads claim, rules and identities, runs the pure
//! engine, and persists the result under a per-claim lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use claimflow_core::approvals::{
    applicable_rules, apply_decision, evaluate, pending_approvers, DecisionAuthority, DecisionError, DecisionPath,
    DecisionRequest, Evaluation,
};
use claimflow_core::audit::{AuditContext, AuditDetail, AuditSink, RefusalReason};
use claimflow_core::config::ApprovalsConfig;
use claimflow_core::domain::currency::CurrencyConverter;
use claimflow_core::domain::expense::{
    ApprovalAction, ExpenseClaim, ExpenseId, ExpenseRevision, ExpenseStatus, NewExpense,
};
use claimflow_core::domain::identity::{Actor, ClaimantProfile, UserId};
use claimflow_core::domain::rule::ApprovalRule;
use claimflow_core::errors::ApplicationError;

use crate::repositories::{
    ApprovalRuleRepository, ExpenseRepository, IdentityRepository, RepositoryError,
};

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Conflict { .. } => Self::Conflict(value.to_string()),
            RepositoryError::Database(_) | RepositoryError::Decode(_) => {
                Self::Persistence(value.to_string())
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct DecisionCommand {
    pub claim_id: ExpenseId,
    pub actor_id: UserId,
    pub action: ApprovalAction,
    pub comment: Option<String>,
    pub correlation_id: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct DecisionReceipt {
    pub claim: ExpenseClaim,
    pub previous_status: ExpenseStatus,
    pub path: DecisionPath,
    pub authority: DecisionAuthority,
    pub evaluation: Option<Evaluation>,
    pub pending_approvers: Vec<UserId>,
    pub attempts: u32,
}

/// Read-only view of where a claim stands right now.
#[derive(Clone, Debug, Serialize)]
pub struct ClaimAssessment {
    pub claim: ExpenseClaim,
    pub rules_considered: usize,
    pub evaluation: Evaluation,
    pub pending_approvers: Vec<UserId>,
}

type ClaimLocks = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Exclusive hold on one claim. Dropping it removes the claim's entry from the
/// lock table unless another caller is holding or waiting on it.
struct ClaimGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    claim_id: String,
    locks: &'a ClaimLocks,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_entry(self.locks, &self.claim_id, &self.lock);
    }
}

/// `lock` is the caller's handle; the table holds the only other one when
/// nobody else is interested in the claim.
fn release_entry(locks: &ClaimLocks, claim_id: &str, lock: &Arc<Mutex<()>>) {
    let mut locks = locks.lock().unwrap_or_else(PoisonError::into_inner);
    let ours = locks.get(claim_id).is_some_and(|current| Arc::ptr_eq(current, lock));
    if ours && Arc::strong_count(lock) == 2 {
        locks.remove(claim_id);
    }
}

struct Snapshot {
    claim: ExpenseClaim,
    claimant: ClaimantProfile,
    rules: Vec<ApprovalRule>,
}

pub struct DecisionWorkflow {
    rules: Arc<dyn ApprovalRuleRepository>,
    identities: Arc<dyn IdentityRepository>,
    expenses: Arc<dyn ExpenseRepository>,
    audit: Arc<dyn AuditSink>,
    settings: ApprovalsConfig,
    claim_locks: ClaimLocks,
}

impl DecisionWorkflow {
    pub fn new(
        rules: Arc<dyn ApprovalRuleRepository>,
        identities: Arc<dyn IdentityRepository>,
        expenses: Arc<dyn ExpenseRepository>,
        audit: Arc<dyn AuditSink>,
        settings: ApprovalsConfig,
    ) -> Self {
        Self { rules, identities, expenses, audit, settings, claim_locks: ClaimLocks::default() }
    }

    /// Records one decision. Decisions on the same claim are serialized, and a
    /// write that loses an optimistic version race is recomputed from a fresh
    /// snapshot up to `max_conflict_retries` times.
    pub async fn decide(&self, command: DecisionCommand) -> Result<DecisionReceipt, ApplicationError> {
        let context = AuditContext::new(
            Some(command.claim_id.clone()),
            command.correlation_id.clone(),
            command.actor_id.0.clone(),
        );
        let _guard = self.lock_claim(&command.claim_id).await?;

        let actor = self.resolve_actor(&command.actor_id).await?;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let snapshot = self.snapshot(&command.claim_id).await?;
            let request = DecisionRequest {
                actor: actor.clone(),
                action: command.action,
                comment: command.comment.clone(),
                decided_at: Utc::now(),
            };

            let outcome =
                match apply_decision(&snapshot.claim, request, &snapshot.rules, &snapshot.claimant) {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        self.report_refusal(&context, &command, &error);
                        return Err(error.into());
                    }
                };

            if let Some(evaluation) = &outcome.evaluation {
                self.report_inconsistencies(&context, evaluation);
            }

            let expected_version = snapshot.claim.version;
            match self.expenses.save_decision(outcome.claim.clone(), expected_version).await {
                Ok(stored) => {
                    info!(
                        event_name = "approval.decision_recorded",
                        correlation_id = %command.correlation_id,
                        claim_id = %stored.id,
                        actor_id = %command.actor_id,
                        action = command.action.as_str(),
                        path = outcome.path.as_str(),
                        from = outcome.previous_status.as_str(),
                        to = stored.status.as_str(),
                        step = stored.current_approver_step,
                        attempts,
                        "approval decision recorded"
                    );
                    self.audit.emit(context.record(AuditDetail::DecisionRecorded {
                        action: command.action,
                        path: outcome.path,
                        from: outcome.previous_status,
                        to: stored.status,
                        step: stored.current_approver_step,
                        decided_by: outcome
                            .evaluation
                            .as_ref()
                            .and_then(|evaluation| evaluation.decided_by.clone()),
                        attempts,
                    }));

                    let pending_approvers =
                        pending_approvers(&stored, &snapshot.rules, &snapshot.claimant);
                    return Ok(DecisionReceipt {
                        claim: stored,
                        previous_status: outcome.previous_status,
                        path: outcome.path,
                        authority: outcome.authority,
                        evaluation: outcome.evaluation,
                        pending_approvers,
                        attempts,
                    });
                }
                Err(RepositoryError::Conflict { .. })
                    if attempts <= self.settings.max_conflict_retries =>
                {
                    debug!(
                        event_name = "approval.decision_retry",
                        correlation_id = %command.correlation_id,
                        claim_id = %command.claim_id,
                        expected_version,
                        attempts,
                        "claim changed during decision, recomputing"
                    );
                }
                Err(error) => {
                    let error = ApplicationError::from(error);
                    warn!(
                        event_name = "approval.decision_persist_failed",
                        correlation_id = %command.correlation_id,
                        claim_id = %command.claim_id,
                        attempts,
                        error = %error,
                        "approval decision could not be persisted"
                    );
                    self.audit.emit(context.record(AuditDetail::DecisionPersistFailed {
                        attempts,
                        error: error.to_string(),
                    }));
                    return Err(error);
                }
            }
        }
    }

    /// Evaluates a claim against its current rules without recording anything.
    pub async fn assess(&self, claim_id: &ExpenseId) -> Result<ClaimAssessment, ApplicationError> {
        let snapshot = self.snapshot(claim_id).await?;
        let evaluation = evaluate(&snapshot.claim, &snapshot.rules);
        let pending_approvers = pending_approvers(&snapshot.claim, &snapshot.rules, &snapshot.claimant);

        Ok(ClaimAssessment {
            rules_considered: applicable_rules(&snapshot.rules, &snapshot.claim).count(),
            claim: snapshot.claim,
            evaluation,
            pending_approvers,
        })
    }

    /// Creates a pending claim in the default base currency.
    pub async fn submit<C>(
        &self,
        new: NewExpense,
        converter: &C,
        correlation_id: &str,
    ) -> Result<ExpenseClaim, ApplicationError>
    where
        C: CurrencyConverter + Sync + ?Sized,
    {
        let claimant = self
            .identities
            .find_profile(&new.claimant_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("user `{}`", new.claimant_id)))?;
        if claimant.organization_id != new.organization_id {
            return Err(ApplicationError::NotFound(format!(
                "user `{}` in organization `{}`",
                new.claimant_id, new.organization_id
            )));
        }

        let claim =
            ExpenseClaim::submit(new, &self.settings.default_base_currency, converter, Utc::now())?;
        self.expenses.insert(claim.clone()).await?;

        info!(
            event_name = "expense.submitted",
            correlation_id = %correlation_id,
            claim_id = %claim.id,
            claimant_id = %claim.claimant_id,
            converted_amount = %claim.converted_amount,
            base_currency = %claim.base_currency,
            "expense claim submitted"
        );
        Ok(claim)
    }

    /// Edits a claim nobody has acted on yet. Shares the per-claim lock with
    /// decisions so a revision cannot interleave with one.
    pub async fn revise<C>(
        &self,
        claim_id: &ExpenseId,
        revision: ExpenseRevision,
        converter: &C,
        correlation_id: &str,
    ) -> Result<ExpenseClaim, ApplicationError>
    where
        C: CurrencyConverter + Sync + ?Sized,
    {
        let _guard = self.lock_claim(claim_id).await?;
        let mut claim = self.load_claim(claim_id).await?;
        let expected_version = claim.version;
        claim.revise(revision, converter, Utc::now())?;
        let stored = self.expenses.save_revision(claim, expected_version).await?;

        info!(
            event_name = "expense.revised",
            correlation_id = %correlation_id,
            claim_id = %stored.id,
            converted_amount = %stored.converted_amount,
            "expense claim revised"
        );
        Ok(stored)
    }

    async fn lock_claim(&self, claim_id: &ExpenseId) -> Result<ClaimGuard<'_>, ApplicationError> {
        let lock = {
            let mut locks = self.claim_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(claim_id.0.clone()).or_default())
        };

        let wait = Duration::from_secs(self.settings.decision_timeout_secs);
        match tokio::time::timeout(wait, Arc::clone(&lock).lock_owned()).await {
            Ok(guard) => Ok(ClaimGuard {
                guard: Some(guard),
                lock,
                claim_id: claim_id.0.clone(),
                locks: &self.claim_locks,
            }),
            Err(_) => {
                release_entry(&self.claim_locks, &claim_id.0, &lock);
                Err(ApplicationError::Conflict(format!(
                    "timed out after {}s waiting for another decision on expense `{claim_id}`",
                    self.settings.decision_timeout_secs
                )))
            }
        }
    }

    async fn resolve_actor(&self, actor_id: &UserId) -> Result<Actor, ApplicationError> {
        let profile = self
            .identities
            .find_profile(actor_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("user `{actor_id}`")))?;
        Ok(profile.actor())
    }

    async fn load_claim(&self, claim_id: &ExpenseId) -> Result<ExpenseClaim, ApplicationError> {
        self.expenses
            .find_by_id(claim_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("expense `{claim_id}`")))
    }

    async fn snapshot(&self, claim_id: &ExpenseId) -> Result<Snapshot, ApplicationError> {
        let claim = self.load_claim(claim_id).await?;
        let claimant = self
            .identities
            .find_profile(&claim.claimant_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("user `{}`", claim.claimant_id)))?;
        // Whole rule set: an organization with active rules that all miss the
        // amount must not auto-approve.
        let rules = self.rules.list(&claim.organization_id).await?;

        Ok(Snapshot { claim, claimant, rules })
    }

    fn report_refusal(&self, context: &AuditContext, command: &DecisionCommand, error: &DecisionError) {
        let reason = RefusalReason::from(error);
        warn!(
            event_name = "approval.decision_refused",
            correlation_id = %command.correlation_id,
            claim_id = %command.claim_id,
            actor_id = %command.actor_id,
            reason = reason.as_str(),
            error = %error,
            "approval decision refused"
        );
        self.audit.emit(
            context.record(AuditDetail::DecisionRefused { reason, message: error.to_string() }),
        );
    }

    fn report_inconsistencies(&self, context: &AuditContext, evaluation: &Evaluation) {
        for inconsistency in &evaluation.inconsistencies {
            warn!(
                event_name = "approval.configuration_inconsistency",
                correlation_id = %context.correlation_id,
                rule_id = %inconsistency.rule_id,
                expected_sequence = inconsistency.expected_sequence,
                approver_count = inconsistency.approver_count,
                "sequential rule has no approver for the expected step; claim held pending"
            );
            self.audit.emit(context.record(AuditDetail::ConfigurationInconsistency(
                inconsistency.clone(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;

    use claimflow_core::approvals::{DecisionError, DecisionPath};
    use claimflow_core::audit::{AuditDetail, AuditOutcome, InMemoryAuditSink, RefusalReason};
    use claimflow_core::config::ApprovalsConfig;
    use claimflow_core::domain::currency::StaticRateConverter;
    use claimflow_core::domain::expense::{
        ApprovalAction, ExpenseCategory, ExpenseClaim, ExpenseId, ExpenseRevision, ExpenseStatus,
        NewExpense,
    };
    use claimflow_core::domain::identity::{ClaimantProfile, OrganizationId, Role, UserId};
    use claimflow_core::domain::rule::{
        AmountThreshold, ApprovalRule, RuleId, RuleKind, SequencedApprover,
    };
    use claimflow_core::errors::{ApplicationError, DomainError};

    use super::{DecisionCommand, DecisionWorkflow};
    use crate::repositories::{
        ExpenseRepository, IdentityRepository, InMemoryApprovalRuleRepository,
        InMemoryExpenseRepository, InMemoryIdentityRepository, RepositoryError,
    };

    /// Fails the first decision write as if another writer got there first.
    struct RacingExpenses {
        inner: InMemoryExpenseRepository,
        lose_next: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ExpenseRepository for RacingExpenses {
        async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<ExpenseClaim>, RepositoryError> {
            self.inner.find_by_id(id).await
        }

        async fn insert(&self, claim: ExpenseClaim) -> Result<(), RepositoryError> {
            self.inner.insert(claim).await
        }

        async fn save_decision(
            &self,
            claim: ExpenseClaim,
            expected_version: u32,
        ) -> Result<ExpenseClaim, RepositoryError> {
            if self.lose_next.swap(false, Ordering::SeqCst) {
                return Err(RepositoryError::Conflict { expense_id: claim.id, expected_version });
            }
            self.inner.save_decision(claim, expected_version).await
        }

        async fn save_revision(
            &self,
            claim: ExpenseClaim,
            expected_version: u32,
        ) -> Result<ExpenseClaim, RepositoryError> {
            self.inner.save_revision(claim, expected_version).await
        }

        async fn list_pending(
            &self,
            organization_id: &OrganizationId,
        ) -> Result<Vec<ExpenseClaim>, RepositoryError> {
            self.inner.list_pending(organization_id).await
        }
    }

    struct Harness {
        workflow: Arc<DecisionWorkflow>,
        expenses: Arc<dyn ExpenseRepository>,
        audit: InMemoryAuditSink,
    }

    fn profile(id: &str, role: Role, manager: Option<&str>, mandatory: bool) -> ClaimantProfile {
        ClaimantProfile {
            user_id: UserId(id.to_string()),
            organization_id: OrganizationId("org-1".to_string()),
            role,
            manager_id: manager.map(|manager| UserId(manager.to_string())),
            mandatory_manager_approval: mandatory,
        }
    }

    fn rule(id: &str, kind: RuleKind) -> ApprovalRule {
        let created_at = Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).single().expect("timestamp");
        ApprovalRule {
            id: RuleId(id.to_string()),
            organization_id: OrganizationId("org-1".to_string()),
            name: id.to_string(),
            kind,
            amount_threshold: None,
            is_active: true,
            created_at,
            updated_at: created_at,
        }
    }

    fn new_expense(id: &str) -> NewExpense {
        NewExpense {
            id: ExpenseId(id.to_string()),
            claimant_id: UserId("u-emp".to_string()),
            organization_id: OrganizationId("org-1".to_string()),
            amount: Decimal::new(250, 0),
            currency: "EUR".to_string(),
            category: ExpenseCategory::Travel,
            description: "Conference train".to_string(),
            merchant: None,
            expense_date: NaiveDate::from_ymd_opt(2026, 3, 9).expect("date"),
        }
    }

    fn converter() -> StaticRateConverter {
        StaticRateConverter::default().with_rate("EUR", "USD", Decimal::new(110, 2))
    }

    async fn harness(
        rules: Vec<ApprovalRule>,
        mandatory_gate: bool,
        expenses: Arc<dyn ExpenseRepository>,
    ) -> Harness {
        let settings = ApprovalsConfig { decision_timeout_secs: 5, ..ApprovalsConfig::default() };
        harness_with(rules, mandatory_gate, expenses, settings).await
    }

    async fn harness_with(
        rules: Vec<ApprovalRule>,
        mandatory_gate: bool,
        expenses: Arc<dyn ExpenseRepository>,
        settings: ApprovalsConfig,
    ) -> Harness {
        let identities = Arc::new(InMemoryIdentityRepository::default());
        for profile in [
            profile("u-emp", Role::Employee, Some("u-mgr"), mandatory_gate),
            profile("u-mgr", Role::Manager, None, false),
            profile("u-a", Role::Employee, None, false),
            profile("u-b", Role::Employee, None, false),
            profile("u-c", Role::Employee, None, false),
            profile("u-cfo", Role::Employee, None, false),
            profile("u-admin", Role::Admin, None, false),
        ] {
            identities.save_profile(profile).await.expect("profile");
        }

        let audit = InMemoryAuditSink::default();
        let workflow = DecisionWorkflow::new(
            Arc::new(InMemoryApprovalRuleRepository::with_rules(rules)),
            identities,
            expenses.clone(),
            Arc::new(audit.clone()),
            settings,
        );
        Harness { workflow: Arc::new(workflow), expenses, audit }
    }

    fn command(claim: &str, actor: &str, action: ApprovalAction) -> DecisionCommand {
        DecisionCommand {
            claim_id: ExpenseId(claim.to_string()),
            actor_id: UserId(actor.to_string()),
            action,
            comment: None,
            correlation_id: format!("req-{actor}"),
        }
    }

    #[tokio::test]
    async fn submit_converts_into_default_base_currency() {
        let harness = harness(Vec::new(), false, Arc::new(InMemoryExpenseRepository::default())).await;

        let claim = harness
            .workflow
            .submit(new_expense("EXP-1"), &converter(), "req-submit")
            .await
            .expect("submit");

        assert_eq!(claim.base_currency, "USD");
        assert_eq!(claim.converted_amount, Decimal::new(27500, 2));
        let stored = harness.expenses.find_by_id(&claim.id).await.expect("find");
        assert_eq!(stored, Some(claim));
    }

    #[tokio::test]
    async fn manager_gate_then_sequential_chain_approves() {
        let harness = harness(
            vec![rule(
                "R-seq",
                RuleKind::Sequential {
                    approvers: vec![
                        SequencedApprover::new("u-a", 1),
                        SequencedApprover::new("u-b", 2),
                    ],
                },
            )],
            true,
            Arc::new(InMemoryExpenseRepository::default()),
        )
        .await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");

        let early = harness
            .workflow
            .decide(command("EXP-1", "u-a", ApprovalAction::Approved))
            .await
            .expect_err("gate is still closed");
        assert!(matches!(
            early,
            ApplicationError::Domain(DomainError::Decision(
                DecisionError::ManagerApprovalRequired { .. }
            ))
        ));

        let gated = harness
            .workflow
            .decide(command("EXP-1", "u-mgr", ApprovalAction::Approved))
            .await
            .expect("manager approves");
        assert_eq!(gated.path, DecisionPath::ManagerGateApproved);
        assert_eq!(gated.claim.status, ExpenseStatus::Pending);
        assert_eq!(gated.claim.current_approver_step, 1);
        // Step 1 expects sequence 2, so the second approver is next.
        assert_eq!(gated.pending_approvers, vec![UserId("u-b".to_string())]);

        let done = harness
            .workflow
            .decide(command("EXP-1", "u-b", ApprovalAction::Approved))
            .await
            .expect("final approval");
        assert_eq!(done.claim.status, ExpenseStatus::Approved);
        assert_eq!(done.claim.approval_history.len(), 2);
        assert!(done.pending_approvers.is_empty());
        assert_eq!(harness.audit.events_of_type("approval.decision_recorded").len(), 2);
    }

    #[tokio::test]
    async fn refused_decisions_are_audited_and_leave_claim_untouched() {
        let harness = harness(
            vec![rule("R-cfo", RuleKind::SpecificApprover { designated: vec![UserId("u-cfo".into())] })],
            false,
            Arc::new(InMemoryExpenseRepository::default()),
        )
        .await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");

        let error = harness
            .workflow
            .decide(command("EXP-1", "u-c", ApprovalAction::Approved))
            .await
            .expect_err("no authority");
        assert!(matches!(
            error,
            ApplicationError::Domain(DomainError::Decision(DecisionError::AuthorizationDenied { .. }))
        ));

        let refused = harness.audit.events_of_type("approval.decision_refused");
        assert_eq!(refused.len(), 1);
        assert_eq!(refused[0].outcome, AuditOutcome::Rejected);
        assert_eq!(refused[0].correlation_id, "req-u-c");
        assert!(matches!(
            refused[0].detail,
            AuditDetail::DecisionRefused { reason: RefusalReason::AuthorizationDenied, .. }
        ));

        let stored = harness
            .expenses
            .find_by_id(&ExpenseId("EXP-1".to_string()))
            .await
            .expect("find")
            .expect("claim");
        assert_eq!(stored.version, 0);
        assert!(stored.approval_history.is_empty());
    }

    #[tokio::test]
    async fn terminal_claims_refuse_further_decisions() {
        let harness = harness(Vec::new(), false, Arc::new(InMemoryExpenseRepository::default())).await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");

        let rejected = harness
            .workflow
            .decide(command("EXP-1", "u-admin", ApprovalAction::Rejected))
            .await
            .expect("admin rejects");
        assert_eq!(rejected.claim.status, ExpenseStatus::Rejected);
        assert_eq!(rejected.path, DecisionPath::Rejected);

        let error = harness
            .workflow
            .decide(command("EXP-1", "u-admin", ApprovalAction::Approved))
            .await
            .expect_err("already rejected");
        assert!(matches!(
            error,
            ApplicationError::Domain(DomainError::Decision(DecisionError::AlreadyProcessed { .. }))
        ));
    }

    #[tokio::test]
    async fn missing_sequence_step_is_reported_as_inconsistency() {
        // Stored before validation existed: sequence 2 is missing from the chain.
        let harness = harness(
            vec![rule(
                "R-gap",
                RuleKind::Sequential {
                    approvers: vec![
                        SequencedApprover::new("u-a", 1),
                        SequencedApprover::new("u-b", 3),
                    ],
                },
            )],
            true,
            Arc::new(InMemoryExpenseRepository::default()),
        )
        .await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");

        let receipt = harness
            .workflow
            .decide(command("EXP-1", "u-mgr", ApprovalAction::Approved))
            .await
            .expect("manager approves");

        assert_eq!(receipt.claim.status, ExpenseStatus::Pending);
        let evaluation = receipt.evaluation.expect("rules evaluated");
        assert_eq!(evaluation.inconsistencies.len(), 1);
        assert_eq!(evaluation.inconsistencies[0].rule_id, RuleId("R-gap".to_string()));

        let reported = harness.audit.events_of_type("approval.configuration_inconsistency");
        assert_eq!(reported.len(), 1);
        assert!(matches!(
            &reported[0].detail,
            AuditDetail::ConfigurationInconsistency(found) if found.rule_id.0 == "R-gap"
        ));
    }

    #[tokio::test]
    async fn stale_write_is_recomputed_and_retried() {
        let racing = Arc::new(RacingExpenses {
            inner: InMemoryExpenseRepository::default(),
            lose_next: AtomicBool::new(true),
        });
        let harness = harness(Vec::new(), false, racing).await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");

        let receipt = harness
            .workflow
            .decide(command("EXP-1", "u-admin", ApprovalAction::Approved))
            .await
            .expect("retry succeeds");

        assert_eq!(receipt.attempts, 2);
        assert_eq!(receipt.claim.status, ExpenseStatus::Approved);
        assert_eq!(receipt.claim.version, 1);
        assert_eq!(receipt.claim.approval_history.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_approvals_on_one_claim_all_reach_the_ledger() {
        let harness = harness(
            vec![rule(
                "R-chain",
                RuleKind::Sequential {
                    approvers: vec![
                        SequencedApprover::new("u-a", 1),
                        SequencedApprover::new("u-b", 2),
                        SequencedApprover::new("u-c", 3),
                    ],
                },
            )],
            false,
            Arc::new(InMemoryExpenseRepository::default()),
        )
        .await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");

        // Each decision advances the chain at most one step, so none of the
        // three can find the claim already settled.
        let handles: Vec<_> = ["u-a", "u-b", "u-c"]
            .into_iter()
            .map(|actor| {
                let workflow = Arc::clone(&harness.workflow);
                let mut command = command("EXP-1", actor, ApprovalAction::Approved);
                command.comment = Some(format!("from {actor}"));
                tokio::spawn(async move { workflow.decide(command).await })
            })
            .collect();

        for handle in handles {
            handle.await.expect("task").expect("decision accepted");
        }

        let stored = harness
            .expenses
            .find_by_id(&ExpenseId("EXP-1".to_string()))
            .await
            .expect("find")
            .expect("claim");
        assert_eq!(stored.version, 3);
        let mut approvers: Vec<_> =
            stored.approval_history.iter().map(|entry| entry.approver_id.0.as_str()).collect();
        approvers.sort_unstable();
        assert_eq!(approvers, vec!["u-a", "u-b", "u-c"]);
        assert_eq!(harness.audit.events_of_type("approval.decision_recorded").len(), 3);
    }

    #[tokio::test]
    async fn revision_is_blocked_after_first_decision() {
        let harness = harness(
            vec![rule(
                "R-seq",
                RuleKind::Sequential {
                    approvers: vec![
                        SequencedApprover::new("u-a", 1),
                        SequencedApprover::new("u-b", 2),
                    ],
                },
            )],
            false,
            Arc::new(InMemoryExpenseRepository::default()),
        )
        .await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");
        let claim_id = ExpenseId("EXP-1".to_string());

        let revised = harness
            .workflow
            .revise(
                &claim_id,
                ExpenseRevision { amount: Some(Decimal::new(100, 0)), ..ExpenseRevision::default() },
                &converter(),
                "req-revise",
            )
            .await
            .expect("revise");
        assert_eq!(revised.converted_amount, Decimal::new(11000, 2));
        assert_eq!(revised.version, 1);

        harness
            .workflow
            .decide(command("EXP-1", "u-a", ApprovalAction::Approved))
            .await
            .expect("first approval");
        let error = harness
            .workflow
            .revise(&claim_id, ExpenseRevision::default(), &converter(), "req-revise")
            .await
            .expect_err("decisions recorded");
        assert!(matches!(error, ApplicationError::Domain(DomainError::Expense(_))));
    }

    #[tokio::test]
    async fn assess_previews_without_recording() {
        let harness = harness(
            vec![rule("R-cfo", RuleKind::SpecificApprover { designated: vec![UserId("u-cfo".into())] })],
            false,
            Arc::new(InMemoryExpenseRepository::default()),
        )
        .await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");

        let assessment =
            harness.workflow.assess(&ExpenseId("EXP-1".to_string())).await.expect("assess");

        assert_eq!(assessment.rules_considered, 1);
        assert_eq!(assessment.evaluation.status, ExpenseStatus::Pending);
        assert_eq!(assessment.pending_approvers, vec![UserId("u-cfo".to_string())]);
        assert!(harness.audit.events().is_empty());
        assert!(matches!(
            harness.workflow.assess(&ExpenseId("EXP-404".to_string())).await,
            Err(ApplicationError::NotFound(_))
        ));
    }

    fn tracked_claims(workflow: &DecisionWorkflow) -> usize {
        workflow.claim_locks.lock().expect("lock table").len()
    }

    #[tokio::test]
    async fn manager_rejection_wins_over_rules_that_would_approve() {
        let harness = harness(
            vec![rule("R-mgr", RuleKind::SpecificApprover { designated: vec![UserId("u-mgr".into())] })],
            true,
            Arc::new(InMemoryExpenseRepository::default()),
        )
        .await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");

        let receipt = harness
            .workflow
            .decide(command("EXP-1", "u-mgr", ApprovalAction::Rejected))
            .await
            .expect("manager rejects");

        assert_eq!(receipt.path, DecisionPath::ManagerGateRejected);
        assert_eq!(receipt.claim.status, ExpenseStatus::Rejected);
        assert_eq!(receipt.evaluation, None);
        assert!(receipt.pending_approvers.is_empty());
    }

    #[tokio::test]
    async fn claims_above_every_rule_threshold_wait_instead_of_auto_approving() {
        let mut capped =
            rule("R-capped", RuleKind::SpecificApprover { designated: vec![UserId("u-cfo".into())] });
        capped.amount_threshold =
            Some(AmountThreshold { min: Decimal::new(1, 0), max: Some(Decimal::new(100, 0)) });
        let harness =
            harness(vec![capped], false, Arc::new(InMemoryExpenseRepository::default())).await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");

        let assessment =
            harness.workflow.assess(&ExpenseId("EXP-1".to_string())).await.expect("assess");
        assert_eq!(assessment.rules_considered, 0);
        assert_eq!(assessment.evaluation.status, ExpenseStatus::Pending);

        let receipt = harness
            .workflow
            .decide(command("EXP-1", "u-admin", ApprovalAction::Approved))
            .await
            .expect("admin approves");
        assert_eq!(receipt.claim.status, ExpenseStatus::Pending);
        assert_eq!(receipt.claim.approval_history.len(), 1);
    }

    #[tokio::test]
    async fn lock_table_is_emptied_once_decisions_finish() {
        let harness = harness(
            vec![rule(
                "R-chain",
                RuleKind::Sequential {
                    approvers: vec![
                        SequencedApprover::new("u-a", 1),
                        SequencedApprover::new("u-b", 2),
                    ],
                },
            )],
            false,
            Arc::new(InMemoryExpenseRepository::default()),
        )
        .await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");

        for index in 0..50 {
            let missing = harness
                .workflow
                .decide(command(&format!("EXP-MISSING-{index}"), "u-a", ApprovalAction::Approved))
                .await;
            assert!(matches!(missing, Err(ApplicationError::NotFound(_))));
        }
        assert_eq!(tracked_claims(&harness.workflow), 0);

        let handles: Vec<_> = ["u-a", "u-b"]
            .into_iter()
            .map(|actor| {
                let workflow = Arc::clone(&harness.workflow);
                let command = command("EXP-1", actor, ApprovalAction::Approved);
                tokio::spawn(async move { workflow.decide(command).await })
            })
            .collect();
        for handle in handles {
            handle.await.expect("task").expect("decision accepted");
        }
        assert_eq!(tracked_claims(&harness.workflow), 0);
    }

    #[tokio::test]
    async fn lock_timeout_reports_conflict_and_keeps_holder_entry() {
        let harness = harness_with(
            Vec::new(),
            false,
            Arc::new(InMemoryExpenseRepository::default()),
            ApprovalsConfig { decision_timeout_secs: 0, ..ApprovalsConfig::default() },
        )
        .await;
        harness.workflow.submit(new_expense("EXP-1"), &converter(), "req").await.expect("submit");
        let claim_id = ExpenseId("EXP-1".to_string());

        let held = harness.workflow.lock_claim(&claim_id).await.expect("first holder");
        let busy = harness
            .workflow
            .decide(command("EXP-1", "u-admin", ApprovalAction::Approved))
            .await
            .expect_err("claim is locked");
        assert!(matches!(busy, ApplicationError::Conflict(_)));
        assert_eq!(tracked_claims(&harness.workflow), 1);

        drop(held);
        assert_eq!(tracked_claims(&harness.workflow), 0);
    }
}
