use std::collections::HashMap;

use rust_decimal::Decimal;
use tokio::sync::RwLock;

use claimflow_core::domain::expense::{ExpenseClaim, ExpenseId, ExpenseStatus};
use claimflow_core::domain::identity::{ClaimantProfile, OrganizationId, UserId};
use claimflow_core::domain::rule::{ApprovalRule, RuleId};

use super::{ApprovalRuleRepository, ExpenseRepository, IdentityRepository, RepositoryError};

/// Rules kept in insertion order, listed by creation time like the SQL store.
#[derive(Default)]
pub struct InMemoryApprovalRuleRepository {
    rules: RwLock<Vec<ApprovalRule>>,
}

impl InMemoryApprovalRuleRepository {
    pub fn with_rules(rules: Vec<ApprovalRule>) -> Self {
        Self { rules: RwLock::new(rules) }
    }
}

#[async_trait::async_trait]
impl ApprovalRuleRepository for InMemoryApprovalRuleRepository {
    async fn list_active(
        &self,
        organization_id: &OrganizationId,
        converted_amount: Decimal,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rules = self.list(organization_id).await?;
        Ok(rules.into_iter().filter(|rule| rule.applies_to(converted_amount)).collect())
    }

    async fn list(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rules = self.rules.read().await;
        let mut scoped: Vec<ApprovalRule> =
            rules.iter().filter(|rule| &rule.organization_id == organization_id).cloned().collect();
        scoped.sort_by_key(|rule| rule.created_at);
        Ok(scoped)
    }

    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules.iter().find(|rule| &rule.id == id).cloned())
    }

    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        match rules.iter_mut().find(|existing| existing.id == rule.id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = ApprovalRule { created_at, ..rule };
            }
            None => rules.push(rule),
        }
        Ok(())
    }

    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError> {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|rule| &rule.id != id);
        Ok(rules.len() != before)
    }
}

#[derive(Default)]
pub struct InMemoryIdentityRepository {
    profiles: RwLock<HashMap<String, ClaimantProfile>>,
}

#[async_trait::async_trait]
impl IdentityRepository for InMemoryIdentityRepository {
    async fn find_profile(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ClaimantProfile>, RepositoryError> {
        let profiles = self.profiles.read().await;
        Ok(profiles.get(&user_id.0).cloned())
    }

    async fn save_profile(&self, profile: ClaimantProfile) -> Result<(), RepositoryError> {
        let mut profiles = self.profiles.write().await;
        profiles.insert(profile.user_id.0.clone(), profile);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryExpenseRepository {
    claims: RwLock<HashMap<String, ExpenseClaim>>,
}

impl InMemoryExpenseRepository {
    async fn replace_if_current(
        &self,
        claim: ExpenseClaim,
        expected_version: u32,
        allow_history: bool,
    ) -> Result<ExpenseClaim, RepositoryError> {
        let mut claims = self.claims.write().await;
        let current = claims.get(&claim.id.0).filter(|stored| {
            stored.version == expected_version
                && (allow_history || stored.approval_history.is_empty())
        });
        if current.is_none() {
            return Err(RepositoryError::Conflict { expense_id: claim.id, expected_version });
        }

        let stored = ExpenseClaim { version: expected_version + 1, ..claim };
        claims.insert(stored.id.0.clone(), stored.clone());
        Ok(stored)
    }
}

#[async_trait::async_trait]
impl ExpenseRepository for InMemoryExpenseRepository {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<ExpenseClaim>, RepositoryError> {
        let claims = self.claims.read().await;
        Ok(claims.get(&id.0).cloned())
    }

    async fn insert(&self, claim: ExpenseClaim) -> Result<(), RepositoryError> {
        let mut claims = self.claims.write().await;
        if claims.contains_key(&claim.id.0) {
            return Err(RepositoryError::Conflict {
                expense_id: claim.id,
                expected_version: claim.version,
            });
        }
        claims.insert(claim.id.0.clone(), claim);
        Ok(())
    }

    async fn save_decision(
        &self,
        claim: ExpenseClaim,
        expected_version: u32,
    ) -> Result<ExpenseClaim, RepositoryError> {
        self.replace_if_current(claim, expected_version, true).await
    }

    async fn save_revision(
        &self,
        claim: ExpenseClaim,
        expected_version: u32,
    ) -> Result<ExpenseClaim, RepositoryError> {
        self.replace_if_current(claim, expected_version, false).await
    }

    async fn list_pending(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<ExpenseClaim>, RepositoryError> {
        let claims = self.claims.read().await;
        let mut pending: Vec<ExpenseClaim> = claims
            .values()
            .filter(|claim| {
                &claim.organization_id == organization_id && claim.status == ExpenseStatus::Pending
            })
            .cloned()
            .collect();
        pending.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, Utc};
    use rust_decimal::Decimal;

    use claimflow_core::domain::expense::{
        ExpenseCategory, ExpenseClaim, ExpenseId, ExpenseStatus,
    };
    use claimflow_core::domain::identity::{ClaimantProfile, OrganizationId, Role, UserId};
    use claimflow_core::domain::rule::{AmountThreshold, ApprovalRule, RuleId, RuleKind};

    use crate::repositories::{
        ApprovalRuleRepository, ExpenseRepository, IdentityRepository,
        InMemoryApprovalRuleRepository, InMemoryExpenseRepository, InMemoryIdentityRepository,
        RepositoryError,
    };

    fn rule(id: &str, created_offset: i64) -> ApprovalRule {
        let created_at = Utc::now() + Duration::seconds(created_offset);
        ApprovalRule {
            id: RuleId(id.to_string()),
            organization_id: OrganizationId("org-1".to_string()),
            name: id.to_string(),
            kind: RuleKind::SpecificApprover { designated: vec![UserId("u-cfo".to_string())] },
            amount_threshold: None,
            is_active: true,
            created_at,
            updated_at: created_at,
        }
    }

    fn claim(id: &str) -> ExpenseClaim {
        let now = Utc::now();
        ExpenseClaim {
            id: ExpenseId(id.to_string()),
            claimant_id: UserId("u-emp".to_string()),
            organization_id: OrganizationId("org-1".to_string()),
            amount: Decimal::new(40, 0),
            currency: "USD".to_string(),
            converted_amount: Decimal::new(40, 0),
            base_currency: "USD".to_string(),
            category: ExpenseCategory::Transportation,
            description: "Taxi".to_string(),
            merchant: None,
            expense_date: NaiveDate::from_ymd_opt(2026, 4, 1).expect("date"),
            status: ExpenseStatus::Pending,
            current_approver_step: 0,
            approval_history: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn in_memory_rules_follow_creation_order_and_threshold() {
        let mut scoped = rule("R-scoped", 5);
        scoped.amount_threshold = Some(AmountThreshold { min: Decimal::new(100, 0), max: None });
        let repo =
            InMemoryApprovalRuleRepository::with_rules(vec![rule("R-2", 2), scoped, rule("R-1", 1)]);
        let org = OrganizationId("org-1".to_string());

        let small = repo.list_active(&org, Decimal::new(10, 0)).await.expect("list");
        let ids: Vec<_> = small.iter().map(|rule| rule.id.0.as_str()).collect();
        assert_eq!(ids, vec!["R-1", "R-2"]);

        assert!(repo.delete(&RuleId("R-1".to_string())).await.expect("delete"));
        let large = repo.list_active(&org, Decimal::new(500, 0)).await.expect("list");
        let ids: Vec<_> = large.iter().map(|rule| rule.id.0.as_str()).collect();
        assert_eq!(ids, vec!["R-2", "R-scoped"]);
    }

    #[tokio::test]
    async fn in_memory_identity_repo_round_trip() {
        let repo = InMemoryIdentityRepository::default();
        let profile = ClaimantProfile {
            user_id: UserId("u-mgr".to_string()),
            organization_id: OrganizationId("org-1".to_string()),
            role: Role::Manager,
            manager_id: None,
            mandatory_manager_approval: false,
        };

        repo.save_profile(profile.clone()).await.expect("save");
        assert_eq!(repo.find_profile(&profile.user_id).await.expect("find"), Some(profile));
    }

    #[tokio::test]
    async fn in_memory_expense_repo_enforces_version() {
        let repo = InMemoryExpenseRepository::default();
        let original = claim("EXP-1");
        repo.insert(original.clone()).await.expect("insert");
        assert!(matches!(
            repo.insert(original.clone()).await,
            Err(RepositoryError::Conflict { .. })
        ));

        let mut approved = original.clone();
        approved.status = ExpenseStatus::Approved;
        let stored = repo.save_decision(approved.clone(), 0).await.expect("save");
        assert_eq!(stored.version, 1);

        let error = repo.save_decision(approved, 0).await.expect_err("stale");
        assert!(matches!(error, RepositoryError::Conflict { expected_version: 0, .. }));
        assert!(repo
            .list_pending(&OrganizationId("org-1".to_string()))
            .await
            .expect("list")
            .is_empty());
    }
}
