use serde::Serialize;
use sqlx::Executor;

use claimflow_core::domain::expense::{ExpenseId, ExpenseStatus};
use claimflow_core::domain::identity::{OrganizationId, UserId};
use claimflow_core::domain::rule::RuleId;

use crate::connection::DbPool;
use crate::repositories::{
    ApprovalRuleRepository, ExpenseRepository, IdentityRepository, RepositoryError,
    SqlApprovalRuleRepository, SqlExpenseRepository, SqlIdentityRepository,
};

pub const DEMO_ORGANIZATION_ID: &str = "org-demo";

const SEED_PROFILE_IDS: &[&str] = &[
    "u-demo-admin",
    "u-demo-mgr",
    "u-demo-fin-1",
    "u-demo-fin-2",
    "u-demo-cfo",
    "u-demo-emp-1",
    "u-demo-emp-2",
];

const SEED_RULE_IDS: &[&str] =
    &["rule-demo-small", "rule-demo-large", "rule-demo-board", "rule-demo-retired"];

const SEED_CLAIMS: &[SeedClaimContract] = &[
    SeedClaimContract {
        claim_id: "exp-demo-001",
        status: ExpenseStatus::Pending,
        ledger_len: 0,
        description: "Small claim behind the mandatory manager gate",
    },
    SeedClaimContract {
        claim_id: "exp-demo-002",
        status: ExpenseStatus::Pending,
        ledger_len: 0,
        description: "Large EUR claim routed through the finance chain",
    },
    SeedClaimContract {
        claim_id: "exp-demo-003",
        status: ExpenseStatus::Approved,
        ledger_len: 1,
        description: "Settled claim with one recorded approval",
    },
];

/// Demo organization with profiles, one rule of each kind and claims in
/// several states.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed.sql");

    /// Loads the dataset. Rows that already exist are left alone.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        Ok(SeedResult {
            organization_id: DEMO_ORGANIZATION_ID,
            profiles: SEED_PROFILE_IDS.len(),
            rules: SEED_RULE_IDS.len(),
            claims: SEED_CLAIMS
                .iter()
                .map(|claim| ClaimSeedInfo {
                    claim_id: claim.claim_id,
                    description: claim.description,
                })
                .collect(),
        })
    }

    /// Reads every seeded record back through the repositories.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let identities = SqlIdentityRepository::new(pool.clone());
        let rules = SqlApprovalRuleRepository::new(pool.clone());
        let expenses = SqlExpenseRepository::new(pool.clone());
        let mut checks = Vec::new();

        for user_id in SEED_PROFILE_IDS {
            let found = identities.find_profile(&UserId((*user_id).to_string())).await?;
            checks.push((*user_id, found.is_some()));
        }

        for rule_id in SEED_RULE_IDS {
            let found = rules.find_by_id(&RuleId((*rule_id).to_string())).await?;
            checks.push((*rule_id, found.is_some()));
        }

        let active = rules.list(&OrganizationId(DEMO_ORGANIZATION_ID.to_string())).await?;
        checks.push((
            "rules-active-count",
            active.iter().filter(|rule| rule.is_active).count() == SEED_RULE_IDS.len() - 1,
        ));

        for contract in SEED_CLAIMS {
            let found = expenses.find_by_id(&ExpenseId(contract.claim_id.to_string())).await?;
            let matches = found.is_some_and(|claim| {
                claim.status == contract.status
                    && claim.approval_history.len() == contract.ledger_len
            });
            checks.push((contract.claim_id, matches));
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;

        let quoted_claims =
            sql_array_from_ids(&SEED_CLAIMS.iter().map(|claim| claim.claim_id).collect::<Vec<_>>());
        let quoted_rules = sql_array_from_ids(SEED_RULE_IDS);
        let quoted_profiles = sql_array_from_ids(SEED_PROFILE_IDS);

        sqlx::query(&format!("DELETE FROM expense_approval_history WHERE expense_id IN {quoted_claims}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM expense_claim WHERE id IN {quoted_claims}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM approval_rule WHERE id IN {quoted_rules}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM claimant_profile WHERE user_id IN {quoted_profiles}"))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SeedClaimContract {
    claim_id: &'static str,
    status: ExpenseStatus,
    ledger_len: usize,
    description: &'static str,
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{id}'")).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug, Serialize)]
pub struct SeedResult {
    pub organization_id: &'static str,
    pub profiles: usize,
    pub rules: usize,
    pub claims: Vec<ClaimSeedInfo>,
}

#[derive(Debug, Serialize)]
pub struct ClaimSeedInfo {
    pub claim_id: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Serialize)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
