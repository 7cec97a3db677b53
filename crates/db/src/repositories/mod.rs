use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use claimflow_core::domain::expense::{ExpenseClaim, ExpenseId};
use claimflow_core::domain::identity::{ClaimantProfile, OrganizationId, UserId};
use claimflow_core::domain::rule::{ApprovalRule, RuleId};

pub mod expense;
pub mod identity;
pub mod memory;
pub mod rule;

pub use expense::SqlExpenseRepository;
pub use identity::SqlIdentityRepository;
pub use memory::{
    InMemoryApprovalRuleRepository, InMemoryExpenseRepository, InMemoryIdentityRepository,
};
pub use rule::SqlApprovalRuleRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("expense `{}` changed since version {expected_version}", .expense_id.0)]
    Conflict { expense_id: ExpenseId, expected_version: u32 },
}

#[async_trait]
pub trait ApprovalRuleRepository: Send + Sync {
    /// Active rules of the organization covering `converted_amount`, in
    /// creation order.
    async fn list_active(
        &self,
        organization_id: &OrganizationId,
        converted_amount: Decimal,
    ) -> Result<Vec<ApprovalRule>, RepositoryError>;

    async fn list(&self, organization_id: &OrganizationId)
        -> Result<Vec<ApprovalRule>, RepositoryError>;

    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError>;

    /// Inserts or replaces a rule. Replacing keeps its position in creation order.
    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError>;

    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait IdentityRepository: Send + Sync {
    async fn find_profile(&self, user_id: &UserId)
        -> Result<Option<ClaimantProfile>, RepositoryError>;

    async fn save_profile(&self, profile: ClaimantProfile) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ExpenseRepository: Send + Sync {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<ExpenseClaim>, RepositoryError>;

    async fn insert(&self, claim: ExpenseClaim) -> Result<(), RepositoryError>;

    /// Writes status, step and any ledger entries beyond those already stored,
    /// provided the stored version still equals `expected_version`. Returns the
    /// claim as stored, with its version bumped.
    async fn save_decision(
        &self,
        claim: ExpenseClaim,
        expected_version: u32,
    ) -> Result<ExpenseClaim, RepositoryError>;

    /// Replaces the editable fields of a claim that has no ledger entries yet.
    async fn save_revision(
        &self,
        claim: ExpenseClaim,
        expected_version: u32,
    ) -> Result<ExpenseClaim, RepositoryError>;

    async fn list_pending(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<ExpenseClaim>, RepositoryError>;
}
