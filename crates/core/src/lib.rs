pub mod approvals;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;

pub use approvals::{
    apply_decision, authority, authorize, evaluate, pending_approvers, ConfigurationInconsistency,
    DecisionAuthority, DecisionError, DecisionOutcome, DecisionPath, DecisionRequest, Evaluation,
};
pub use domain::currency::{ConversionError, CurrencyConverter, StaticRateConverter};
pub use domain::expense::{
    ApprovalAction, ExpenseCategory, ExpenseClaim, ExpenseError, ExpenseId, ExpenseRevision,
    ExpenseStatus, LedgerEntry, NewExpense,
};
pub use domain::identity::{Actor, ClaimantProfile, OrganizationId, Role, UserId};
pub use domain::rule::{
    AmountThreshold, ApprovalRule, ApprovalRuleDraft, RuleId, RuleKind, RuleType, RuleUpdate,
    RuleValidationError, SequencedApprover,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
