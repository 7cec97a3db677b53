use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::currency::{normalize_code, ConversionError, CurrencyConverter};
use crate::domain::identity::{OrganizationId, UserId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpenseId(pub String);

impl fmt::Display for ExpenseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseStatus {
    Pending,
    Approved,
    Rejected,
    /// Representable for stored data; no decision path produces it.
    PartiallyApproved,
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::PartiallyApproved => "partially_approved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "partially_approved" => Some(Self::PartiallyApproved),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseCategory {
    Travel,
    Meals,
    OfficeSupplies,
    Entertainment,
    Accommodation,
    Transportation,
    Other,
}

impl ExpenseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Travel => "travel",
            Self::Meals => "meals",
            Self::OfficeSupplies => "office_supplies",
            Self::Entertainment => "entertainment",
            Self::Accommodation => "accommodation",
            Self::Transportation => "transportation",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace(' ', "_").as_str() {
            "travel" => Some(Self::Travel),
            "meals" => Some(Self::Meals),
            "office_supplies" => Some(Self::OfficeSupplies),
            "entertainment" => Some(Self::Entertainment),
            "accommodation" => Some(Self::Accommodation),
            "transportation" => Some(Self::Transportation),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approved,
    Rejected,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" | "approve" => Some(Self::Approved),
            "rejected" | "reject" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// One approve/reject action in a claim's approval history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub approver_id: UserId,
    pub action: ApprovalAction,
    pub comment: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseClaim {
    pub id: ExpenseId,
    pub claimant_id: UserId,
    pub organization_id: OrganizationId,
    pub amount: Decimal,
    pub currency: String,
    pub converted_amount: Decimal,
    pub base_currency: String,
    pub category: ExpenseCategory,
    pub description: String,
    pub merchant: Option<String>,
    pub expense_date: NaiveDate,
    pub status: ExpenseStatus,
    pub current_approver_step: u32,
    pub approval_history: Vec<LedgerEntry>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExpense {
    pub id: ExpenseId,
    pub claimant_id: UserId,
    pub organization_id: OrganizationId,
    pub amount: Decimal,
    pub currency: String,
    pub category: ExpenseCategory,
    pub description: String,
    pub merchant: Option<String>,
    pub expense_date: NaiveDate,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseRevision {
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub category: Option<ExpenseCategory>,
    pub description: Option<String>,
    pub merchant: Option<String>,
    pub expense_date: Option<NaiveDate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExpenseError {
    #[error("expense amount must be positive, got {amount}")]
    NonPositiveAmount { amount: Decimal },
    #[error("expense field `{field}` is required")]
    MissingField { field: &'static str },
    #[error("expense `{}` can no longer be revised in status {status:?}", .expense_id.0)]
    NotRevisable { expense_id: ExpenseId, status: ExpenseStatus },
    #[error("expense `{}` already has approval decisions recorded", .expense_id.0)]
    DecisionsRecorded { expense_id: ExpenseId },
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

impl ExpenseClaim {
    /// Creates a pending claim with its base-currency amount fixed at submission time.
    pub fn submit<C>(
        new: NewExpense,
        base_currency: &str,
        converter: &C,
        now: DateTime<Utc>,
    ) -> Result<Self, ExpenseError>
    where
        C: CurrencyConverter + ?Sized,
    {
        check_amount(new.amount)?;
        if new.currency.trim().is_empty() {
            return Err(ExpenseError::MissingField { field: "currency" });
        }
        if new.description.trim().is_empty() {
            return Err(ExpenseError::MissingField { field: "description" });
        }

        let base_currency = normalize_code(base_currency);
        let currency = normalize_code(&new.currency);
        let converted_amount = converter.convert(new.amount, &currency, &base_currency)?;

        Ok(Self {
            id: new.id,
            claimant_id: new.claimant_id,
            organization_id: new.organization_id,
            amount: new.amount,
            currency,
            converted_amount,
            base_currency,
            category: new.category,
            description: new.description,
            merchant: new.merchant,
            expense_date: new.expense_date,
            status: ExpenseStatus::Pending,
            current_approver_step: 0,
            approval_history: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Edits a claim before anyone has acted on it. The converted amount is only
    /// recomputed here, never while approval is under way.
    pub fn revise<C>(
        &mut self,
        revision: ExpenseRevision,
        converter: &C,
        now: DateTime<Utc>,
    ) -> Result<(), ExpenseError>
    where
        C: CurrencyConverter + ?Sized,
    {
        if self.status != ExpenseStatus::Pending {
            return Err(ExpenseError::NotRevisable {
                expense_id: self.id.clone(),
                status: self.status,
            });
        }
        if !self.approval_history.is_empty() {
            return Err(ExpenseError::DecisionsRecorded { expense_id: self.id.clone() });
        }

        let amount = revision.amount.unwrap_or(self.amount);
        check_amount(amount)?;
        let currency = revision.currency.as_deref().map(normalize_code);
        let reconvert = revision.amount.is_some() || currency.is_some();
        let currency = currency.unwrap_or_else(|| self.currency.clone());
        if currency.is_empty() {
            return Err(ExpenseError::MissingField { field: "currency" });
        }
        if let Some(description) = &revision.description {
            if description.trim().is_empty() {
                return Err(ExpenseError::MissingField { field: "description" });
            }
        }

        let converted_amount = if reconvert {
            converter.convert(amount, &currency, &self.base_currency)?
        } else {
            self.converted_amount
        };

        self.amount = amount;
        self.currency = currency;
        self.converted_amount = converted_amount;
        if let Some(category) = revision.category {
            self.category = category;
        }
        if let Some(description) = revision.description {
            self.description = description;
        }
        if revision.merchant.is_some() {
            self.merchant = revision.merchant;
        }
        if let Some(expense_date) = revision.expense_date {
            self.expense_date = expense_date;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_transition_to(&self, next: ExpenseStatus) -> bool {
        matches!(
            (self.status, next),
            (ExpenseStatus::Pending, ExpenseStatus::Pending)
                | (ExpenseStatus::Pending, ExpenseStatus::Approved)
                | (ExpenseStatus::Pending, ExpenseStatus::Rejected)
        )
    }

    pub fn transition_to(&mut self, next: ExpenseStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            self.status = next;
            return Ok(());
        }

        Err(DomainError::InvalidExpenseTransition { from: self.status, to: next })
    }

    pub fn record(&mut self, entry: LedgerEntry) {
        self.updated_at = entry.recorded_at;
        self.approval_history.push(entry);
    }

    /// Everyone with an approval anywhere in the ledger. Rejections do not count.
    pub fn approved_by(&self) -> HashSet<&UserId> {
        self.approval_history
            .iter()
            .filter(|entry| entry.action == ApprovalAction::Approved)
            .map(|entry| &entry.approver_id)
            .collect()
    }
}

fn check_amount(amount: Decimal) -> Result<(), ExpenseError> {
    if amount <= Decimal::ZERO {
        return Err(ExpenseError::NonPositiveAmount { amount });
    }
    Ok(())
}
