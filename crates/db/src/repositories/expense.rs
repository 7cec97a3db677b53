use chrono::NaiveDate;
use sqlx::{sqlite::SqliteRow, Row};

use claimflow_core::domain::expense::{
    ApprovalAction, ExpenseCategory, ExpenseClaim, ExpenseId, ExpenseStatus, LedgerEntry,
};
use claimflow_core::domain::identity::{OrganizationId, UserId};

use super::rule::{parse_decimal, parse_timestamp};
use super::{ExpenseRepository, RepositoryError};
use crate::DbPool;

const CLAIM_COLUMNS: &str = "id, claimant_id, organization_id, amount, currency, converted_amount,
     base_currency, category, description, merchant, expense_date, status,
     current_approver_step, version, created_at, updated_at";

pub struct SqlExpenseRepository {
    pool: DbPool,
}

impl SqlExpenseRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_history(&self, id: &ExpenseId) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT approver_id, action, comment, recorded_at
             FROM expense_approval_history
             WHERE expense_id = ?
             ORDER BY position ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn with_history(&self, row: &SqliteRow) -> Result<ExpenseClaim, RepositoryError> {
        let mut claim = claim_from_row(row)?;
        claim.approval_history = self.load_history(&claim.id).await?;
        Ok(claim)
    }
}

#[async_trait::async_trait]
impl ExpenseRepository for SqlExpenseRepository {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<ExpenseClaim>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CLAIM_COLUMNS} FROM expense_claim WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref row) => Ok(Some(self.with_history(row).await?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, claim: ExpenseClaim) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO expense_claim (id, claimant_id, organization_id, amount, currency,
                                        converted_amount, base_currency, category, description,
                                        merchant, expense_date, status, current_approver_step,
                                        version, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&claim.id.0)
        .bind(&claim.claimant_id.0)
        .bind(&claim.organization_id.0)
        .bind(claim.amount.to_string())
        .bind(&claim.currency)
        .bind(claim.converted_amount.to_string())
        .bind(&claim.base_currency)
        .bind(claim.category.as_str())
        .bind(&claim.description)
        .bind(&claim.merchant)
        .bind(claim.expense_date.to_string())
        .bind(claim.status.as_str())
        .bind(i64::from(claim.current_approver_step))
        .bind(i64::from(claim.version))
        .bind(claim.created_at.to_rfc3339())
        .bind(claim.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for (position, entry) in claim.approval_history.iter().enumerate() {
            insert_entry(&mut tx, &claim.id, position, entry).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_decision(
        &self,
        claim: ExpenseClaim,
        expected_version: u32,
    ) -> Result<ExpenseClaim, RepositoryError> {
        let next_version = expected_version + 1;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE expense_claim
             SET status = ?, current_approver_step = ?, version = ?, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(claim.status.as_str())
        .bind(i64::from(claim.current_approver_step))
        .bind(i64::from(next_version))
        .bind(claim.updated_at.to_rfc3339())
        .bind(&claim.id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::Conflict { expense_id: claim.id, expected_version });
        }

        let stored: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM expense_approval_history WHERE expense_id = ?",
        )
        .bind(&claim.id.0)
        .fetch_one(&mut *tx)
        .await?;
        let stored = usize::try_from(stored)
            .map_err(|_| RepositoryError::Decode(format!("negative history count {stored}")))?;

        for (position, entry) in claim.approval_history.iter().enumerate().skip(stored) {
            insert_entry(&mut tx, &claim.id, position, entry).await?;
        }

        tx.commit().await?;
        Ok(ExpenseClaim { version: next_version, ..claim })
    }

    async fn save_revision(
        &self,
        claim: ExpenseClaim,
        expected_version: u32,
    ) -> Result<ExpenseClaim, RepositoryError> {
        let next_version = expected_version + 1;
        let updated = sqlx::query(
            "UPDATE expense_claim
             SET amount = ?, currency = ?, converted_amount = ?, category = ?, description = ?,
                 merchant = ?, expense_date = ?, version = ?, updated_at = ?
             WHERE id = ? AND version = ?
               AND NOT EXISTS (SELECT 1 FROM expense_approval_history WHERE expense_id = ?)",
        )
        .bind(claim.amount.to_string())
        .bind(&claim.currency)
        .bind(claim.converted_amount.to_string())
        .bind(claim.category.as_str())
        .bind(&claim.description)
        .bind(&claim.merchant)
        .bind(claim.expense_date.to_string())
        .bind(i64::from(next_version))
        .bind(claim.updated_at.to_rfc3339())
        .bind(&claim.id.0)
        .bind(i64::from(expected_version))
        .bind(&claim.id.0)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::Conflict { expense_id: claim.id, expected_version });
        }

        Ok(ExpenseClaim { version: next_version, ..claim })
    }

    async fn list_pending(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<ExpenseClaim>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CLAIM_COLUMNS} FROM expense_claim
             WHERE organization_id = ? AND status = 'pending'
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut claims = Vec::with_capacity(rows.len());
        for row in &rows {
            claims.push(self.with_history(row).await?);
        }
        Ok(claims)
    }
}

async fn insert_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    expense_id: &ExpenseId,
    position: usize,
    entry: &LedgerEntry,
) -> Result<(), RepositoryError> {
    let position = i64::try_from(position)
        .map_err(|_| RepositoryError::Decode(format!("history position {position} overflows")))?;

    sqlx::query(
        "INSERT INTO expense_approval_history (expense_id, position, approver_id, action, comment,
                                               recorded_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&expense_id.0)
    .bind(position)
    .bind(&entry.approver_id.0)
    .bind(entry.action.as_str())
    .bind(&entry.comment)
    .bind(entry.recorded_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn claim_from_row(row: &SqliteRow) -> Result<ExpenseClaim, RepositoryError> {
    let status_raw: String = row.try_get("status")?;
    let status = ExpenseStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown expense status `{status_raw}`")))?;
    let category_raw: String = row.try_get("category")?;
    let category = ExpenseCategory::parse(&category_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown expense category `{category_raw}`"))
    })?;
    let expense_date_raw: String = row.try_get("expense_date")?;
    let expense_date = NaiveDate::parse_from_str(&expense_date_raw, "%Y-%m-%d").map_err(|error| {
        RepositoryError::Decode(format!("invalid expense_date `{expense_date_raw}` ({error})"))
    })?;

    Ok(ExpenseClaim {
        id: ExpenseId(row.try_get("id")?),
        claimant_id: UserId(row.try_get("claimant_id")?),
        organization_id: OrganizationId(row.try_get("organization_id")?),
        amount: parse_decimal("amount", row.try_get("amount")?)?,
        currency: row.try_get("currency")?,
        converted_amount: parse_decimal("converted_amount", row.try_get("converted_amount")?)?,
        base_currency: row.try_get("base_currency")?,
        category,
        description: row.try_get("description")?,
        merchant: row.try_get("merchant")?,
        expense_date,
        status,
        current_approver_step: parse_u32("current_approver_step", row.try_get("current_approver_step")?)?,
        approval_history: Vec::new(),
        version: parse_u32("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, RepositoryError> {
    let action_raw: String = row.try_get("action")?;
    let action = ApprovalAction::parse(&action_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval action `{action_raw}`")))?;

    Ok(LedgerEntry {
        approver_id: UserId(row.try_get("approver_id")?),
        action,
        comment: row.try_get("comment")?,
        recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at")?)?,
    })
}

fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}
