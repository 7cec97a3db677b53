use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use claimflow_core::domain::identity::OrganizationId;
use claimflow_core::domain::rule::{AmountThreshold, ApprovalRule, RuleId, RuleKind, RuleType};

use super::{ApprovalRuleRepository, RepositoryError};
use crate::DbPool;

const RULE_COLUMNS: &str = "id, organization_id, name, rule_type, definition_json, threshold_min,
     threshold_max, is_active, created_at, updated_at";

pub struct SqlApprovalRuleRepository {
    pool: DbPool,
}

impl SqlApprovalRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ApprovalRuleRepository for SqlApprovalRuleRepository {
    async fn list_active(
        &self,
        organization_id: &OrganizationId,
        converted_amount: Decimal,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rule
             WHERE organization_id = ? AND is_active = 1
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        // Thresholds are stored as decimal text, so range checks happen here.
        let rules = rows.iter().map(rule_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(rules.into_iter().filter(|rule| rule.applies_to(converted_amount)).collect())
    }

    async fn list(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rule
             WHERE organization_id = ?
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM approval_rule WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(rule_from_row).transpose()
    }

    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(&rule.kind)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        let threshold_min = rule.amount_threshold.as_ref().map(|threshold| threshold.min.to_string());
        let threshold_max = rule
            .amount_threshold
            .as_ref()
            .and_then(|threshold| threshold.max)
            .map(|max| max.to_string());

        sqlx::query(
            "INSERT INTO approval_rule (id, organization_id, name, rule_type, definition_json,
                                        threshold_min, threshold_max, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 rule_type = excluded.rule_type,
                 definition_json = excluded.definition_json,
                 threshold_min = excluded.threshold_min,
                 threshold_max = excluded.threshold_max,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(&rule.id.0)
        .bind(&rule.organization_id.0)
        .bind(&rule.name)
        .bind(rule.rule_type().as_str())
        .bind(definition_json)
        .bind(threshold_min)
        .bind(threshold_max)
        .bind(rule.is_active)
        .bind(rule.created_at.to_rfc3339())
        .bind(rule.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM approval_rule WHERE id = ?").bind(&id.0).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

fn rule_from_row(row: &SqliteRow) -> Result<ApprovalRule, RepositoryError> {
    let id: String = row.try_get("id")?;
    let rule_type_raw: String = row.try_get("rule_type")?;
    let rule_type = RuleType::parse(&rule_type_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown rule type `{rule_type_raw}` for rule `{id}`"))
    })?;

    let definition_json: String = row.try_get("definition_json")?;
    let kind: RuleKind = serde_json::from_str(&definition_json).map_err(|error| {
        RepositoryError::Decode(format!("invalid definition for rule `{id}`: {error}"))
    })?;
    if kind.rule_type() != rule_type {
        return Err(RepositoryError::Decode(format!(
            "rule `{id}` is stored as {} but its definition is {}",
            rule_type.as_str(),
            kind.rule_type().as_str()
        )));
    }

    let threshold_min = parse_optional_decimal("threshold_min", row.try_get("threshold_min")?)?;
    let threshold_max = parse_optional_decimal("threshold_max", row.try_get("threshold_max")?)?;
    let amount_threshold = match (threshold_min, threshold_max) {
        (None, None) => None,
        (min, max) => Some(AmountThreshold { min: min.unwrap_or(Decimal::ZERO), max }),
    };

    Ok(ApprovalRule {
        id: RuleId(id),
        organization_id: OrganizationId(row.try_get("organization_id")?),
        name: row.try_get("name")?,
        kind,
        amount_threshold,
        is_active: row.try_get("is_active")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

pub(crate) fn parse_decimal(column: &str, value: String) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(&value).map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

fn parse_optional_decimal(
    column: &str,
    value: Option<String>,
) -> Result<Option<Decimal>, RepositoryError> {
    value.map(|decimal| parse_decimal(column, decimal)).transpose()
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}
