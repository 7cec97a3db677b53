use sqlx::{sqlite::SqliteRow, Row};

use claimflow_core::domain::identity::{ClaimantProfile, OrganizationId, Role, UserId};

use super::{IdentityRepository, RepositoryError};
use crate::DbPool;

pub struct SqlIdentityRepository {
    pool: DbPool,
}

impl SqlIdentityRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl IdentityRepository for SqlIdentityRepository {
    async fn find_profile(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ClaimantProfile>, RepositoryError> {
        let row = sqlx::query(
            "SELECT user_id, organization_id, role, manager_id, mandatory_manager_approval
             FROM claimant_profile WHERE user_id = ?",
        )
        .bind(&user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(profile_from_row).transpose()
    }

    async fn save_profile(&self, profile: ClaimantProfile) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO claimant_profile (user_id, organization_id, role, manager_id,
                                           mandatory_manager_approval)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 organization_id = excluded.organization_id,
                 role = excluded.role,
                 manager_id = excluded.manager_id,
                 mandatory_manager_approval = excluded.mandatory_manager_approval",
        )
        .bind(&profile.user_id.0)
        .bind(&profile.organization_id.0)
        .bind(profile.role.as_str())
        .bind(profile.manager_id.as_ref().map(|id| id.0.as_str()))
        .bind(profile.mandatory_manager_approval)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn profile_from_row(row: &SqliteRow) -> Result<ClaimantProfile, RepositoryError> {
    let role_raw: String = row.try_get("role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown role `{role_raw}`")))?;
    let manager_id: Option<String> = row.try_get("manager_id")?;

    Ok(ClaimantProfile {
        user_id: UserId(row.try_get("user_id")?),
        organization_id: OrganizationId(row.try_get("organization_id")?),
        role,
        manager_id: manager_id.map(UserId),
        mandatory_manager_approval: row.try_get("mandatory_manager_approval")?,
    })
}
