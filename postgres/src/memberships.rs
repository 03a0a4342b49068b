//! Membership table.

use crate::{backend, corrupt};
use gather_core::store::{MembershipStore, StoreFuture};
use gather_core::{EventId, Membership, MembershipStatus, Role, StoreError, UserId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// `PostgreSQL`-backed [`MembershipStore`] over the `memberships` table.
#[derive(Clone)]
pub struct PostgresMembershipStore {
    pool: PgPool,
}

impl PostgresMembershipStore {
    /// Create a store using an existing pool
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode(row: &PgRow) -> Result<Membership, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    let role: String = row.try_get("role").map_err(backend)?;

    Ok(Membership {
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(backend)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(backend)?),
        status: MembershipStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        role: Role::parse(&role).ok_or_else(|| corrupt("role", &role))?,
        reason: row.try_get("reason").map_err(backend)?,
        joined_at: row.try_get("joined_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

impl MembershipStore for PostgresMembershipStore {
    fn load(&self, event_id: EventId, user_id: UserId) -> StoreFuture<'_, Option<Membership>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT event_id, user_id, status, role, reason, joined_at, updated_at
                FROM memberships
                WHERE event_id = $1 AND user_id = $2
                ",
            )
            .bind(event_id.as_uuid())
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

            row.as_ref().map(decode).transpose()
        })
    }

    fn save(&self, membership: Membership) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO memberships (event_id, user_id, status, role, reason, joined_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (event_id, user_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    role = EXCLUDED.role,
                    reason = EXCLUDED.reason,
                    joined_at = EXCLUDED.joined_at,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(membership.event_id.as_uuid())
            .bind(membership.user_id.as_uuid())
            .bind(membership.status.as_str())
            .bind(membership.role.as_str())
            .bind(&membership.reason)
            .bind(membership.joined_at)
            .bind(membership.updated_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
            Ok(())
        })
    }

    fn list(
        &self,
        event_id: EventId,
        status: Option<MembershipStatus>,
    ) -> StoreFuture<'_, Vec<Membership>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT event_id, user_id, status, role, reason, joined_at, updated_at
                FROM memberships
                WHERE event_id = $1 AND ($2::text IS NULL OR status = $2)
                ORDER BY updated_at, user_id
                ",
            )
            .bind(event_id.as_uuid())
            .bind(status.map(MembershipStatus::as_str))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

            rows.iter().map(decode).collect()
        })
    }
}
