//! Capacity tables with optimistic version checks.
//!
//! The `event_capacity` row carries the version. A save bumps it with
//! `UPDATE ... WHERE version = $expected` and rewrites the occupant and waitlist rows in
//! the same transaction; zero updated rows means another writer committed first.

use crate::{backend, corrupt};
use chrono::{DateTime, Utc};
use gather_core::ledger::{CapacityState, WaitlistEntry};
use gather_core::store::{CapacityStore, StoreFuture};
use gather_core::{EventId, StoreError, UserId};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// `PostgreSQL`-backed [`CapacityStore`].
#[derive(Clone)]
pub struct PostgresCapacityStore {
    pool: PgPool,
}

impl PostgresCapacityStore {
    /// Create a store using an existing pool
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_version(&self, event_id: EventId) -> Result<Option<u64>, StoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM event_capacity WHERE event_id = $1")
                .bind(event_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        version.map(to_u64).transpose()
    }
}

fn to_u64(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version).map_err(|_| corrupt("capacity version", version))
}

fn to_i64(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| corrupt("capacity version", version))
}

fn max_column(max: Option<u32>) -> Result<Option<i32>, StoreError> {
    max.map(|m| i32::try_from(m).map_err(|_| corrupt("max_participants", m)))
        .transpose()
}

/// Replace the occupant and waitlist rows of an event.
async fn write_members(
    tx: &mut Transaction<'_, Postgres>,
    state: &CapacityState,
) -> Result<(), StoreError> {
    let event_id = state.event_id.as_uuid();

    sqlx::query("DELETE FROM event_capacity_occupants WHERE event_id = $1")
        .bind(event_id)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    let (occupants, admitted): (Vec<Uuid>, Vec<DateTime<Utc>>) = state
        .occupants
        .iter()
        .map(|(user_id, admitted_at)| (*user_id.as_uuid(), *admitted_at))
        .unzip();
    sqlx::query(
        r"
        INSERT INTO event_capacity_occupants (event_id, user_id, admitted_at)
        SELECT $1, user_id, admitted_at
        FROM UNNEST($2::uuid[], $3::timestamptz[]) AS t(user_id, admitted_at)
        ",
    )
    .bind(event_id)
    .bind(&occupants)
    .bind(&admitted)
    .execute(&mut **tx)
    .await
    .map_err(backend)?;

    sqlx::query("DELETE FROM event_waitlist WHERE event_id = $1")
        .bind(event_id)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    let (users, enqueued): (Vec<Uuid>, Vec<DateTime<Utc>>) = state
        .waitlist
        .iter()
        .map(|entry| (*entry.user_id.as_uuid(), entry.enqueued_at))
        .unzip();
    sqlx::query(
        r"
        INSERT INTO event_waitlist (event_id, user_id, enqueued_at)
        SELECT $1, user_id, enqueued_at
        FROM UNNEST($2::uuid[], $3::timestamptz[]) AS t(user_id, enqueued_at)
        ",
    )
    .bind(event_id)
    .bind(&users)
    .bind(&enqueued)
    .execute(&mut **tx)
    .await
    .map_err(backend)?;

    Ok(())
}

impl CapacityStore for PostgresCapacityStore {
    fn create(&self, state: CapacityState) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(backend)?;

            let inserted = sqlx::query(
                r"
                INSERT INTO event_capacity (event_id, max_participants, version)
                VALUES ($1, $2, $3)
                ON CONFLICT (event_id) DO NOTHING
                ",
            )
            .bind(state.event_id.as_uuid())
            .bind(max_column(state.max)?)
            .bind(to_i64(state.version)?)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();

            if inserted == 0 {
                return Err(StoreError::AlreadyExists(state.event_id));
            }

            write_members(&mut tx, &state).await?;
            tx.commit().await.map_err(backend)?;
            Ok(())
        })
    }

    fn load(&self, event_id: EventId) -> StoreFuture<'_, CapacityState> {
        Box::pin(async move {
            // One snapshot for the row and its children
            let mut tx = self.pool.begin().await.map_err(backend)?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                .execute(&mut *tx)
                .await
                .map_err(backend)?;

            let row = sqlx::query(
                "SELECT max_participants, version FROM event_capacity WHERE event_id = $1",
            )
            .bind(event_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or(StoreError::NotFound(event_id))?;

            let max: Option<i32> = row.try_get("max_participants").map_err(backend)?;
            let version: i64 = row.try_get("version").map_err(backend)?;
            let mut state = CapacityState::new(
                event_id,
                max.map(|m| u32::try_from(m).map_err(|_| corrupt("max_participants", m)))
                    .transpose()?,
            );
            state.version = to_u64(version)?;

            let occupants: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
                "SELECT user_id, admitted_at FROM event_capacity_occupants WHERE event_id = $1",
            )
            .bind(event_id.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?;
            state.occupants = occupants
                .into_iter()
                .map(|(user_id, admitted_at)| (UserId::from_uuid(user_id), admitted_at))
                .collect();

            let waitlist = sqlx::query(
                r"
                SELECT user_id, enqueued_at FROM event_waitlist
                WHERE event_id = $1
                ORDER BY enqueued_at, user_id
                ",
            )
            .bind(event_id.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?;
            state.waitlist = waitlist
                .iter()
                .map(|row| {
                    Ok(WaitlistEntry {
                        enqueued_at: row.try_get("enqueued_at").map_err(backend)?,
                        user_id: UserId::from_uuid(row.try_get("user_id").map_err(backend)?),
                    })
                })
                .collect::<Result<_, StoreError>>()?;

            tx.commit().await.map_err(backend)?;
            Ok(state)
        })
    }

    fn save(&self, state: CapacityState, expected_version: u64) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let event_id = state.event_id;
            let next = expected_version + 1;
            let mut tx = self.pool.begin().await.map_err(backend)?;

            let updated = sqlx::query(
                r"
                UPDATE event_capacity
                SET version = $1, max_participants = $2
                WHERE event_id = $3 AND version = $4
                ",
            )
            .bind(to_i64(next)?)
            .bind(max_column(state.max)?)
            .bind(event_id.as_uuid())
            .bind(to_i64(expected_version)?)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();

            if updated == 0 {
                tx.rollback().await.map_err(backend)?;
                return match self.current_version(event_id).await? {
                    None => Err(StoreError::NotFound(event_id)),
                    Some(actual) => Err(StoreError::Conflict {
                        event_id,
                        expected: expected_version,
                        actual,
                    }),
                };
            }

            write_members(&mut tx, &state).await?;
            tx.commit().await.map_err(backend)?;

            tracing::trace!(%event_id, version = next, "Saved capacity record");
            Ok(next)
        })
    }

    fn events_with_backlog(&self) -> StoreFuture<'_, Vec<EventId>> {
        Box::pin(async move {
            let events: Vec<Uuid> = sqlx::query_scalar(
                r"
                SELECT c.event_id FROM event_capacity c
                WHERE EXISTS (SELECT 1 FROM event_waitlist w WHERE w.event_id = c.event_id)
                  AND (
                    c.max_participants IS NULL
                    OR (SELECT COUNT(*) FROM event_capacity_occupants o
                        WHERE o.event_id = c.event_id) < c.max_participants
                  )
                ORDER BY c.event_id
                ",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
            Ok(events.into_iter().map(EventId::from_uuid).collect())
        })
    }
}
