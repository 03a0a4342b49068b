//! Event join configuration table.

use crate::{backend, corrupt};
use chrono::{DateTime, Duration, Utc};
use gather_core::store::{EventConfigStore, StoreFuture};
use gather_core::{EventId, EventJoinConfig, JoinMode, ManualClosure, StoreError, UserId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// `PostgreSQL`-backed [`EventConfigStore`] over the `event_join_configs` table.
#[derive(Clone)]
pub struct PostgresEventConfigStore {
    pool: PgPool,
}

impl PostgresEventConfigStore {
    /// Create a store using an existing pool
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Validated offsets are whole seconds, so nothing is lost here.
fn offset_secs(offset: Option<Duration>) -> Option<i64> {
    offset.map(|o| o.num_seconds())
}

fn to_i32(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| corrupt("participant count", value))
}

fn decode(row: &PgRow) -> Result<EventJoinConfig, StoreError> {
    let mode: String = row.try_get("join_mode").map_err(backend)?;
    let join_mode = JoinMode::parse(&mode).ok_or_else(|| corrupt("join mode", &mode))?;

    let min: i32 = row.try_get("min_participants").map_err(backend)?;
    let max: Option<i32> = row.try_get("max_participants").map_err(backend)?;

    let reason: Option<String> = row.try_get("closure_reason").map_err(backend)?;
    let closed_at: Option<DateTime<Utc>> = row.try_get("closed_at").map_err(backend)?;
    let closed_by: Option<Uuid> = row.try_get("closed_by").map_err(backend)?;
    let manual_closure = match (reason, closed_at, closed_by) {
        (Some(reason), Some(closed_at), Some(closed_by)) => Some(ManualClosure {
            reason,
            closed_at,
            closed_by: UserId::from_uuid(closed_by),
        }),
        _ => None,
    };

    let secs = |column: &str| -> Result<Option<Duration>, StoreError> {
        let value: Option<i64> = row.try_get(column).map_err(backend)?;
        value
            .map(|v| Duration::try_seconds(v).ok_or_else(|| corrupt(column, v)))
            .transpose()
    };

    Ok(EventJoinConfig {
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(backend)?),
        start_at: row.try_get("start_at").map_err(backend)?,
        end_at: row.try_get("end_at").map_err(backend)?,
        join_opens_offset: secs("join_opens_offset_secs")?,
        join_cutoff_offset: secs("join_cutoff_offset_secs")?,
        allow_join_late: row.try_get("allow_join_late").map_err(backend)?,
        late_join_cutoff_offset: secs("late_join_cutoff_offset_secs")?,
        manual_closure,
        join_mode,
        min: u32::try_from(min).map_err(|_| corrupt("min_participants", min))?,
        max: max
            .map(|m| u32::try_from(m).map_err(|_| corrupt("max_participants", m)))
            .transpose()?,
    })
}

impl EventConfigStore for PostgresEventConfigStore {
    fn load_config(&self, event_id: EventId) -> StoreFuture<'_, Option<EventJoinConfig>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT event_id, start_at, end_at, join_opens_offset_secs,
                       join_cutoff_offset_secs, allow_join_late, late_join_cutoff_offset_secs,
                       join_mode, min_participants, max_participants,
                       closure_reason, closed_at, closed_by
                FROM event_join_configs
                WHERE event_id = $1
                ",
            )
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

            row.as_ref().map(decode).transpose()
        })
    }

    fn save_config(&self, config: EventJoinConfig) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let closure = config.manual_closure.as_ref();
            sqlx::query(
                r"
                INSERT INTO event_join_configs (
                    event_id, start_at, end_at, join_opens_offset_secs, join_cutoff_offset_secs,
                    allow_join_late, late_join_cutoff_offset_secs, join_mode,
                    min_participants, max_participants, closure_reason, closed_at, closed_by,
                    updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now())
                ON CONFLICT (event_id) DO UPDATE SET
                    start_at = EXCLUDED.start_at,
                    end_at = EXCLUDED.end_at,
                    join_opens_offset_secs = EXCLUDED.join_opens_offset_secs,
                    join_cutoff_offset_secs = EXCLUDED.join_cutoff_offset_secs,
                    allow_join_late = EXCLUDED.allow_join_late,
                    late_join_cutoff_offset_secs = EXCLUDED.late_join_cutoff_offset_secs,
                    join_mode = EXCLUDED.join_mode,
                    min_participants = EXCLUDED.min_participants,
                    max_participants = EXCLUDED.max_participants,
                    closure_reason = EXCLUDED.closure_reason,
                    closed_at = EXCLUDED.closed_at,
                    closed_by = EXCLUDED.closed_by,
                    updated_at = now()
                ",
            )
            .bind(config.event_id.as_uuid())
            .bind(config.start_at)
            .bind(config.end_at)
            .bind(offset_secs(config.join_opens_offset))
            .bind(offset_secs(config.join_cutoff_offset))
            .bind(config.allow_join_late)
            .bind(offset_secs(config.late_join_cutoff_offset))
            .bind(config.join_mode.as_str())
            .bind(to_i32(config.min)?)
            .bind(config.max.map(to_i32).transpose()?)
            .bind(closure.map(|c| c.reason.clone()))
            .bind(closure.map(|c| c.closed_at))
            .bind(closure.map(|c| *c.closed_by.as_uuid()))
            .execute(&self.pool)
            .await
            .map_err(backend)?;

            tracing::debug!(event_id = %config.event_id, "Saved event join configuration");
            Ok(())
        })
    }
}
