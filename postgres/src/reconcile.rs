//! Cross-table query selecting events for the background reconciler.
//!
//! Mirrors [`gather_core::reconcile::needs_reconcile`] in SQL so a pass only loads the
//! events that need it.

use crate::backend;
use chrono::{DateTime, Utc};
use gather_core::EventId;
use gather_core::store::{ReconcileIndex, StoreFuture};
use sqlx::PgPool;
use uuid::Uuid;

/// `PostgreSQL`-backed [`ReconcileIndex`] over the capacity and membership tables.
#[derive(Clone)]
pub struct PostgresReconcileIndex {
    pool: PgPool,
}

impl PostgresReconcileIndex {
    /// Create an index using an existing pool
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ReconcileIndex for PostgresReconcileIndex {
    fn events_needing_reconcile(
        &self,
        settled_before: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<EventId>> {
        Box::pin(async move {
            let events: Vec<Uuid> = sqlx::query_scalar(
                r"
                SELECT c.event_id FROM event_capacity c
                WHERE (
                    EXISTS (SELECT 1 FROM event_waitlist w WHERE w.event_id = c.event_id)
                    AND (
                        c.max_participants IS NULL
                        OR (SELECT COUNT(*) FROM event_capacity_occupants o
                            WHERE o.event_id = c.event_id) < c.max_participants
                    )
                )
                OR EXISTS (
                    SELECT 1 FROM event_capacity_occupants o
                    LEFT JOIN memberships m
                        ON m.event_id = o.event_id AND m.user_id = o.user_id
                    WHERE o.event_id = c.event_id
                      AND m.status IS DISTINCT FROM 'JOINED'
                      AND (m.status = 'WAITLIST' OR o.admitted_at <= $1)
                )
                OR EXISTS (
                    SELECT 1 FROM event_waitlist w
                    LEFT JOIN memberships m
                        ON m.event_id = w.event_id AND m.user_id = w.user_id
                    WHERE w.event_id = c.event_id
                      AND m.status IS DISTINCT FROM 'WAITLIST'
                      AND w.enqueued_at <= $1
                )
                OR EXISTS (
                    SELECT 1 FROM memberships m
                    WHERE m.event_id = c.event_id
                      AND (
                        (m.status = 'JOINED' AND m.role <> 'OWNER')
                        OR (
                            m.status = 'WAITLIST'
                            AND NOT EXISTS (
                                SELECT 1 FROM event_waitlist w
                                WHERE w.event_id = m.event_id AND w.user_id = m.user_id
                            )
                        )
                      )
                      AND NOT EXISTS (
                        SELECT 1 FROM event_capacity_occupants o
                        WHERE o.event_id = m.event_id AND o.user_id = m.user_id
                      )
                )
                ORDER BY c.event_id
                ",
            )
            .bind(settled_before)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

            tracing::debug!(events = events.len(), "Selected events for reconciliation");
            Ok(events.into_iter().map(EventId::from_uuid).collect())
        })
    }
}
