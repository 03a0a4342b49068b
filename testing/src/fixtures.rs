//! Test fixtures: configuration builder and a fully wired service.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Fixtures fail loudly
#![allow(clippy::missing_panics_doc)]

use crate::mocks::ManualClock;
use crate::stores::{
    InMemoryCapacityStore, InMemoryEventConfigStore, InMemoryMembershipStore,
    InMemoryReconcileIndex,
};
use chrono::{DateTime, Duration, Utc};
use gather_core::retry::RetryPolicy;
use gather_core::store::{CapacityStore, MembershipStore};
use gather_core::{
    EventId, EventJoinConfig, JoinEnvironment, JoinMode, JoinService, ManualClosure, UserId,
};
use std::sync::Arc;

/// Builder for [`EventJoinConfig`] with test-friendly defaults: an `OPEN`, uncapped,
/// two-hour event with no offsets.
#[derive(Debug, Clone)]
pub struct EventConfigBuilder {
    config: EventJoinConfig,
}

impl EventConfigBuilder {
    /// Event starting at `start_at`
    #[must_use]
    pub fn starting_at(start_at: DateTime<Utc>) -> Self {
        Self {
            config: EventJoinConfig::new(
                EventId::new(),
                start_at,
                start_at + Duration::hours(2),
                JoinMode::Open,
                None,
            ),
        }
    }

    /// Event starting `lead` after `now`
    #[must_use]
    pub fn starting_in(now: DateTime<Utc>, lead: Duration) -> Self {
        Self::starting_at(now + lead)
    }

    /// Event length
    #[must_use]
    pub fn lasting(mut self, length: Duration) -> Self {
        self.config.end_at = self.config.start_at + length;
        self
    }

    /// Join mode
    #[must_use]
    pub const fn mode(mut self, mode: JoinMode) -> Self {
        self.config.join_mode = mode;
        self
    }

    /// Maximum participants
    #[must_use]
    pub const fn max(mut self, max: u32) -> Self {
        self.config.max = Some(max);
        self
    }

    /// Joining opens this long before the start
    #[must_use]
    pub const fn opens_before(mut self, offset: Duration) -> Self {
        self.config.join_opens_offset = Some(offset);
        self
    }

    /// Joining closes this long before the start
    #[must_use]
    pub const fn cutoff_before(mut self, offset: Duration) -> Self {
        self.config.join_cutoff_offset = Some(offset);
        self
    }

    /// Allow late joining, optionally until this long after the start
    #[must_use]
    pub const fn late_join(mut self, until: Option<Duration>) -> Self {
        self.config.allow_join_late = true;
        self.config.late_join_cutoff_offset = until;
        self
    }

    /// Manually closed with a reason
    #[must_use]
    pub fn closed(mut self, reason: &str, by: UserId) -> Self {
        self.config.manual_closure = Some(ManualClosure {
            reason: reason.to_string(),
            closed_at: self.config.start_at - Duration::days(1),
            closed_by: by,
        });
        self
    }

    /// Finish the configuration
    #[must_use]
    pub fn build(self) -> EventJoinConfig {
        self.config
    }
}

/// A [`JoinService`] over in-memory stores and a manual clock, with handles to every
/// store for inspection and fault injection.
pub struct TestContext {
    /// Service under test
    pub service: Arc<JoinService>,
    /// Clock driving the service
    pub clock: ManualClock,
    /// Event configurations
    pub events: InMemoryEventConfigStore,
    /// Capacity records
    pub capacity: InMemoryCapacityStore,
    /// Memberships
    pub memberships: InMemoryMembershipStore,
    /// Owner of events registered through [`TestContext::register`]
    pub owner: UserId,
    capacity_store: Arc<dyn CapacityStore>,
}

impl TestContext {
    /// Context whose clock starts at `now`
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        let capacity = InMemoryCapacityStore::new();
        Self::with_capacity_store(now, capacity.clone(), Arc::new(capacity))
    }

    /// Context whose ledger writes go through `store` (e.g. a
    /// [`ContendedCapacityStore`](crate::ContendedCapacityStore) wrapping `capacity`).
    #[must_use]
    pub fn with_capacity_store(
        now: DateTime<Utc>,
        capacity: InMemoryCapacityStore,
        store: Arc<dyn CapacityStore>,
    ) -> Self {
        let clock = ManualClock::new(now);
        let events = InMemoryEventConfigStore::new();
        let memberships = InMemoryMembershipStore::new();
        let env = JoinEnvironment {
            clock: Arc::new(clock.clone()),
            events: Arc::new(events.clone()),
            capacity: Arc::clone(&store),
            memberships: Arc::new(memberships.clone()),
            index: Arc::new(InMemoryReconcileIndex::new(
                capacity.clone(),
                memberships.clone(),
            )),
        };
        Self {
            service: Arc::new(JoinService::new(env, test_retry_policy())),
            clock,
            events,
            capacity,
            memberships,
            owner: UserId::new(),
            capacity_store: store,
        }
    }

    /// A second service sharing this context's clock and stores, with its membership
    /// writes going through `memberships`. Stands in for another instance of the engine.
    #[must_use]
    pub fn peer_service(&self, memberships: Arc<dyn MembershipStore>) -> JoinService {
        let env = JoinEnvironment {
            clock: Arc::new(self.clock.clone()),
            events: Arc::new(self.events.clone()),
            capacity: Arc::clone(&self.capacity_store),
            memberships,
            index: Arc::new(InMemoryReconcileIndex::new(
                self.capacity.clone(),
                self.memberships.clone(),
            )),
        };
        JoinService::new(env, test_retry_policy())
    }

    /// Register `config` with [`TestContext::owner`] as owner.
    pub async fn register(&self, config: EventJoinConfig) -> EventId {
        let event_id = config.event_id;
        self.service
            .register_event(config, self.owner)
            .await
            .expect("event registration should succeed");
        event_id
    }
}

/// Retry policy without jitter and with tiny delays for fast, repeatable tests
#[must_use]
pub fn test_retry_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(5)
        .initial_delay(std::time::Duration::from_millis(1))
        .max_delay(std::time::Duration::from_millis(5))
        .jitter(false)
        .build()
}

/// Install a test-friendly tracing subscriber once. Later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
