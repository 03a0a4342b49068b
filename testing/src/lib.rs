//! # Gather Testing
//!
//! Testing utilities for the Gather join lifecycle engine.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory implementations of the storage traits
//! - [`ContendedCapacityStore`], which makes capacity writes lose races on demand
//! - [`ReducerTest`], a Given-When-Then harness for reducers
//! - Fixtures: [`EventConfigBuilder`] and a fully wired [`TestContext`]
//! - proptest strategies for join configurations
//!
//! ## Example
//!
//! ```
//! use gather_testing::{EventConfigBuilder, TestContext, test_clock};
//! use gather_core::{JoinMode, MembershipStatus, UserId};
//! use chrono::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let ctx = TestContext::new(test_clock().now_value());
//! let config = EventConfigBuilder::starting_in(ctx.clock.now_value(), Duration::days(1))
//!     .mode(JoinMode::Open)
//!     .max(2)
//!     .build();
//! let event_id = ctx.register(config).await;
//!
//! let user = UserId::new();
//! let status = ctx.service.request_join(event_id, user).await.unwrap();
//! assert_eq!(status, MembershipStatus::Joined);
//! # }
//! ```

pub mod fixtures;
pub mod mocks;
pub mod properties;
pub mod stores;

pub use fixtures::{EventConfigBuilder, TestContext, init_test_tracing, test_retry_policy};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use reducer_test::ReducerTest;
pub use stores::{
    ContendedCapacityStore, InMemoryCapacityStore, InMemoryEventConfigStore,
    InMemoryMembershipStore, InMemoryReconcileIndex,
};
