//! `PostgreSQL` storage for the Gather join lifecycle engine.
//!
//! Implements the storage traits of `gather-core`:
//!
//! - [`PostgresEventConfigStore`]: join-related fields of the event record
//! - [`PostgresCapacityStore`]: capacity records guarded by a version column, with
//!   occupants and waitlist in child tables
//! - [`PostgresMembershipStore`]: one row per `(event, user)`, upserted
//! - [`PostgresReconcileIndex`]: selects events whose ledger and memberships disagree
//!
//! # Example
//!
//! ```no_run
//! use gather_postgres::{PostgresConfig, PostgresStores};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PostgresConfig::from_env()?;
//! let pool = config.connect().await?;
//! gather_postgres::run_migrations(&pool).await?;
//!
//! let stores = PostgresStores::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod capacity;
mod events;
mod memberships;
mod reconcile;

pub use capacity::PostgresCapacityStore;
pub use events::PostgresEventConfigStore;
pub use memberships::PostgresMembershipStore;
pub use reconcile::PostgresReconcileIndex;

use gather_core::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = include_str!("../migrations/0001_join_lifecycle.sql");

/// Errors raised while connecting to or preparing the database.
#[derive(thiserror::Error, Debug)]
pub enum PostgresError {
    /// `DATABASE_URL` is not set
    #[error("DATABASE_URL is not set")]
    MissingUrl,

    /// Connecting to the database failed
    #[error("Failed to connect: {0}")]
    Connect(#[source] sqlx::Error),

    /// Applying the schema failed
    #[error("Migration failed: {0}")]
    Migration(#[source] sqlx::Error),
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    /// Connection string
    pub database_url: String,
    /// Pool size cap
    pub max_connections: u32,
    /// Connections kept open when idle
    pub min_connections: u32,
    /// Timeout for acquiring a connection
    pub connect_timeout: Duration,
}

impl PostgresConfig {
    /// Settings for `database_url` with default pool sizes
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Load settings from `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS`,
    /// `DATABASE_MIN_CONNECTIONS` and `DATABASE_CONNECT_TIMEOUT` (seconds).
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::MissingUrl`] if `DATABASE_URL` is not set.
    pub fn from_env() -> Result<Self, PostgresError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::MissingUrl`] if `DATABASE_URL` is missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PostgresError> {
        let url = lookup("DATABASE_URL").ok_or(PostgresError::MissingUrl)?;
        let defaults = Self::new(url);
        let parse = |key: &str| lookup(key).and_then(|value| value.trim().parse::<u64>().ok());

        Ok(Self {
            max_connections: parse("DATABASE_MAX_CONNECTIONS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.max_connections),
            min_connections: parse("DATABASE_MIN_CONNECTIONS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.min_connections),
            connect_timeout: parse("DATABASE_CONNECT_TIMEOUT")
                .map_or(defaults.connect_timeout, Duration::from_secs),
            ..defaults
        })
    }

    /// Open a connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Connect`] if the database is unreachable.
    pub async fn connect(&self) -> Result<PgPool, PostgresError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.database_url)
            .await
            .map_err(PostgresError::Connect)?;

        tracing::info!(
            max_connections = self.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(pool)
    }
}

/// Create the tables if they do not exist yet. Safe to run on every start.
///
/// # Errors
///
/// Returns [`PostgresError::Migration`] if a statement fails.
pub async fn run_migrations(pool: &PgPool) -> Result<(), PostgresError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(PostgresError::Migration)?;
    tracing::info!("Join lifecycle schema is up to date");
    Ok(())
}

/// The stores and the reconcile index over one pool.
#[derive(Clone)]
pub struct PostgresStores {
    /// Event configurations
    pub events: Arc<PostgresEventConfigStore>,
    /// Capacity records
    pub capacity: Arc<PostgresCapacityStore>,
    /// Memberships
    pub memberships: Arc<PostgresMembershipStore>,
    /// Reconciliation selector spanning capacity and memberships
    pub index: Arc<PostgresReconcileIndex>,
}

impl PostgresStores {
    /// Create all stores sharing `pool`
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            events: Arc::new(PostgresEventConfigStore::from_pool(pool.clone())),
            capacity: Arc::new(PostgresCapacityStore::from_pool(pool.clone())),
            memberships: Arc::new(PostgresMembershipStore::from_pool(pool.clone())),
            index: Arc::new(PostgresReconcileIndex::from_pool(pool)),
        }
    }
}

pub(crate) fn backend(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}

pub(crate) fn corrupt(what: &str, value: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("Invalid {what} in database: {value}"))
}
