//! # wsv-postgres
//!
//! PostgreSQL bootstrap and resilience layer for the ledger's world-state
//! view.
//!
//! This crate provides:
//! - Idempotent database creation and schema application
//! - A fixed-size pool of sessions, opened all-or-nothing
//! - Rollback of a prepared transaction left dangling by a crash
//! - Per-session failover driven by a pluggable reconnection strategy
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wsv_postgres::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> PgResult<()> {
//!     let settings = StorageSettings::from_file("storage.toml")?;
//!     let options = settings.pg_options()?;
//!
//!     PgConnectionInit::create_database_if_not_exist(
//!         options.dbname(),
//!         options.options_string_without_dbname(),
//!     )
//!     .await?;
//!
//!     let pool = PgConnectionInit::from_settings(&settings)?
//!         .prepare_connection_pool(
//!             settings.strategy_factory()?,
//!             &options,
//!             settings.pool_size,
//!             tracing::info_span!("storage"),
//!         )
//!         .await?;
//!
//!     let mut session = pool.acquire().await?;
//!     session.execute_prepared("insert_role", &[&"admin"]).await?;
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod failover;
pub mod initializer;
pub mod logging;
pub mod pool;
pub mod reconnect;
pub mod recovery;
pub mod schema;
pub mod session;
pub mod settings;
pub mod statement;

pub use bootstrap::PgConnectionInit;
pub use config::{DEFAULT_DATABASE_NAME, PgOptions, PgOptionsBuilder};
pub use error::{PgError, PgResult};
pub use failover::{FailoverCallback, FailoverCallbackHolder, FailoverCoordinator, ReconnectOptions};
pub use initializer::{InitConnection, InitDatabase, SessionInitializer};
pub use pool::{ConnectionPool, PoolStatus, PoolWrapper, PooledSession};
pub use reconnect::{
    Decision, ExponentialBackoffStrategy, ExponentialBackoffStrategyFactory,
    KTimesReconnectionStrategy, KTimesReconnectionStrategyFactory, ReconnectionStrategy,
    ReconnectionStrategyFactory,
};
pub use recovery::{prepared_block_name, prepared_transactions_available, rollback_prepared};
pub use schema::{WsvSchema, create_database_if_not_exist};
pub use session::{Session, SessionState};
pub use settings::StorageSettings;
pub use statement::{StatementDef, StatementSet};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::bootstrap::PgConnectionInit;
    pub use crate::config::{DEFAULT_DATABASE_NAME, PgOptions};
    pub use crate::error::{PgError, PgResult};
    pub use crate::pool::{PoolWrapper, PooledSession};
    pub use crate::reconnect::{
        ExponentialBackoffStrategyFactory, KTimesReconnectionStrategyFactory,
        ReconnectionStrategyFactory,
    };
    pub use crate::schema::WsvSchema;
    pub use crate::session::{Session, SessionState};
    pub use crate::settings::StorageSettings;
}
