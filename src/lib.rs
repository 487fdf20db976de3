//! # wsv-store
//!
//! Storage bootstrap for the ledger's world-state view.
//!
//! wsv-store provides:
//! - Idempotent creation of the storage database and its schema
//! - A fixed-size pool of prepared PostgreSQL sessions
//! - Recovery of a prepared transaction left behind by a crash
//! - Automatic per-session reconnection with pluggable strategies
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wsv_store::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wsv_store::PgError> {
//!     wsv_store::postgres::logging::init();
//!
//!     let settings = StorageSettings::from_file("storage.toml")?;
//!     let options = settings.pg_options()?;
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
//!     let rows = session.query_prepared("get_account", &[&"alice@wonderland"]).await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// PostgreSQL bootstrap, pooling and failover.
pub mod postgres {
    pub use wsv_postgres::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use wsv_postgres::prelude::*;
}

// Re-export key types at the crate root
pub use postgres::{PgConnectionInit, PgError, PgOptions, PgResult, PoolWrapper, StorageSettings};
