//! Storage bootstrap: database creation, pool construction and recovery.

use std::sync::Arc;

use tracing::{Instrument, Span, debug, info, info_span};

use crate::config::PgOptions;
use crate::error::{PgError, PgResult};
use crate::failover::{FailoverCoordinator, ReconnectOptions};
use crate::initializer::{InitConnection, InitDatabase, SessionInitializer};
use crate::pool::{ConnectionPool, PoolWrapper};
use crate::reconnect::ReconnectionStrategyFactory;
use crate::recovery::{prepared_block_name, prepared_transactions_available};
use crate::schema::{self, WsvSchema};
use crate::session::Session;
use crate::settings::StorageSettings;
use crate::statement::StatementSet;

/// Builds the storage session pool.
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use wsv_postgres::prelude::*;
///
/// let options = PgOptions::parse(
///     "host=localhost user=postgres dbname=ledger",
///     DEFAULT_DATABASE_NAME,
/// )?;
/// PgConnectionInit::create_database_if_not_exist(
///     options.dbname(),
///     options.options_string_without_dbname(),
/// )
/// .await?;
///
/// let init = PgConnectionInit::new(WsvSchema::new(45, 6));
/// let pool = init
///     .prepare_connection_pool(
///         Arc::new(KTimesReconnectionStrategyFactory::new(3)),
///         &options,
///         10,
///         tracing::info_span!("storage"),
///     )
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct PgConnectionInit {
    schema: String,
    statements: Arc<StatementSet>,
    reconnect: ReconnectOptions,
}

impl PgConnectionInit {
    /// Bootstrap with the world-state-view schema and statements.
    pub fn new(schema: WsvSchema) -> Self {
        Self::with_schema_sql(schema.ddl())
    }

    /// Bootstrap applying arbitrary DDL text on the primary session.
    pub fn with_schema_sql(ddl: impl Into<String>) -> Self {
        Self {
            schema: ddl.into(),
            statements: Arc::new(StatementSet::wsv()),
            reconnect: ReconnectOptions::default(),
        }
    }

    /// Build from loaded settings.
    pub fn from_settings(settings: &StorageSettings) -> PgResult<Self> {
        Ok(Self::new(settings.schema.wsv_schema()).reconnect_options(settings.reconnect_options()?))
    }

    /// Replace the statements compiled on every session.
    pub fn statements(mut self, statements: StatementSet) -> Self {
        self.statements = Arc::new(statements);
        self
    }

    /// Set reconnection timeouts.
    pub fn reconnect_options(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// DDL applied on the primary session.
    pub fn schema_sql(&self) -> &str {
        &self.schema
    }

    /// Create `dbname` unless it exists. See
    /// [`create_database_if_not_exist`](crate::schema::create_database_if_not_exist).
    pub async fn create_database_if_not_exist(
        dbname: &str,
        options_without_dbname: &str,
    ) -> PgResult<bool> {
        schema::create_database_if_not_exist(dbname, options_without_dbname).await
    }

    /// Open `size` sessions against `options`, one after another.
    ///
    /// Either every session opens or none is kept: on the first failure the
    /// sessions opened so far are closed before the error is returned.
    pub async fn init_pool(options: &PgOptions, size: usize) -> PgResult<ConnectionPool> {
        if size == 0 {
            return Err(PgError::config("pool size must be at least 1"));
        }
        let config = options
            .to_pg_config()
            .map_err(|e| PgError::PoolInit(e.to_string()))?;

        let mut sessions = Vec::with_capacity(size);
        for slot in 0..size {
            match Session::open(slot, &config).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    debug!(slot, opened = sessions.len(), "Releasing partially opened pool");
                    for session in sessions {
                        session.close().await;
                    }
                    return Err(PgError::PoolInit(e.to_string()));
                }
            }
        }

        Ok(ConnectionPool::new(sessions))
    }

    /// Build the storage pool.
    ///
    /// Opens `pool_size` sessions, probes two-phase-commit support, rolls
    /// back a dangling prepared transaction and applies the schema on the
    /// primary session, then brings every session up with its own failover
    /// callback. Nothing is returned until every session is `Ready`.
    pub async fn prepare_connection_pool(
        &self,
        strategy_factory: Arc<dyn ReconnectionStrategyFactory>,
        options: &PgOptions,
        pool_size: usize,
        log: Span,
    ) -> PgResult<PoolWrapper> {
        let span = info_span!(parent: &log, "prepare_pool", database = %options.dbname(), pool_size);
        async {
            let mut pool = Self::init_pool(options, pool_size).await?;
            let enable_prepared_transactions = prepared_transactions_available(pool.primary()).await;
            debug!(enabled = enable_prepared_transactions, "Prepared transactions probed");

            match self
                .initialize_sessions(&mut pool, strategy_factory, options, enable_prepared_transactions, &log)
                .await
            {
                Ok(coordinator) => {
                    info!("Storage pool prepared");
                    Ok(PoolWrapper::new(
                        pool,
                        coordinator.into_holder(),
                        enable_prepared_transactions,
                    ))
                }
                Err(e) => {
                    pool.close().await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn initialize_sessions(
        &self,
        pool: &mut ConnectionPool,
        strategy_factory: Arc<dyn ReconnectionStrategyFactory>,
        options: &PgOptions,
        enable_prepared_transactions: bool,
        log: &Span,
    ) -> PgResult<FailoverCoordinator> {
        let block_name = prepared_block_name(options.dbname());
        let initializer = SessionInitializer::new(self.statements.clone(), log.clone());
        let mut coordinator =
            FailoverCoordinator::new(strategy_factory, options, self.reconnect, log.clone())?;

        let Some((primary, rest)) = pool.sessions_mut().split_first_mut() else {
            return Err(PgError::config("pool size must be at least 1"));
        };

        initializer
            .initialize(
                primary,
                InitConnection::AttachFailover(&mut coordinator),
                InitDatabase::RollbackThenApplySchema {
                    rollback: enable_prepared_transactions.then_some(block_name.as_str()),
                    schema: &self.schema,
                },
            )
            .await?;

        for session in rest {
            initializer
                .initialize(
                    session,
                    InitConnection::AttachFailover(&mut coordinator),
                    InitDatabase::None,
                )
                .await?;
        }

        Ok(coordinator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::KTimesReconnectionStrategyFactory;

    #[tokio::test]
    async fn test_zero_sized_pool_is_rejected() {
        let options = PgOptions::parse("host=localhost dbname=ledger", "x").unwrap();
        let err = PgConnectionInit::init_pool(&options, 0).await.unwrap_err();
        assert!(matches!(err, PgError::Config(_)));
    }

    #[tokio::test]
    async fn test_invalid_options_fail_pool_construction() {
        let options = PgOptions::parse("host=localhost users=nobody dbname=test", "x").unwrap();
        let err = PgConnectionInit::new(WsvSchema::new(8, 8))
            .prepare_connection_pool(
                Arc::new(KTimesReconnectionStrategyFactory::new(0)),
                &options,
                10,
                Span::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::PoolInit(_)));
    }

    #[test]
    fn test_custom_schema() {
        let init = PgConnectionInit::with_schema_sql("CREATE TABLE IF NOT EXISTS t (x int);")
            .statements(StatementSet::empty());
        assert_eq!(init.schema_sql(), "CREATE TABLE IF NOT EXISTS t (x int);");
        assert!(init.statements.is_empty());
    }
}
