//! Session bring-up.
//!
//! The same ordered sequence serves fresh pool construction and restoration
//! after a reconnect; the two hook values select what runs in between:
//!
//! 1. attach the notice forwarder,
//! 2. run the connection hook (bind failover on fresh sessions),
//! 3. run the database hook (recovery and DDL, primary slot only),
//! 4. compile the prepared statement set.

use std::sync::Arc;

use tracing::{Span, debug, info_span, warn};

use crate::error::{PgError, PgResult, describe};
use crate::failover::FailoverCoordinator;
use crate::recovery::rollback_prepared;
use crate::session::Session;
use crate::statement::StatementSet;

/// Per-connection hook run during bring-up.
pub enum InitConnection<'a> {
    /// Nothing to do (restoring a session that already has its callback).
    None,
    /// Bind a failover callback to the session.
    AttachFailover(&'a mut FailoverCoordinator),
}

/// Database-level hook run during bring-up.
#[derive(Debug, Clone, Copy)]
pub enum InitDatabase<'a> {
    /// Nothing to do.
    None,
    /// Roll back a dangling prepared transaction (when `rollback` is set),
    /// then apply the schema DDL verbatim.
    RollbackThenApplySchema {
        /// Prepared transaction to roll back, if two-phase commit is enabled.
        rollback: Option<&'a str>,
        /// DDL text.
        schema: &'a str,
    },
}

/// Brings raw sessions to the `Ready` state.
#[derive(Debug, Clone)]
pub struct SessionInitializer {
    statements: Arc<StatementSet>,
    log: Span,
}

impl SessionInitializer {
    /// Create an initializer compiling `statements` and logging under `log`.
    pub fn new(statements: Arc<StatementSet>, log: Span) -> Self {
        Self { statements, log }
    }

    /// Statements compiled on every session.
    pub fn statements(&self) -> &StatementSet {
        &self.statements
    }

    /// Run the bring-up sequence on `session`.
    pub async fn initialize(
        &self,
        session: &mut Session,
        on_init_connection: InitConnection<'_>,
        on_init_database: InitDatabase<'_>,
    ) -> PgResult<()> {
        let slot = session.slot();
        session.forward_notices(info_span!(parent: &self.log, "notices", slot));

        if let InitConnection::AttachFailover(coordinator) = on_init_connection {
            coordinator.attach(session, self.clone())?;
        }

        if let InitDatabase::RollbackThenApplySchema { rollback, schema } = on_init_database {
            if let Some(name) = rollback {
                if let Err(e) = rollback_prepared(session, name).await {
                    warn!(parent: &self.log, error = %e, "rollback on creation has failed");
                }
            }
            session
                .client()?
                .batch_execute(schema)
                .await
                .map_err(|e| PgError::Schema(format!("failed to apply schema: {}", describe(&e))))?;
            debug!(parent: &self.log, slot, "Schema applied");
        }

        session.compile_statements(&self.statements).await?;
        session.mark_ready();
        debug!(
            parent: &self.log,
            slot,
            statements = session.prepared().len(),
            "Session ready"
        );
        Ok(())
    }
}
