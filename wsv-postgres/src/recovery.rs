//! Two-phase-commit capability detection and crash recovery.
//!
//! Blocks are committed through a prepared transaction named after the
//! database. A crash between `PREPARE TRANSACTION` and `COMMIT PREPARED`
//! leaves that transaction dangling; the primary session rolls it back once
//! while the pool is being built.

use tracing::debug;

use crate::error::{PgError, PgResult, describe};
use crate::session::Session;

/// Prefix of the prepared transaction name.
pub const PREPARED_BLOCK_PREFIX: &str = "prepared_block";

/// Name of the prepared transaction used for `dbname`.
///
/// The database name is appended as is. Names containing a single quote
/// would break the rollback statement's literal.
pub fn prepared_block_name(dbname: &str) -> String {
    format!("{}{}", PREPARED_BLOCK_PREFIX, dbname)
}

/// Check whether the server allows prepared transactions
/// (`max_prepared_transactions` is nonzero).
///
/// Any failure, including a lost connection, reads as "not available".
pub async fn prepared_transactions_available(session: &Session) -> bool {
    let client = match session.client() {
        Ok(client) => client,
        Err(e) => {
            debug!(slot = session.slot(), error = %e, "Capability probe skipped");
            return false;
        }
    };

    match client
        .query_one(
            "SELECT current_setting('max_prepared_transactions')::int",
            &[],
        )
        .await
    {
        Ok(row) => match row.try_get::<_, i32>(0) {
            Ok(count) => count != 0,
            Err(e) => {
                debug!(error = %describe(&e), "Unexpected max_prepared_transactions value");
                false
            }
        },
        Err(e) => {
            debug!(error = %describe(&e), "Capability probe failed");
            false
        }
    }
}

/// Roll back the prepared transaction `prepared_block_name`.
///
/// Failing here is common (nothing was left behind) and callers are expected
/// to log the error and carry on.
pub async fn rollback_prepared(session: &Session, prepared_block_name: &str) -> PgResult<()> {
    let client = session.client().map_err(|e| PgError::Recovery(e.to_string()))?;
    client
        .batch_execute(&format!("ROLLBACK PREPARED '{}';", prepared_block_name))
        .await
        .map_err(|e| PgError::Recovery(describe(&e)))
}
