//! The prepared statement set compiled on every session.
//!
//! Prepared statements are connection-local: a statement compiled on one
//! physical connection is gone once that connection is replaced. Sessions
//! therefore compile the whole set on bring-up and again after every
//! successful reconnection.

use std::borrow::Cow;
use std::collections::HashMap;

use tokio_postgres::{Client, Statement};
use tracing::debug;

use crate::error::{PgError, PgResult, describe};

/// A named SQL statement to prepare on each session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementDef {
    /// Name used to look the statement up on a session.
    pub name: Cow<'static, str>,
    /// SQL text.
    pub sql: Cow<'static, str>,
}

impl StatementDef {
    /// Create a statement definition.
    pub fn new(name: impl Into<Cow<'static, str>>, sql: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// World-state-view statements used by the storage engine.
pub const WSV_STATEMENTS: &[(&str, &str)] = &[
    ("insert_role", "INSERT INTO role(role_id) VALUES ($1)"),
    (
        "insert_role_permissions",
        "INSERT INTO role_has_permissions(role_id, permission) VALUES ($1, $2::text::varbit)",
    ),
    (
        "insert_domain",
        "INSERT INTO domain(domain_id, default_role) VALUES ($1, $2)",
    ),
    (
        "insert_signatory",
        "INSERT INTO signatory(public_key) VALUES ($1) ON CONFLICT DO NOTHING",
    ),
    (
        "insert_account",
        "INSERT INTO account(account_id, domain_id, quorum, data) VALUES ($1, $2, $3, '{}')",
    ),
    (
        "insert_account_signatory",
        "INSERT INTO account_has_signatory(account_id, public_key) VALUES ($1, $2)",
    ),
    (
        "insert_account_role",
        "INSERT INTO account_has_roles(account_id, role_id) VALUES ($1, $2)",
    ),
    (
        "insert_asset",
        "INSERT INTO asset(asset_id, domain_id, precision, data) VALUES ($1, $2, $3, NULL)",
    ),
    (
        "insert_peer",
        "INSERT INTO peer(public_key, address) VALUES ($1, $2)",
    ),
    (
        "set_account_quorum",
        "UPDATE account SET quorum = $2 WHERE account_id = $1",
    ),
    (
        "upsert_account_asset",
        "INSERT INTO account_has_asset(account_id, asset_id, amount) \
         VALUES ($1, $2, $3::text::decimal) \
         ON CONFLICT (account_id, asset_id) DO UPDATE SET amount = EXCLUDED.amount",
    ),
    (
        "get_account",
        "SELECT account_id, domain_id, quorum, data::text FROM account WHERE account_id = $1",
    ),
    (
        "insert_tx_status",
        "INSERT INTO tx_status_by_hash(hash, status) VALUES ($1, $2)",
    ),
    (
        "get_tx_status",
        "SELECT status FROM tx_status_by_hash WHERE hash = $1",
    ),
];

/// The ordered set of statements every session compiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementSet {
    defs: Vec<StatementDef>,
}

impl StatementSet {
    /// Create a set from explicit definitions.
    pub fn new(defs: impl IntoIterator<Item = StatementDef>) -> Self {
        Self {
            defs: defs.into_iter().collect(),
        }
    }

    /// A set with no statements.
    pub fn empty() -> Self {
        Self { defs: Vec::new() }
    }

    /// The world-state-view statement set.
    pub fn wsv() -> Self {
        Self::new(
            WSV_STATEMENTS
                .iter()
                .map(|(name, sql)| StatementDef::new(*name, *sql)),
        )
    }

    /// Number of statements.
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Iterate over the definitions.
    pub fn iter(&self) -> impl Iterator<Item = &StatementDef> {
        self.defs.iter()
    }

    /// Prepare every statement on `client`.
    pub(crate) async fn compile(&self, client: &Client) -> PgResult<PreparedStatements> {
        let mut compiled = HashMap::with_capacity(self.defs.len());
        for def in &self.defs {
            debug!(statement = %def.name, "Preparing statement");
            let statement = client.prepare(&def.sql).await.map_err(|e| {
                PgError::query(format!(
                    "failed to prepare statement '{}': {}",
                    def.name,
                    describe(&e)
                ))
            })?;
            compiled.insert(def.name.to_string(), statement);
        }
        Ok(PreparedStatements { compiled })
    }
}

impl Default for StatementSet {
    fn default() -> Self {
        Self::wsv()
    }
}

/// Statements compiled on one physical connection.
#[derive(Debug, Default)]
pub struct PreparedStatements {
    compiled: HashMap<String, Statement>,
}

impl PreparedStatements {
    /// Look a statement up by name.
    pub fn get(&self, name: &str) -> Option<&Statement> {
        self.compiled.get(name)
    }

    /// Look a statement up by name, failing on unknown names.
    pub fn require(&self, name: &str) -> PgResult<&Statement> {
        self.get(name)
            .ok_or_else(|| PgError::query(format!("unknown prepared statement '{}'", name)))
    }

    /// Number of compiled statements.
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    /// Check if nothing is compiled.
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}
