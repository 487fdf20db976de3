//! Database creation and the world-state-view schema.

use tracing::{debug, info};

use crate::error::{PgError, PgResult, describe};
use crate::session::RawConnection;

/// The relational world-state-view schema.
///
/// The widths of the two permission bit sets come from the ledger's
/// permission model and are supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsvSchema {
    role_permission_bits: usize,
    grantable_permission_bits: usize,
}

impl WsvSchema {
    /// Create the schema for the given permission set widths.
    pub fn new(role_permission_bits: usize, grantable_permission_bits: usize) -> Self {
        Self {
            role_permission_bits,
            grantable_permission_bits,
        }
    }

    /// Width of `role_has_permissions.permission`.
    pub fn role_permission_bits(&self) -> usize {
        self.role_permission_bits
    }

    /// Width of `account_has_grantable_permissions.permission`.
    pub fn grantable_permission_bits(&self) -> usize {
        self.grantable_permission_bits
    }

    /// DDL text. Every statement is guarded by `IF NOT EXISTS`, so applying
    /// it repeatedly is harmless.
    pub fn ddl(&self) -> String {
        format!(
            r#"
CREATE TABLE IF NOT EXISTS role (
    role_id character varying(32),
    PRIMARY KEY (role_id)
);
CREATE TABLE IF NOT EXISTS domain (
    domain_id character varying(255),
    default_role character varying(32) NOT NULL REFERENCES role(role_id),
    PRIMARY KEY (domain_id)
);
CREATE TABLE IF NOT EXISTS signatory (
    public_key varchar NOT NULL,
    PRIMARY KEY (public_key)
);
CREATE TABLE IF NOT EXISTS account (
    account_id character varying(288),
    domain_id character varying(255) NOT NULL REFERENCES domain,
    quorum int NOT NULL,
    data JSONB,
    PRIMARY KEY (account_id)
);
CREATE TABLE IF NOT EXISTS account_has_signatory (
    account_id character varying(288) NOT NULL REFERENCES account,
    public_key varchar NOT NULL REFERENCES signatory,
    PRIMARY KEY (account_id, public_key)
);
CREATE TABLE IF NOT EXISTS peer (
    public_key varchar NOT NULL,
    address character varying(261) NOT NULL UNIQUE,
    PRIMARY KEY (public_key)
);
CREATE TABLE IF NOT EXISTS asset (
    asset_id character varying(288),
    domain_id character varying(255) NOT NULL REFERENCES domain,
    precision int NOT NULL,
    data json,
    PRIMARY KEY (asset_id)
);
CREATE TABLE IF NOT EXISTS account_has_asset (
    account_id character varying(288) NOT NULL REFERENCES account,
    asset_id character varying(288) NOT NULL REFERENCES asset,
    amount decimal NOT NULL,
    PRIMARY KEY (account_id, asset_id)
);
CREATE TABLE IF NOT EXISTS role_has_permissions (
    role_id character varying(32) NOT NULL REFERENCES role,
    permission bit({role_bits}) NOT NULL,
    PRIMARY KEY (role_id)
);
CREATE TABLE IF NOT EXISTS account_has_roles (
    account_id character varying(288) NOT NULL REFERENCES account,
    role_id character varying(32) NOT NULL REFERENCES role,
    PRIMARY KEY (account_id, role_id)
);
CREATE TABLE IF NOT EXISTS account_has_grantable_permissions (
    permittee_account_id character varying(288) NOT NULL REFERENCES account,
    account_id character varying(288) NOT NULL REFERENCES account,
    permission bit({grantable_bits}) NOT NULL,
    PRIMARY KEY (permittee_account_id, account_id)
);
CREATE TABLE IF NOT EXISTS position_by_hash (
    hash varchar,
    height bigint,
    index bigint
);

CREATE TABLE IF NOT EXISTS tx_status_by_hash (
    hash varchar,
    status boolean
);
CREATE INDEX IF NOT EXISTS tx_status_by_hash_hash_index ON tx_status_by_hash USING hash (hash);

CREATE TABLE IF NOT EXISTS height_by_account_set (
    account_id text,
    height bigint
);
CREATE TABLE IF NOT EXISTS index_by_creator_height (
    id serial,
    creator_id text,
    height bigint,
    index bigint
);
CREATE TABLE IF NOT EXISTS position_by_account_asset (
    account_id text,
    asset_id text,
    height bigint,
    index bigint
);
"#,
            role_bits = self.role_permission_bits,
            grantable_bits = self.grantable_permission_bits,
        )
    }
}

/// Create `dbname` unless it already exists.
///
/// Connects with `options_without_dbname` (no database selected). Returns
/// `true` when the database was created and `false` when it was already
/// there. The check and the creation are not atomic: concurrent creators
/// must be serialized by the caller.
pub async fn create_database_if_not_exist(
    dbname: &str,
    options_without_dbname: &str,
) -> PgResult<bool> {
    let config = options_without_dbname
        .parse::<tokio_postgres::Config>()
        .map_err(|e| PgError::schema(describe(&e)))?;
    let conn = RawConnection::open(&config)
        .await
        .map_err(|e| PgError::schema(describe(&e)))?;

    let result = create_if_missing(&conn, dbname).await;
    conn.close().await;
    result
}

async fn create_if_missing(conn: &RawConnection, dbname: &str) -> PgResult<bool> {
    let client = conn.client();
    let row = client
        .query_one(
            "SELECT count(datname) FROM pg_catalog.pg_database WHERE datname = $1",
            &[&dbname],
        )
        .await
        .map_err(|e| PgError::schema(describe(&e)))?;
    let existing: i64 = row.get(0);

    if existing != 0 {
        debug!(database = %dbname, "Database already exists");
        return Ok(false);
    }

    client
        .batch_execute(&format!("CREATE DATABASE {}", dbname))
        .await
        .map_err(|e| PgError::schema(describe(&e)))?;
    info!(database = %dbname, "Database created");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_uses_permission_widths() {
        let ddl = WsvSchema::new(47, 6).ddl();
        assert!(ddl.contains("permission bit(47) NOT NULL,\n    PRIMARY KEY (role_id)"));
        assert!(ddl.contains(
            "permission bit(6) NOT NULL,\n    PRIMARY KEY (permittee_account_id, account_id)"
        ));
    }

    #[test]
    fn test_ddl_is_idempotent() {
        let ddl = WsvSchema::new(8, 8).ddl();
        let statements: Vec<_> = ddl
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        assert_eq!(statements.len(), 17);
        for statement in statements {
            assert!(
                statement.starts_with("CREATE TABLE IF NOT EXISTS")
                    || statement.starts_with("CREATE INDEX IF NOT EXISTS"),
                "unguarded statement: {}",
                statement
            );
        }
    }

    #[test]
    fn test_ddl_tables() {
        let ddl = WsvSchema::new(8, 8).ddl();
        for table in [
            "role",
            "domain",
            "signatory",
            "account",
            "account_has_signatory",
            "peer",
            "asset",
            "account_has_asset",
            "role_has_permissions",
            "account_has_roles",
            "account_has_grantable_permissions",
            "position_by_hash",
            "tx_status_by_hash",
            "height_by_account_set",
            "index_by_creator_height",
            "position_by_account_asset",
        ] {
            assert!(
                ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", table)),
                "missing table {}",
                table
            );
        }
    }

    #[tokio::test]
    async fn test_create_database_with_malformed_options() {
        let err = create_database_if_not_exist("db", "host=localhost users=nobody")
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Schema(_)));
        assert!(err.to_string().starts_with("Connection to PostgreSQL broken: "));
    }
}
