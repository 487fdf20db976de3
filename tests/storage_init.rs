//! Integration tests for storage bootstrap against a live PostgreSQL server.
//!
//! These tests are ignored by default. Run them with:
//! ```bash
//! docker run -d -p 5432:5432 -e POSTGRES_PASSWORD=mysecretpassword postgres
//! cargo test --test storage_init -- --ignored
//! ```
//!
//! `WSV_TEST_PG_OPTIONS` overrides the connection options (without a
//! database name).

use std::env;
use std::sync::Arc;

use tokio_postgres::NoTls;
use tracing::Span;
use wsv_store::postgres::{
    DEFAULT_DATABASE_NAME, KTimesReconnectionStrategyFactory, SessionState, WsvSchema,
};
use wsv_store::{PgConnectionInit, PgError, PgOptions};

const POOL_SIZE: usize = 10;

fn pg_options_without_dbname() -> String {
    env::var("WSV_TEST_PG_OPTIONS").unwrap_or_else(|_| {
        "host=localhost port=5432 user=postgres password=mysecretpassword".into()
    })
}

fn random_dbname() -> String {
    format!("d{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn options_for(dbname: &str) -> PgOptions {
    PgOptions::parse(
        &format!("{} dbname={}", pg_options_without_dbname(), dbname),
        DEFAULT_DATABASE_NAME,
    )
    .expect("valid test options")
}

async fn admin() -> tokio_postgres::Client {
    let (client, connection) = tokio_postgres::connect(&pg_options_without_dbname(), NoTls)
        .await
        .expect("admin connection");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn database_count(dbname: &str) -> i64 {
    admin()
        .await
        .query_one(
            "SELECT count(*) FROM pg_catalog.pg_database WHERE datname = $1",
            &[&dbname],
        )
        .await
        .expect("catalog query")
        .get(0)
}

async fn drop_database(dbname: &str) {
    admin()
        .await
        .batch_execute(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", dbname))
        .await
        .expect("drop database");
}

/// Creating the same database twice reports creation only once.
#[tokio::test]
#[ignore = "requires a running PostgreSQL server"]
async fn test_create_database_if_not_exist() {
    let dbname = random_dbname();

    let created =
        PgConnectionInit::create_database_if_not_exist(&dbname, &pg_options_without_dbname())
            .await
            .expect("first creation");
    assert!(created);

    let created =
        PgConnectionInit::create_database_if_not_exist(&dbname, &pg_options_without_dbname())
            .await
            .expect("second creation");
    assert!(!created);
    assert_eq!(database_count(&dbname).await, 1);

    drop_database(&dbname).await;
    assert_eq!(database_count(&dbname).await, 0);
}

/// A prepared pool has every session ready and the schema applied.
#[tokio::test]
#[ignore = "requires a running PostgreSQL server"]
async fn test_prepare_connection_pool() {
    let dbname = random_dbname();
    let options = options_for(&dbname);
    PgConnectionInit::create_database_if_not_exist(
        options.dbname(),
        options.options_string_without_dbname(),
    )
    .await
    .expect("database creation");

    let pool = PgConnectionInit::new(WsvSchema::new(45, 6))
        .prepare_connection_pool(
            Arc::new(KTimesReconnectionStrategyFactory::new(3)),
            &options,
            POOL_SIZE,
            Span::none(),
        )
        .await
        .expect("pool preparation");

    assert_eq!(pool.size(), POOL_SIZE);
    assert_eq!(pool.failover().len(), POOL_SIZE);
    let states = pool.session_states();
    assert_eq!(states.len(), POOL_SIZE);
    assert!(states.iter().all(|(_, state)| *state == SessionState::Ready));

    {
        let mut session = pool.acquire().await.expect("lease");
        let tables: i64 = session
            .query_one(
                "SELECT count(*) FROM information_schema.tables WHERE table_name = 'account_has_asset'",
                &[],
            )
            .await
            .expect("schema query")
            .get(0);
        assert_eq!(tables, 1);

        session
            .execute_prepared("insert_role", &[&"user"])
            .await
            .expect("insert role");
        let inserted = session
            .execute_prepared("insert_domain", &[&"test", &"user"])
            .await
            .expect("insert domain");
        assert_eq!(inserted, 1);

        let err = session
            .execute_prepared("insert_domain", &[&"test", &"user"])
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Query(_)));
        assert_eq!(session.state(), SessionState::Ready);
    }

    assert_eq!(database_count(&dbname).await, 1);
    pool.close().await;
    drop_database(&dbname).await;
}

/// Preparing the pool twice on the same database is harmless.
#[tokio::test]
#[ignore = "requires a running PostgreSQL server"]
async fn test_schema_application_is_idempotent() {
    let dbname = random_dbname();
    let options = options_for(&dbname);
    PgConnectionInit::create_database_if_not_exist(
        options.dbname(),
        options.options_string_without_dbname(),
    )
    .await
    .expect("database creation");

    let init = PgConnectionInit::new(WsvSchema::new(45, 6));
    for _ in 0..2 {
        let pool = init
            .prepare_connection_pool(
                Arc::new(KTimesReconnectionStrategyFactory::new(1)),
                &options,
                2,
                Span::none(),
            )
            .await
            .expect("pool preparation");
        pool.close().await;
    }

    drop_database(&dbname).await;
}

/// Wrong credentials fail both database creation and pool preparation.
#[tokio::test]
#[ignore = "requires a running PostgreSQL server"]
async fn test_invalid_credentials() {
    let bad = format!(
        "{} user=wsv_nonexistent_user password=wrong",
        pg_options_without_dbname()
    );

    let err = PgConnectionInit::create_database_if_not_exist(&random_dbname(), &bad)
        .await
        .unwrap_err();
    assert!(matches!(&err, PgError::Schema(m) if m.starts_with("Connection to PostgreSQL broken")));

    let options = PgOptions::parse(&bad, DEFAULT_DATABASE_NAME).unwrap();
    let err = PgConnectionInit::new(WsvSchema::new(45, 6))
        .prepare_connection_pool(
            Arc::new(KTimesReconnectionStrategyFactory::new(0)),
            &options,
            POOL_SIZE,
            Span::none(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PgError::PoolInit(_)));
}
