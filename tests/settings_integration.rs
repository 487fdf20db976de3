//! Integration tests for storage settings.
//!
//! These tests verify that settings files turn into the options, timeouts
//! and strategies used to build the pool.

use std::io::Write;
use std::time::Duration;

use pretty_assertions::assert_eq;
use wsv_store::postgres::failover::ReconnectOptions;
use wsv_store::postgres::reconnect::Decision;
use wsv_store::postgres::settings::StrategyKind;
use wsv_store::postgres::{DEFAULT_DATABASE_NAME, WsvSchema};
use wsv_store::{PgConnectionInit, PgError, StorageSettings};

const SETTINGS: &str = r#"
    options = "host=db.internal port=5433 user=wsv password='p w' dbname=ledger"
    pool_size = 4

    [reconnection]
    strategy = "k_times"
    max_attempts = 2
    delay = "250ms"
    attempt_timeout = "5s"

    [schema]
    role_permission_bits = 45
    grantable_permission_bits = 6
"#;

/// Test loading settings from a file
#[test]
fn test_settings_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(SETTINGS.as_bytes()).expect("write settings");

    let settings = StorageSettings::from_file(file.path()).expect("settings");
    assert_eq!(settings.pool_size, 4);
    assert_eq!(settings.reconnection.strategy, StrategyKind::KTimes);

    let options = settings.pg_options().expect("options");
    assert_eq!(options.dbname(), "ledger");
    assert!(!options.options_string_without_dbname().contains("ledger"));
    assert!(options.options_string().contains("dbname=ledger"));

    let config = options.to_pg_config().expect("driver config");
    assert_eq!(config.get_user(), Some("wsv"));
    assert_eq!(config.get_password(), Some(&b"p w"[..]));
    assert_eq!(config.get_ports(), &[5433]);
}

/// Test the strategy and timeouts described by the reconnection section
#[test]
fn test_settings_reconnection() {
    let settings = StorageSettings::from_toml(SETTINGS).expect("settings");
    assert_eq!(
        settings.reconnect_options().expect("timeouts"),
        ReconnectOptions {
            connect_timeout: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(5),
        }
    );

    let factory = settings.strategy_factory().expect("factory");
    let mut first = factory.create();
    let retry = Decision::Retry {
        delay: Duration::from_millis(250),
    };
    assert_eq!(first.decide(1), retry);
    assert_eq!(first.decide(2), retry);
    assert_eq!(first.decide(3), Decision::GiveUp);
    assert_eq!(first.attempts_made(), 2);

    // Each session gets a fresh budget.
    let mut second = factory.create();
    assert_eq!(second.decide(1), retry);
}

/// Test the bootstrap built from settings uses the configured schema
#[test]
fn test_bootstrap_from_settings() {
    let settings = StorageSettings::from_toml(SETTINGS).expect("settings");
    let init = PgConnectionInit::from_settings(&settings).expect("bootstrap");
    assert_eq!(init.schema_sql(), WsvSchema::new(45, 6).ddl());
}

/// Test that a missing database falls back to the default one
#[test]
fn test_settings_default_database() {
    let settings = StorageSettings::from_toml(
        r#"
        options = "postgres://wsv@localhost:5432"

        [schema]
        role_permission_bits = 8
        grantable_permission_bits = 8
    "#,
    )
    .expect("settings");

    let options = settings.pg_options().expect("options");
    assert!(options.is_url());
    assert_eq!(options.dbname(), DEFAULT_DATABASE_NAME);
}

/// Test that invalid files are reported as settings errors
#[test]
fn test_settings_errors() {
    let err = StorageSettings::from_file("/nonexistent/wsv/storage.toml").unwrap_err();
    assert!(matches!(err, PgError::Settings(_)));

    let err = StorageSettings::from_toml("options = ").unwrap_err();
    assert!(matches!(err, PgError::Settings(_)));

    let err = StorageSettings::from_toml(&SETTINGS.replace("\"250ms\"", "\"soon\""))
        .and_then(|s| s.strategy_factory().map(|_| ()))
        .unwrap_err();
    assert!(matches!(err, PgError::Settings(_)));
}
