//! Fuzz target for connection option parsing.
//!
//! Feeds arbitrary strings to the key/value and URL parsers. Whatever parses
//! must split into a database name and a database-less string that parses
//! again to the same database.
//!
//! Run with:
//! ```bash
//! cargo +nightly fuzz run fuzz_pg_options
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use wsv_postgres::{DEFAULT_DATABASE_NAME, PgOptions};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(options) = PgOptions::parse(input, DEFAULT_DATABASE_NAME) else {
        return;
    };

    assert!(!options.dbname().is_empty());
    if !options.is_url() {
        let reparsed = PgOptions::parse(options.options_string(), DEFAULT_DATABASE_NAME)
            .expect("rendered options parse");
        assert_eq!(reparsed.dbname(), options.dbname());
        assert_eq!(
            reparsed.options_string_without_dbname(),
            options.options_string_without_dbname()
        );
    }
    let _ = options.to_pg_config();
});
