//! Fuzz target for storage settings.
//!
//! Run with:
//! ```bash
//! cargo +nightly fuzz run fuzz_storage_settings
//! ```

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use wsv_postgres::StorageSettings;

/// Settings assembled from fuzzed fields, so most inputs reach past the
/// TOML parser.
#[derive(Debug, Arbitrary)]
struct FuzzSettings {
    options: String,
    pool_size: u8,
    strategy: bool,
    max_attempts: u8,
    delay: String,
    role_permission_bits: u16,
    grantable_permission_bits: u16,
}

impl FuzzSettings {
    fn to_toml(&self) -> String {
        format!(
            "options = \"{}\"\npool_size = {}\n\n[reconnection]\nstrategy = \"{}\"\n\
             max_attempts = {}\ndelay = \"{}\"\n\n[schema]\nrole_permission_bits = {}\n\
             grantable_permission_bits = {}\n",
            sanitize_toml_string(&self.options),
            self.pool_size,
            if self.strategy { "exponential" } else { "k_times" },
            self.max_attempts,
            sanitize_toml_string(&self.delay),
            self.role_permission_bits,
            self.grantable_permission_bits,
        )
    }
}

fn sanitize_toml_string(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '"' | '\\' | '\n' | '\r') && !c.is_control())
        .take(100)
        .collect()
}

fn exercise(settings: &StorageSettings) {
    let _ = settings.pg_options();
    let _ = settings.reconnect_options();
    if let Ok(factory) = settings.strategy_factory() {
        let mut strategy = factory.create();
        for attempt in 1..=4 {
            let _ = strategy.decide(attempt);
        }
    }
}

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Raw input should never panic, only return errors.
        if let Ok(settings) = StorageSettings::from_toml(input) {
            exercise(&settings);
        }
    }

    let mut u = arbitrary::Unstructured::new(data);
    if let Ok(fuzzed) = FuzzSettings::arbitrary(&mut u) {
        if let Ok(settings) = StorageSettings::from_toml(&fuzzed.to_toml()) {
            exercise(&settings);
        }
    }
});
