//! Fuzz target for settings files.
//!
//! Run with:
//! ```bash
//! cargo +nightly fuzz run fuzz_settings_parser
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use pgstencil_postgres::Settings;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(settings) = Settings::from_toml_str(input) {
            // Whatever parsed must also validate and never leak the password.
            assert!(settings.validate().is_ok());
            let shown = format!("{settings:?}");
            assert!(shown.contains("[REDACTED]"));
        }
    }
});
