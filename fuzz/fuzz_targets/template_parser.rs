//! Fuzz target for the template parser.
//!
//! Run with:
//! ```bash
//! cargo +nightly fuzz run fuzz_template_parser
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use pgstencil_template::parse_template;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Malformed templates must produce errors, never panics.
        let _ = parse_template(input);
    }
});
